use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::model::{MetadataTable, MetadataValue};
use super::schema::{FieldKind, FilterField};
use crate::error::{ScopeError, ScopeResult};

// ---------------------------------------------------------------------------
// Predicates
// ---------------------------------------------------------------------------

/// The state of one filter control.
///
/// Serialised as a bare JSON array: a list of strings for categorical fields,
/// a `[low, high]` pair for numeric ranges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Predicate {
    Values(BTreeSet<String>),
    Range([f64; 2]),
}

impl Predicate {
    /// The empty multi-select: matches everything.
    pub fn any() -> Self {
        Predicate::Values(BTreeSet::new())
    }

    pub fn values<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Predicate::Values(values.into_iter().map(Into::into).collect())
    }

    pub fn range(low: f64, high: f64) -> Self {
        Predicate::Range([low, high])
    }

    /// Whether the predicate constrains anything at all.
    pub fn is_active(&self) -> bool {
        match self {
            Predicate::Values(values) => !values.is_empty(),
            Predicate::Range(_) => true,
        }
    }
}

/// Per-field predicates keyed by column name. Missing fields are unconstrained.
pub type FilterState = BTreeMap<String, Predicate>;

/// What to do when a field's predicate matches no cell at all.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyMatchPolicy {
    /// Ignore that field's constraint and keep the other filters' result.
    #[default]
    SkipField,
    /// Intersect anyway, so the selection becomes empty.
    Propagate,
}

// ---------------------------------------------------------------------------
// Grouping fields (colour / shape)
// ---------------------------------------------------------------------------

/// The active colour and shape fields. Each slot holds at most one field;
/// choosing a new one replaces the previous choice.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupingChoice {
    color: Option<String>,
    shape: Option<String>,
}

impl GroupingChoice {
    pub fn new(color: Option<&str>, shape: Option<&str>) -> Self {
        GroupingChoice {
            color: color.map(str::to_string),
            shape: shape.map(str::to_string),
        }
    }

    pub fn color(&self) -> Option<&str> {
        self.color.as_deref()
    }

    pub fn shape(&self) -> Option<&str> {
        self.shape.as_deref()
    }

    pub fn select_color(&mut self, field: Option<&str>) {
        self.color = field.map(str::to_string);
    }

    pub fn select_shape(&mut self, field: Option<&str>) {
        self.shape = field.map(str::to_string);
    }

    /// Drop choices that do not name a field of `schema`.
    pub fn reconcile(&self, schema: &[FilterField]) -> GroupingChoice {
        let keep = |field: &Option<String>| {
            field.as_ref().and_then(|name| {
                if schema.iter().any(|f| &f.name == name) {
                    Some(name.clone())
                } else {
                    log::warn!("grouping field '{name}' is not in the current schema, ignoring");
                    None
                }
            })
        };
        GroupingChoice {
            color: keep(&self.color),
            shape: keep(&self.shape),
        }
    }
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

/// Labels of one metadata field for the selected cells.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupingAttr {
    pub field: String,
    pub labels: Vec<String>,
}

/// The materialised result of applying the active filters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Selection {
    /// Positions into the metadata cell order, ascending.
    cells: Vec<usize>,
    color: Option<GroupingAttr>,
    shape: Option<GroupingAttr>,
}

impl Selection {
    /// A selection with every cell and no grouping.
    pub fn all(metadata: &MetadataTable) -> Self {
        Selection {
            cells: (0..metadata.len()).collect(),
            color: None,
            shape: None,
        }
    }

    pub fn cell_index(&self) -> &[usize] {
        &self.cells
    }

    pub fn color_attr(&self) -> Option<&GroupingAttr> {
        self.color.as_ref()
    }

    pub fn shape_attr(&self) -> Option<&GroupingAttr> {
        self.shape.as_ref()
    }

    pub fn barcodes<'a>(&'a self, metadata: &'a MetadataTable) -> impl Iterator<Item = &'a str> + 'a {
        self.cells.iter().map(|&c| metadata.cells()[c].as_str())
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Combines filter predicates into a [`Selection`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectionEngine {
    policy: EmptyMatchPolicy,
}

impl SelectionEngine {
    pub fn new(policy: EmptyMatchPolicy) -> Self {
        SelectionEngine { policy }
    }

    /// Apply every active predicate that names a schema field, then attach
    /// the grouping labels for the surviving cells.
    ///
    /// Predicates for names outside the schema are ignored. A predicate whose
    /// shape does not fit its field is a validation error.
    pub fn compute(
        &self,
        metadata: &MetadataTable,
        schema: &[FilterField],
        predicates: &FilterState,
        grouping: &GroupingChoice,
    ) -> ScopeResult<Selection> {
        let mut selected: BTreeSet<usize> = (0..metadata.len()).collect();

        for field in schema {
            let Some(predicate) = predicates.get(&field.name) else {
                continue;
            };
            let Some(matching) = candidates(metadata, field, predicate)? else {
                continue;
            };
            if matching.is_empty() && self.policy == EmptyMatchPolicy::SkipField {
                log::debug!("filter on '{}' matches no cells, skipping it", field.name);
                continue;
            }
            selected = selected.intersection(&matching).copied().collect();
        }

        let cells: Vec<usize> = selected.into_iter().collect();
        let grouping = grouping.reconcile(schema);
        let color = grouping.color().map(|f| grouping_attr(metadata, f, &cells));
        let shape = grouping.shape().map(|f| grouping_attr(metadata, f, &cells));

        log::debug!(
            "selection: {} of {} cells (color: {:?}, shape: {:?})",
            cells.len(),
            metadata.len(),
            grouping.color(),
            grouping.shape()
        );

        Ok(Selection {
            cells,
            color,
            shape,
        })
    }
}

/// Cells matching one field's predicate, or `None` when the predicate is unset.
fn candidates(
    metadata: &MetadataTable,
    field: &FilterField,
    predicate: &Predicate,
) -> ScopeResult<Option<BTreeSet<usize>>> {
    if !predicate.is_active() {
        return Ok(None);
    }
    let Some(column) = metadata.column(&field.name) else {
        return Ok(None);
    };
    let matching = match (&field.kind, predicate) {
        (FieldKind::Categorical { .. }, Predicate::Values(wanted)) => column
            .values
            .iter()
            .enumerate()
            .filter(|(_, v)| v.as_str().is_some_and(|s| wanted.contains(s)))
            .map(|(i, _)| i)
            .collect(),
        (FieldKind::NumericRange { .. }, Predicate::Range([low, high])) => {
            if !low.is_finite() || !high.is_finite() || low > high {
                return Err(ScopeError::Validation(format!(
                    "invalid range [{low}, {high}] for '{}'",
                    field.name
                )));
            }
            // The full domain is the control's resting state; it must not drop nulls.
            if covers_domain(field, *low, *high) {
                return Ok(None);
            }
            column
                .values
                .iter()
                .enumerate()
                .filter(|(_, v)| v.as_f64().is_some_and(|x| *low <= x && x <= *high))
                .map(|(i, _)| i)
                .collect()
        }
        (FieldKind::Categorical { .. }, Predicate::Range(_)) => {
            return Err(ScopeError::Validation(format!(
                "'{}' is categorical and takes a list of values, not a range",
                field.name
            )));
        }
        (FieldKind::NumericRange { .. }, Predicate::Values(_)) => {
            return Err(ScopeError::Validation(format!(
                "'{}' is numeric and takes a [low, high] range",
                field.name
            )));
        }
    };
    Ok(Some(matching))
}

fn covers_domain(field: &FilterField, low: f64, high: f64) -> bool {
    match field.kind {
        FieldKind::NumericRange { min, max, .. } => low <= min as f64 && high >= max as f64,
        FieldKind::Categorical { .. } => false,
    }
}

fn grouping_attr(metadata: &MetadataTable, field: &str, cells: &[usize]) -> GroupingAttr {
    let labels = match metadata.column(field) {
        Some(column) => cells.iter().map(|&c| column.values[c].to_string()).collect(),
        None => vec![MetadataValue::Null.to_string(); cells.len()],
    };
    GroupingAttr {
        field: field.to_string(),
        labels,
    }
}

/// Human-readable summary of the active filters.
pub fn describe_active(schema: &[FilterField], predicates: &FilterState) -> String {
    let parts: Vec<String> = schema
        .iter()
        .filter_map(|field| {
            let predicate = predicates.get(&field.name)?;
            match predicate {
                Predicate::Values(values) if !values.is_empty() => Some(format!(
                    "{}: {}",
                    field.label,
                    values.iter().cloned().collect::<Vec<_>>().join(", ")
                )),
                Predicate::Range([low, high]) if !covers_domain(field, *low, *high) => {
                    Some(format!("{}: {low} – {high}", field.label))
                }
                _ => None,
            }
        })
        .collect();

    if parts.is_empty() {
        "No filters applied".to_string()
    } else {
        format!("Active filters: {}", parts.join(" | "))
    }
}
