use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::filter::Predicate;
use super::model::{Column, ColumnKind, MetadataTable};

/// Step used for numeric range controls when no override is configured.
pub const DEFAULT_NUMERIC_STEP: i64 = 100;

// ---------------------------------------------------------------------------
// FilterField – one user-controllable constraint
// ---------------------------------------------------------------------------

/// Declarative description of a filter over one metadata column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterField {
    pub name: String,
    pub label: String,
    #[serde(flatten)]
    pub kind: FieldKind,
    /// Initial control state. Both defaults match every cell; a numeric range
    /// covering `[min, max]` counts as unset, so null cells stay selected.
    pub default: Predicate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldKind {
    Categorical { values: Vec<String> },
    NumericRange { min: i64, max: i64, step: i64 },
}

impl FilterField {
    pub fn is_categorical(&self) -> bool {
        matches!(self.kind, FieldKind::Categorical { .. })
    }
}

/// Look up a field by column name.
pub fn find_field<'a>(schema: &'a [FilterField], name: &str) -> Option<&'a FilterField> {
    schema.iter().find(|f| f.name == name)
}

// ---------------------------------------------------------------------------
// Deriver
// ---------------------------------------------------------------------------

/// Classifies metadata columns into filter fields.
#[derive(Debug, Clone)]
pub struct SchemaDeriver {
    default_step: i64,
    step_overrides: BTreeMap<String, i64>,
}

impl Default for SchemaDeriver {
    fn default() -> Self {
        SchemaDeriver {
            default_step: DEFAULT_NUMERIC_STEP,
            step_overrides: BTreeMap::new(),
        }
    }
}

impl SchemaDeriver {
    pub fn new(default_step: i64, step_overrides: BTreeMap<String, i64>) -> Self {
        SchemaDeriver {
            default_step,
            step_overrides,
        }
    }

    /// Derive the schema in column order. Columns that are neither text-like
    /// nor numeric are left out, as are numeric columns with no finite values.
    pub fn derive(&self, metadata: &MetadataTable) -> Vec<FilterField> {
        metadata
            .columns()
            .iter()
            .filter_map(|column| match column.kind {
                ColumnKind::Categorical => Some(categorical_field(column)),
                ColumnKind::Integer | ColumnKind::Float => self.numeric_field(column),
                ColumnKind::Boolean | ColumnKind::Unsupported => {
                    log::debug!("column '{}' is not filterable, skipping", column.name);
                    None
                }
            })
            .collect()
    }

    fn numeric_field(&self, column: &Column) -> Option<FilterField> {
        let (lo, hi) = column
            .values
            .iter()
            .filter_map(|v| v.as_f64())
            .filter(|v| v.is_finite())
            .fold(None, |acc: Option<(f64, f64)>, v| match acc {
                None => Some((v, v)),
                Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
            })?;
        let min = lo.floor() as i64;
        let max = hi.ceil() as i64;
        let step = self
            .step_overrides
            .get(&column.name)
            .copied()
            .unwrap_or(self.default_step);
        Some(FilterField {
            name: column.name.clone(),
            label: column.name.clone(),
            kind: FieldKind::NumericRange { min, max, step },
            default: Predicate::Range([min as f64, max as f64]),
        })
    }
}

fn categorical_field(column: &Column) -> FilterField {
    // MetadataValue orders strings lexicographically, so `distinct` is sorted.
    let values = column.distinct().into_iter().map(|v| v.to_string()).collect();
    FilterField {
        name: column.name.clone(),
        label: column.name.clone(),
        kind: FieldKind::Categorical { values },
        default: Predicate::any(),
    }
}

/// Derive with the default step policy.
pub fn derive_schema(metadata: &MetadataTable) -> Vec<FilterField> {
    SchemaDeriver::default().derive(metadata)
}
