use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::filter::{GroupingAttr, Selection};
use super::model::{zscore, DatasetBundle, EMBEDDING_LABELS};
use crate::error::{ScopeError, ScopeResult};

/// Default upper bound on the number of features per expression plot.
pub const DEFAULT_MAX_FEATURES: usize = 60;

/// Heatmap tick labels are suppressed once rows or columns exceed this many
/// multiples of `max_features`.
pub const DEFAULT_HEATMAP_LABEL_MULTIPLE: usize = 2;

// ---------------------------------------------------------------------------
// Plot kinds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlotKind {
    Boxplot,
    Violin,
    Umap,
    Heatmap,
}

impl PlotKind {
    pub const ALL: [PlotKind; 4] = [
        PlotKind::Boxplot,
        PlotKind::Violin,
        PlotKind::Umap,
        PlotKind::Heatmap,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PlotKind::Boxplot => "boxplot",
            PlotKind::Violin => "violin",
            PlotKind::Umap => "umap",
            PlotKind::Heatmap => "heatmap",
        }
    }
}

impl fmt::Display for PlotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlotKind {
    type Err = ScopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        PlotKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == wanted)
            .ok_or_else(|| {
                ScopeError::Validation(format!(
                    "unknown plot kind '{s}' (expected one of boxplot, violin, umap, heatmap)"
                ))
            })
    }
}

// ---------------------------------------------------------------------------
// Projected tables
// ---------------------------------------------------------------------------

/// One (cell, feature) observation for box and violin plots.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExpressionRow {
    pub cell: String,
    pub feature: String,
    pub value: f64,
    pub color: Option<String>,
    pub shape: Option<String>,
}

/// One embedded cell for scatter plots.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbeddingRow {
    pub cell: String,
    pub x: f64,
    pub y: f64,
    pub color: Option<String>,
    pub shape: Option<String>,
}

/// Z-scored gene × cell block, row-major.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeatmapGrid {
    pub genes: Vec<String>,
    pub cells: Vec<String>,
    pub values: Vec<f64>,
    /// Rendering hint: too many rows or columns for readable tick labels.
    pub suppress_tick_labels: bool,
}

impl HeatmapGrid {
    pub fn get(&self, gene: usize, cell: usize) -> f64 {
        self.values[gene * self.cells.len() + cell]
    }
}

/// The slice of a dataset one plot needs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "layout", rename_all = "snake_case")]
pub enum ProjectedTable {
    Expression { rows: Vec<ExpressionRow> },
    Embedding { axes: [String; 2], rows: Vec<EmbeddingRow> },
    Heatmap(HeatmapGrid),
}

impl ProjectedTable {
    /// Number of rows (observations, cells, or genes for a heatmap).
    pub fn len(&self) -> usize {
        match self {
            ProjectedTable::Expression { rows } => rows.len(),
            ProjectedTable::Embedding { rows, .. } => rows.len(),
            ProjectedTable::Heatmap(grid) => grid.genes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Projection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProjectionLimits {
    pub max_features: usize,
    pub heatmap_label_multiple: usize,
}

impl Default for ProjectionLimits {
    fn default() -> Self {
        ProjectionLimits {
            max_features: DEFAULT_MAX_FEATURES,
            heatmap_label_multiple: DEFAULT_HEATMAP_LABEL_MULTIPLE,
        }
    }
}

impl ProjectionLimits {
    fn label_threshold(&self) -> usize {
        self.max_features.saturating_mul(self.heatmap_label_multiple)
    }
}

/// Extract the rows and columns `kind` needs for `selection`.
pub fn project(
    bundle: &DatasetBundle,
    selection: &Selection,
    kind: PlotKind,
    features: &[String],
    limits: &ProjectionLimits,
) -> ScopeResult<ProjectedTable> {
    if selection.cell_index().last().is_some_and(|&c| c >= bundle.len()) {
        return Err(ScopeError::Validation(
            "selection refers to cells outside this dataset".to_string(),
        ));
    }

    let table = match kind {
        PlotKind::Boxplot | PlotKind::Violin => {
            check_feature_count(kind, features, limits)?;
            let genes = gene_positions(bundle, features)?;
            expression_rows(bundle, selection, features, &genes)
        }
        PlotKind::Umap => embedding_rows(bundle, selection),
        PlotKind::Heatmap => heatmap(bundle, selection, features, limits)?,
    };

    log::debug!(
        "projected {kind}: {} rows for {} cells",
        table.len(),
        selection.len()
    );
    Ok(table)
}

fn check_feature_count(
    kind: PlotKind,
    features: &[String],
    limits: &ProjectionLimits,
) -> ScopeResult<()> {
    if features.is_empty() {
        return Err(ScopeError::Validation(format!(
            "{kind} needs at least 1 feature"
        )));
    }
    if features.len() > limits.max_features {
        return Err(ScopeError::Validation(format!(
            "{kind} accepts at most {} features, got {}",
            limits.max_features,
            features.len()
        )));
    }
    Ok(())
}

fn gene_positions(bundle: &DatasetBundle, features: &[String]) -> ScopeResult<Vec<usize>> {
    features
        .iter()
        .map(|gene| {
            bundle
                .expression()
                .gene_position(gene)
                .ok_or_else(|| ScopeError::Validation(format!("unknown feature '{gene}'")))
        })
        .collect()
}

fn label_at(attr: Option<&GroupingAttr>, i: usize) -> Option<String> {
    attr.map(|a| a.labels[i].clone())
}

fn expression_rows(
    bundle: &DatasetBundle,
    selection: &Selection,
    features: &[String],
    genes: &[usize],
) -> ProjectedTable {
    let barcodes = bundle.metadata().cells();
    let mut rows = Vec::with_capacity(selection.len() * genes.len());
    for (i, &cell) in selection.cell_index().iter().enumerate() {
        let color = label_at(selection.color_attr(), i);
        let shape = label_at(selection.shape_attr(), i);
        for (feature, &gene) in features.iter().zip(genes) {
            let value = match bundle.boxplot_view() {
                Some(view) => view.get(cell, gene),
                None => bundle.expression().get(gene, cell),
            };
            rows.push(ExpressionRow {
                cell: barcodes[cell].clone(),
                feature: feature.clone(),
                value,
                color: color.clone(),
                shape: shape.clone(),
            });
        }
    }
    ProjectedTable::Expression { rows }
}

fn embedding_rows(bundle: &DatasetBundle, selection: &Selection) -> ProjectedTable {
    let barcodes = bundle.metadata().cells();
    let coords = bundle.embedding().coords();
    let rows = selection
        .cell_index()
        .iter()
        .enumerate()
        .map(|(i, &cell)| EmbeddingRow {
            cell: barcodes[cell].clone(),
            x: coords[cell][0],
            y: coords[cell][1],
            color: label_at(selection.color_attr(), i),
            shape: label_at(selection.shape_attr(), i),
        })
        .collect();
    ProjectedTable::Embedding {
        axes: EMBEDDING_LABELS.map(str::to_string),
        rows,
    }
}

fn heatmap(
    bundle: &DatasetBundle,
    selection: &Selection,
    features: &[String],
    limits: &ProjectionLimits,
) -> ScopeResult<ProjectedTable> {
    let expression = bundle.expression();
    let (genes, positions): (Vec<String>, Vec<usize>) = if features.is_empty() {
        expression.genes().iter().cloned().zip(0..).unzip()
    } else {
        (features.to_vec(), gene_positions(bundle, features)?)
    };

    let cells: Vec<String> = selection.barcodes(bundle.metadata()).map(str::to_string).collect();
    let mut values = Vec::with_capacity(genes.len() * cells.len());
    for &gene in &positions {
        match bundle.heatmap_view() {
            Some(view) => values.extend(selection.cell_index().iter().map(|&c| view.get(gene, c))),
            None => {
                // Standardise over the full row so the result matches the precomputed view.
                let row = zscore(expression.row(gene));
                values.extend(selection.cell_index().iter().map(|&c| row[c]));
            }
        }
    }

    let threshold = limits.label_threshold();
    let suppress_tick_labels = genes.len() > threshold || cells.len() > threshold;
    Ok(ProjectedTable::Heatmap(HeatmapGrid {
        genes,
        cells,
        values,
        suppress_tick_labels,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::filter::{FilterState, GroupingChoice, Predicate, SelectionEngine};
    use crate::data::model::fixtures::small_bundle;
    use crate::data::model::{BundleOptions, DatasetBundle};
    use crate::data::schema::derive_schema;

    fn select(bundle: &DatasetBundle, predicates: FilterState, grouping: GroupingChoice) -> Selection {
        let schema = derive_schema(bundle.metadata());
        SelectionEngine::default()
            .compute(bundle.metadata(), &schema, &predicates, &grouping)
            .unwrap()
    }

    fn genes(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_plot_kinds() {
        assert_eq!("Violin".parse::<PlotKind>().unwrap(), PlotKind::Violin);
        assert_eq!(" umap ".parse::<PlotKind>().unwrap(), PlotKind::Umap);
        let err = "scatter3d".parse::<PlotKind>().unwrap_err();
        assert!(matches!(err, ScopeError::Validation(_)));
    }

    #[test]
    fn rejects_too_many_features() {
        let bundle = small_bundle();
        let selection = Selection::all(bundle.metadata());
        let features: Vec<String> = (0..61).map(|i| format!("G{i}")).collect();

        let err = project(
            &bundle,
            &selection,
            PlotKind::Boxplot,
            &features,
            &ProjectionLimits::default(),
        )
        .unwrap_err();

        match err {
            ScopeError::Validation(msg) => assert!(msg.contains("60"), "{msg}"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn rejects_empty_and_unknown_features() {
        let bundle = small_bundle();
        let selection = Selection::all(bundle.metadata());
        let limits = ProjectionLimits::default();

        let err = project(&bundle, &selection, PlotKind::Violin, &[], &limits).unwrap_err();
        assert!(err.to_string().contains("at least 1"));

        let err = project(&bundle, &selection, PlotKind::Violin, &genes(&["NOPE"]), &limits)
            .unwrap_err();
        assert!(err.to_string().contains("NOPE"));
    }

    #[test]
    fn boxplot_rows_cover_selected_cells_and_features() {
        let bundle = small_bundle();
        let selection = select(
            &bundle,
            FilterState::from([("cell_type".to_string(), Predicate::values(["T"]))]),
            GroupingChoice::new(Some("cell_type"), Some("sample")),
        );

        let table = project(
            &bundle,
            &selection,
            PlotKind::Boxplot,
            &genes(&["CD3E", "LYZ"]),
            &ProjectionLimits::default(),
        )
        .unwrap();

        let ProjectedTable::Expression { rows } = table else {
            panic!("expected expression rows");
        };
        let observed: Vec<(&str, &str, f64, Option<&str>)> = rows
            .iter()
            .map(|r| (r.cell.as_str(), r.feature.as_str(), r.value, r.shape.as_deref()))
            .collect();
        assert_eq!(
            observed,
            [
                ("C1", "CD3E", 5.0, Some("S1")),
                ("C1", "LYZ", 0.0, Some("S1")),
                ("C4", "CD3E", 4.0, Some("S2")),
                ("C4", "LYZ", 1.0, Some("S2")),
            ]
        );
        assert!(rows.iter().all(|r| r.color.as_deref() == Some("T")));
    }

    #[test]
    fn expression_rows_without_precomputed_view_match() {
        let bundle = small_bundle();
        let bare = DatasetBundle::new(
            bundle.metadata().clone(),
            bundle.expression().clone(),
            bundle.embedding().clone(),
            BundleOptions {
                boxplot_view: false,
                heatmap_view: false,
            },
        )
        .unwrap();
        let selection = Selection::all(bundle.metadata());
        let limits = ProjectionLimits::default();

        for kind in [PlotKind::Boxplot, PlotKind::Heatmap] {
            let features = genes(&["MS4A1", "LYZ"]);
            assert_eq!(
                project(&bundle, &selection, kind, &features, &limits).unwrap(),
                project(&bare, &selection, kind, &features, &limits).unwrap()
            );
        }
    }

    #[test]
    fn umap_ignores_features_and_keeps_selection_order() {
        let bundle = small_bundle();
        let selection = select(
            &bundle,
            FilterState::from([("sample".to_string(), Predicate::values(["S2"]))]),
            GroupingChoice::new(Some("cell_type"), None),
        );

        let table = project(
            &bundle,
            &selection,
            PlotKind::Umap,
            &genes(&["whatever"]),
            &ProjectionLimits::default(),
        )
        .unwrap();

        let ProjectedTable::Embedding { axes, rows } = table else {
            panic!("expected embedding rows");
        };
        assert_eq!(axes, ["UMAP1", "UMAP2"]);
        let cells: Vec<_> = rows.iter().map(|r| r.cell.as_str()).collect();
        assert_eq!(cells, ["C4", "C5", "C6"]);
        assert_eq!((rows[0].x, rows[0].y), (3.0, -3.0));
        assert_eq!(rows[2].color.as_deref(), Some("Mono"));
        assert!(rows.iter().all(|r| r.shape.is_none()));
    }

    #[test]
    fn heatmap_defaults_to_all_genes() {
        let bundle = small_bundle();
        let selection = select(
            &bundle,
            FilterState::from([("cell_type".to_string(), Predicate::values(["B", "T"]))]),
            GroupingChoice::default(),
        );

        let table = project(
            &bundle,
            &selection,
            PlotKind::Heatmap,
            &[],
            &ProjectionLimits::default(),
        )
        .unwrap();

        let ProjectedTable::Heatmap(grid) = table else {
            panic!("expected heatmap");
        };
        assert_eq!(grid.genes, ["CD3E", "MS4A1", "LYZ"]);
        assert_eq!(grid.cells, ["C1", "C2", "C4", "C5"]);
        assert_eq!(grid.values.len(), 12);
        assert!(!grid.suppress_tick_labels);
        assert_eq!(grid.get(0, 0), bundle.heatmap_view().unwrap().get(0, 0));
    }

    #[test]
    fn heatmap_suppresses_labels_past_threshold() {
        let bundle = small_bundle();
        let selection = Selection::all(bundle.metadata());
        let limits = ProjectionLimits {
            max_features: 1,
            heatmap_label_multiple: 2,
        };

        let ProjectedTable::Heatmap(grid) =
            project(&bundle, &selection, PlotKind::Heatmap, &[], &limits).unwrap()
        else {
            panic!("expected heatmap");
        };
        assert!(grid.suppress_tick_labels);
    }
}
