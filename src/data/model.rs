use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Column labels every embedding is normalised to.
pub const EMBEDDING_LABELS: [&str; 2] = ["UMAP1", "UMAP2"];

// ---------------------------------------------------------------------------
// MetadataValue – a single cell in a metadata column
// ---------------------------------------------------------------------------

/// A dynamically-typed metadata value.
/// Used as a `BTreeSet` key when collecting distinct values, so it must be `Ord`.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    String(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
    Null,
}

impl Eq for MetadataValue {}

impl PartialOrd for MetadataValue {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MetadataValue {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        use MetadataValue::*;
        fn discriminant(v: &MetadataValue) -> u8 {
            match v {
                Null => 0,
                Bool(_) => 1,
                Integer(_) => 2,
                Float(_) => 3,
                String(_) => 4,
            }
        }
        let da = discriminant(self);
        let db = discriminant(other);
        if da != db {
            return da.cmp(&db);
        }
        match (self, other) {
            (Null, Null) => std::cmp::Ordering::Equal,
            (Bool(a), Bool(b)) => a.cmp(b),
            (Integer(a), Integer(b)) => a.cmp(b),
            (Float(a), Float(b)) => a.total_cmp(b),
            (String(a), String(b)) => a.cmp(b),
            _ => std::cmp::Ordering::Equal,
        }
    }
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataValue::String(s) => write!(f, "{s}"),
            MetadataValue::Integer(i) => write!(f, "{i}"),
            MetadataValue::Float(v) => write!(f, "{v}"),
            MetadataValue::Bool(b) => write!(f, "{b}"),
            MetadataValue::Null => write!(f, "<null>"),
        }
    }
}

impl MetadataValue {
    /// Numeric view of the value, used by range predicates.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetadataValue::Float(v) => Some(*v),
            MetadataValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, MetadataValue::Null)
    }
}

// ---------------------------------------------------------------------------
// Column – one typed metadata attribute
// ---------------------------------------------------------------------------

/// Declared type of a metadata column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Categorical,
    Integer,
    Float,
    Boolean,
    /// Anything the filter layer cannot express (dates, nested values, ...).
    Unsupported,
}

impl ColumnKind {
    pub fn is_numeric(self) -> bool {
        matches!(self, ColumnKind::Integer | ColumnKind::Float)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub kind: ColumnKind,
    pub values: Vec<MetadataValue>,
}

impl Column {
    pub fn new(name: impl Into<String>, kind: ColumnKind, values: Vec<MetadataValue>) -> Self {
        Column {
            name: name.into(),
            kind,
            values,
        }
    }

    /// Build a column whose kind is inferred from its non-null values.
    ///
    /// Integers mixed with floats widen to `Float`; any other mix, or a column
    /// with no non-null values, is `Unsupported`.
    pub fn infer(name: impl Into<String>, values: Vec<MetadataValue>) -> Self {
        let mut kind: Option<ColumnKind> = None;
        for value in values.iter().filter(|v| !v.is_null()) {
            let this = match value {
                MetadataValue::String(_) => ColumnKind::Categorical,
                MetadataValue::Integer(_) => ColumnKind::Integer,
                MetadataValue::Float(_) => ColumnKind::Float,
                MetadataValue::Bool(_) => ColumnKind::Boolean,
                MetadataValue::Null => continue,
            };
            kind = Some(match (kind, this) {
                (None, k) => k,
                (Some(a), b) if a == b => a,
                (Some(ColumnKind::Integer), ColumnKind::Float)
                | (Some(ColumnKind::Float), ColumnKind::Integer) => ColumnKind::Float,
                _ => ColumnKind::Unsupported,
            });
        }
        Column::new(name, kind.unwrap_or(ColumnKind::Unsupported), values)
    }

    /// Sorted distinct non-null values.
    pub fn distinct(&self) -> BTreeSet<&MetadataValue> {
        self.values.iter().filter(|v| !v.is_null()).collect()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Invariant violations raised while assembling a bundle
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq)]
pub enum BundleError {
    #[error("column '{column}' has {actual} values but the table has {expected} cells")]
    ColumnLength {
        column: String,
        expected: usize,
        actual: usize,
    },

    #[error("duplicate cell id '{0}' in {1}")]
    DuplicateCell(String, &'static str),

    #[error("duplicate gene id '{0}' in expression matrix")]
    DuplicateGene(String),

    #[error("{table} does not cover the same cells as the metadata ({detail})")]
    CellUniverse { table: &'static str, detail: String },

    #[error("expression matrix is {genes}x{cells} but holds {actual} values")]
    MatrixShape {
        genes: usize,
        cells: usize,
        actual: usize,
    },

    #[error("negative or non-finite expression value for gene '{gene}' in cell '{cell}'")]
    InvalidExpression { gene: String, cell: String },
}

fn index_of(ids: &[String], table: &'static str) -> Result<HashMap<String, usize>, BundleError> {
    let mut positions = HashMap::with_capacity(ids.len());
    for (i, id) in ids.iter().enumerate() {
        if positions.insert(id.clone(), i).is_some() {
            return Err(BundleError::DuplicateCell(id.clone(), table));
        }
    }
    Ok(positions)
}

// ---------------------------------------------------------------------------
// MetadataTable – cell-indexed attributes
// ---------------------------------------------------------------------------

/// Per-cell metadata. Its cell order is the canonical order of the bundle.
#[derive(Debug, Clone)]
pub struct MetadataTable {
    cells: Vec<String>,
    columns: Vec<Column>,
    positions: HashMap<String, usize>,
}

impl MetadataTable {
    pub fn new(cells: Vec<String>, columns: Vec<Column>) -> Result<Self, BundleError> {
        for column in &columns {
            if column.len() != cells.len() {
                return Err(BundleError::ColumnLength {
                    column: column.name.clone(),
                    expected: cells.len(),
                    actual: column.len(),
                });
            }
        }
        let positions = index_of(&cells, "metadata")?;
        Ok(MetadataTable {
            cells,
            columns,
            positions,
        })
    }

    pub fn cells(&self) -> &[String] {
        &self.cells
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Position of a barcode in the canonical order.
    pub fn position(&self, barcode: &str) -> Option<usize> {
        self.positions.get(barcode).copied()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

// ---------------------------------------------------------------------------
// ExpressionMatrix – gene × cell values
// ---------------------------------------------------------------------------

/// Dense gene × cell matrix stored row-major (one row per gene).
#[derive(Debug, Clone)]
pub struct ExpressionMatrix {
    genes: Vec<String>,
    cells: Vec<String>,
    values: Vec<f64>,
    gene_positions: HashMap<String, usize>,
}

impl ExpressionMatrix {
    pub fn new(genes: Vec<String>, cells: Vec<String>, values: Vec<f64>) -> Result<Self, BundleError> {
        if values.len() != genes.len() * cells.len() {
            return Err(BundleError::MatrixShape {
                genes: genes.len(),
                cells: cells.len(),
                actual: values.len(),
            });
        }
        if let Some(i) = values.iter().position(|v| !v.is_finite() || *v < 0.0) {
            return Err(BundleError::InvalidExpression {
                gene: genes[i / cells.len()].clone(),
                cell: cells[i % cells.len()].clone(),
            });
        }
        let mut gene_positions = HashMap::with_capacity(genes.len());
        for (i, gene) in genes.iter().enumerate() {
            if gene_positions.insert(gene.clone(), i).is_some() {
                return Err(BundleError::DuplicateGene(gene.clone()));
            }
        }
        Ok(ExpressionMatrix {
            genes,
            cells,
            values,
            gene_positions,
        })
    }

    pub fn genes(&self) -> &[String] {
        &self.genes
    }

    pub fn cells(&self) -> &[String] {
        &self.cells
    }

    pub fn gene_position(&self, gene: &str) -> Option<usize> {
        self.gene_positions.get(gene).copied()
    }

    /// All cell values for one gene.
    pub fn row(&self, gene: usize) -> &[f64] {
        let n = self.cells.len();
        &self.values[gene * n..(gene + 1) * n]
    }

    pub fn get(&self, gene: usize, cell: usize) -> f64 {
        self.values[gene * self.cells.len() + cell]
    }

    /// Reorder columns to `order`, where `order[i]` is the current column index
    /// of the cell that should end up at position `i`.
    fn reorder_cells(self, order: &[usize]) -> Self {
        let n = self.cells.len();
        let cells = order.iter().map(|&j| self.cells[j].clone()).collect();
        let mut values = Vec::with_capacity(self.values.len());
        for g in 0..self.genes.len() {
            let row = &self.values[g * n..(g + 1) * n];
            values.extend(order.iter().map(|&j| row[j]));
        }
        ExpressionMatrix {
            cells,
            values,
            ..self
        }
    }
}

// ---------------------------------------------------------------------------
// Embedding – 2D coordinates per cell
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Embedding {
    cells: Vec<String>,
    coords: Vec<[f64; 2]>,
}

impl Embedding {
    pub fn new(cells: Vec<String>, coords: Vec<[f64; 2]>) -> Result<Self, BundleError> {
        if cells.len() != coords.len() {
            return Err(BundleError::ColumnLength {
                column: EMBEDDING_LABELS.join("/"),
                expected: cells.len(),
                actual: coords.len(),
            });
        }
        Ok(Embedding { cells, coords })
    }

    pub fn cells(&self) -> &[String] {
        &self.cells
    }

    pub fn coords(&self) -> &[[f64; 2]] {
        &self.coords
    }

    pub fn labels(&self) -> [&'static str; 2] {
        EMBEDDING_LABELS
    }
}

// ---------------------------------------------------------------------------
// Derived views, built once at load time
// ---------------------------------------------------------------------------

/// Transposed expression (one row per cell, one column per gene), aligned to
/// the metadata order so it can be joined with metadata by position.
#[derive(Debug, Clone)]
pub struct BoxplotView {
    values: Vec<f64>,
    n_genes: usize,
}

impl BoxplotView {
    fn build(expression: &ExpressionMatrix) -> Self {
        let n_genes = expression.genes.len();
        let n_cells = expression.cells.len();
        let mut values = vec![0.0; n_genes * n_cells];
        for g in 0..n_genes {
            for (c, v) in expression.row(g).iter().enumerate() {
                values[c * n_genes + g] = *v;
            }
        }
        BoxplotView { values, n_genes }
    }

    pub fn get(&self, cell: usize, gene: usize) -> f64 {
        self.values[cell * self.n_genes + gene]
    }
}

/// Gene × cell matrix with each gene row standardised to zero mean and unit
/// (population) variance. Constant rows become all zeros.
#[derive(Debug, Clone)]
pub struct HeatmapView {
    values: Vec<f64>,
    n_cells: usize,
}

impl HeatmapView {
    fn build(expression: &ExpressionMatrix) -> Self {
        let n_cells = expression.cells.len();
        let mut values = Vec::with_capacity(expression.values.len());
        for g in 0..expression.genes.len() {
            values.extend(zscore(expression.row(g)));
        }
        HeatmapView { values, n_cells }
    }

    pub fn get(&self, gene: usize, cell: usize) -> f64 {
        self.values[gene * self.n_cells + cell]
    }
}

/// Standardise one row of values.
pub fn zscore(row: &[f64]) -> Vec<f64> {
    if row.is_empty() {
        return Vec::new();
    }
    let n = row.len() as f64;
    let mean = row.iter().sum::<f64>() / n;
    let var = row.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let sd = var.sqrt();
    if sd < f64::EPSILON {
        return vec![0.0; row.len()];
    }
    row.iter().map(|v| (v - mean) / sd).collect()
}

// ---------------------------------------------------------------------------
// DatasetBundle – the complete loaded dataset
// ---------------------------------------------------------------------------

/// Which derived views to precompute when a bundle is assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BundleOptions {
    pub boxplot_view: bool,
    pub heatmap_view: bool,
}

impl Default for BundleOptions {
    fn default() -> Self {
        BundleOptions {
            boxplot_view: true,
            heatmap_view: true,
        }
    }
}

/// Metadata, expression and embedding for one dataset, aligned on the
/// metadata cell order. Immutable once built.
#[derive(Debug, Clone)]
pub struct DatasetBundle {
    metadata: MetadataTable,
    expression: ExpressionMatrix,
    embedding: Embedding,
    boxplot_view: Option<BoxplotView>,
    heatmap_view: Option<HeatmapView>,
}

impl DatasetBundle {
    /// Validate that all tables share one cell universe, align expression and
    /// embedding to the metadata order and build the requested derived views.
    pub fn new(
        metadata: MetadataTable,
        expression: ExpressionMatrix,
        embedding: Embedding,
        options: BundleOptions,
    ) -> Result<Self, BundleError> {
        let expr_order = alignment(&metadata, expression.cells(), "expression")?;
        let embed_order = alignment(&metadata, embedding.cells(), "embedding")?;

        let expression = if is_identity(&expr_order) {
            expression
        } else {
            expression.reorder_cells(&expr_order)
        };
        let embedding = if is_identity(&embed_order) {
            embedding
        } else {
            Embedding {
                cells: metadata.cells().to_vec(),
                coords: embed_order.iter().map(|&j| embedding.coords[j]).collect(),
            }
        };

        let boxplot_view = options.boxplot_view.then(|| BoxplotView::build(&expression));
        let heatmap_view = options.heatmap_view.then(|| HeatmapView::build(&expression));

        Ok(DatasetBundle {
            metadata,
            expression,
            embedding,
            boxplot_view,
            heatmap_view,
        })
    }

    pub fn metadata(&self) -> &MetadataTable {
        &self.metadata
    }

    pub fn expression(&self) -> &ExpressionMatrix {
        &self.expression
    }

    pub fn embedding(&self) -> &Embedding {
        &self.embedding
    }

    pub fn boxplot_view(&self) -> Option<&BoxplotView> {
        self.boxplot_view.as_ref()
    }

    pub fn heatmap_view(&self) -> Option<&HeatmapView> {
        self.heatmap_view.as_ref()
    }

    /// Number of cells.
    pub fn len(&self) -> usize {
        self.metadata.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metadata.is_empty()
    }
}

/// For each metadata cell, the index of that cell in `other`.
fn alignment(
    metadata: &MetadataTable,
    other: &[String],
    table: &'static str,
) -> Result<Vec<usize>, BundleError> {
    if other.len() != metadata.len() {
        return Err(BundleError::CellUniverse {
            table,
            detail: format!("{} cells vs {}", other.len(), metadata.len()),
        });
    }
    let positions = index_of(other, table)?;
    metadata
        .cells()
        .iter()
        .map(|cell| {
            positions.get(cell).copied().ok_or_else(|| BundleError::CellUniverse {
                table,
                detail: format!("cell '{cell}' missing"),
            })
        })
        .collect()
}

fn is_identity(order: &[usize]) -> bool {
    order.iter().enumerate().all(|(i, &j)| i == j)
}


#[cfg(test)]
mod tests {
    use super::*;

    fn cells(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn infer_widens_mixed_numbers_and_rejects_mixed_types() {
        let col = Column::infer(
            "x",
            vec![MetadataValue::Integer(1), MetadataValue::Null, MetadataValue::Float(2.5)],
        );
        assert_eq!(col.kind, ColumnKind::Float);

        let col = Column::infer(
            "y",
            vec![MetadataValue::Integer(1), MetadataValue::String("a".into())],
        );
        assert_eq!(col.kind, ColumnKind::Unsupported);

        let col = Column::infer("z", vec![MetadataValue::Null]);
        assert_eq!(col.kind, ColumnKind::Unsupported);
    }

    #[test]
    fn bundle_aligns_expression_and_embedding_to_metadata_order() {
        let metadata = MetadataTable::new(cells(&["a", "b", "c"]), vec![]).unwrap();
        // Expression columns arrive as c, a, b.
        let expression =
            ExpressionMatrix::new(cells(&["g"]), cells(&["c", "a", "b"]), vec![3.0, 1.0, 2.0]).unwrap();
        let embedding = Embedding::new(
            cells(&["b", "c", "a"]),
            vec![[2.0, 2.0], [3.0, 3.0], [1.0, 1.0]],
        )
        .unwrap();

        let bundle =
            DatasetBundle::new(metadata, expression, embedding, BundleOptions::default()).unwrap();

        assert_eq!(bundle.expression().cells(), cells(&["a", "b", "c"]).as_slice());
        assert_eq!(bundle.expression().row(0), &[1.0, 2.0, 3.0]);
        assert_eq!(bundle.embedding().coords(), &[[1.0, 1.0], [2.0, 2.0], [3.0, 3.0]]);
        assert_eq!(bundle.boxplot_view().unwrap().get(2, 0), 3.0);
    }

    #[test]
    fn bundle_rejects_mismatched_cell_universe() {
        let metadata = MetadataTable::new(cells(&["a", "b"]), vec![]).unwrap();
        let expression =
            ExpressionMatrix::new(cells(&["g"]), cells(&["a", "x"]), vec![1.0, 2.0]).unwrap();
        let embedding = Embedding::new(cells(&["a", "b"]), vec![[0.0, 0.0]; 2]).unwrap();

        let err = DatasetBundle::new(metadata, expression, embedding, BundleOptions::default())
            .unwrap_err();
        assert!(matches!(err, BundleError::CellUniverse { table: "expression", .. }));
    }

    #[test]
    fn expression_rejects_negative_values() {
        let err = ExpressionMatrix::new(cells(&["g"]), cells(&["a", "b"]), vec![1.0, -0.5])
            .unwrap_err();
        assert_eq!(
            err,
            BundleError::InvalidExpression {
                gene: "g".into(),
                cell: "b".into()
            }
        );
    }

    #[test]
    fn metadata_rejects_duplicate_barcodes() {
        let err = MetadataTable::new(cells(&["a", "a"]), vec![]).unwrap_err();
        assert_eq!(err, BundleError::DuplicateCell("a".into(), "metadata"));
    }

    #[test]
    fn expression_rejects_duplicate_genes() {
        let genes = cells(&["CD3E", "LYZ", "CD3E"]);
        let err = ExpressionMatrix::new(genes, cells(&["a"]), vec![1.0, 2.0, 3.0]).unwrap_err();
        assert_eq!(err, BundleError::DuplicateGene("CD3E".into()));
    }

    #[test]
    fn heatmap_view_is_row_standardised() {
        let bundle = fixtures::small_bundle();
        let view = bundle.heatmap_view().unwrap();
        let row: Vec<f64> = (0..bundle.len()).map(|c| view.get(0, c)).collect();
        let mean = row.iter().sum::<f64>() / row.len() as f64;
        assert!(mean.abs() < 1e-9);
        assert_eq!(zscore(&[2.0, 2.0, 2.0]), vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn views_are_optional() {
        let bundle = fixtures::small_bundle();
        let rebuilt = DatasetBundle::new(
            bundle.metadata().clone(),
            bundle.expression().clone(),
            bundle.embedding().clone(),
            BundleOptions {
                boxplot_view: false,
                heatmap_view: false,
            },
        )
        .unwrap();
        assert!(rebuilt.boxplot_view().is_none());
        assert!(rebuilt.heatmap_view().is_none());
    }
}
