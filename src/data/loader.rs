use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use arrow::array::{Array, AsArray, FixedSizeListArray, LargeListArray, ListArray};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Float64Type, Int64Type};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde_json::Value as JsonValue;

use super::model::{
    BundleOptions, Column, ColumnKind, DatasetBundle, Embedding, ExpressionMatrix, MetadataTable,
    MetadataValue,
};

/// Field holding the cell id in every supported layout.
pub const BARCODE_FIELD: &str = "barcode";
/// Field holding the two embedding coordinates.
pub const EMBEDDING_FIELD: &str = "embedding";
/// Field holding the per-cell expression vector (ordered like the gene list).
pub const EXPRESSION_FIELD: &str = "expression";
/// Arrow schema metadata key carrying the gene ids of a Parquet bundle.
pub const GENES_METADATA_KEY: &str = "genes";

/// File extensions [`FileAdapter`] understands.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["parquet", "pq", "json"];

// ---------------------------------------------------------------------------
// Adapter boundary
// ---------------------------------------------------------------------------

/// Turns a file on disk into a [`DatasetBundle`].
///
/// Everything format-specific lives behind this trait; the session only sees
/// the bundle or the adapter's error message.
pub trait ExtractionAdapter {
    fn load(&self, path: &Path) -> Result<DatasetBundle>;
}

/// Reads the cell-major JSON and Parquet layouts.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileAdapter {
    options: BundleOptions,
}

impl FileAdapter {
    pub fn new(options: BundleOptions) -> Self {
        FileAdapter { options }
    }
}

impl ExtractionAdapter for FileAdapter {
    fn load(&self, path: &Path) -> Result<DatasetBundle> {
        load_file(path, self.options)
    }
}

/// Load a bundle from a file.  Dispatch by extension.
///
/// Supported formats:
/// * `.parquet` / `.pq` – one row per cell, gene ids in the schema metadata
/// * `.json`            – `{ "genes": [...], "cells": [ {...}, ... ] }`
pub fn load_file(path: &Path, options: BundleOptions) -> Result<DatasetBundle> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let bundle = match ext.as_str() {
        "parquet" | "pq" => load_parquet(path, options),
        "json" => load_json(path, options),
        other => bail!("Unsupported file extension: .{other}"),
    }
    .with_context(|| format!("loading {}", path.display()))?;

    log::info!(
        "Loaded {} cells x {} genes with {} metadata columns from {}",
        bundle.len(),
        bundle.expression().genes().len(),
        bundle.metadata().columns().len(),
        path.display()
    );
    Ok(bundle)
}

/// Rows collected from either format before the bundle is assembled.
#[derive(Default)]
struct CellRows {
    barcodes: Vec<String>,
    coords: Vec<[f64; 2]>,
    /// Cell-major: one expression vector per cell.
    expression: Vec<Vec<f64>>,
}

impl CellRows {
    fn push(
        &mut self,
        barcode: String,
        embedding: Vec<f64>,
        expression: Vec<f64>,
        n_genes: usize,
    ) -> Result<()> {
        let row = self.barcodes.len();
        let &[x, y] = embedding.as_slice() else {
            bail!(
                "Row {row}: '{EMBEDDING_FIELD}' has {} values, expected 2",
                embedding.len()
            );
        };
        if expression.len() != n_genes {
            bail!(
                "Row {row}: '{EXPRESSION_FIELD}' has {} values but {n_genes} genes are declared",
                expression.len()
            );
        }
        self.barcodes.push(barcode);
        self.coords.push([x, y]);
        self.expression.push(expression);
        Ok(())
    }

    fn into_bundle(
        self,
        genes: Vec<String>,
        columns: Vec<Column>,
        options: BundleOptions,
    ) -> Result<DatasetBundle> {
        let n_cells = self.barcodes.len();
        let mut values = vec![0.0; genes.len() * n_cells];
        for (c, row) in self.expression.iter().enumerate() {
            for (g, v) in row.iter().enumerate() {
                values[g * n_cells + c] = *v;
            }
        }
        let metadata = MetadataTable::new(self.barcodes.clone(), columns)?;
        let expression = ExpressionMatrix::new(genes, self.barcodes.clone(), values)?;
        let embedding = Embedding::new(self.barcodes, self.coords)?;
        Ok(DatasetBundle::new(metadata, expression, embedding, options)?)
    }
}

fn is_reserved(name: &str) -> bool {
    name == BARCODE_FIELD || name == EMBEDDING_FIELD || name == EXPRESSION_FIELD
}

// ---------------------------------------------------------------------------
// JSON loader
// ---------------------------------------------------------------------------

/// Expected JSON layout (one record per cell):
///
/// ```json
/// {
///   "genes": ["CD3E", "MS4A1"],
///   "cells": [
///     { "barcode": "AAACCTG-1", "embedding": [1.2, -0.4],
///       "expression": [3.0, 0.0], "cell_type": "T", "n_genes": 1200 },
///     ...
///   ]
/// }
/// ```
///
/// Every key other than `barcode`, `embedding` and `expression` becomes a
/// metadata column, in order of first appearance; missing keys are null.
fn load_json(path: &Path, options: BundleOptions) -> Result<DatasetBundle> {
    let text = std::fs::read_to_string(path).context("reading JSON file")?;
    let root: JsonValue = serde_json::from_str(&text).context("parsing JSON")?;

    let genes: Vec<String> = root
        .get("genes")
        .and_then(|v| v.as_array())
        .context("Expected a top-level 'genes' array")?
        .iter()
        .enumerate()
        .map(|(i, v)| {
            v.as_str()
                .map(str::to_string)
                .with_context(|| format!("genes[{i}] is not a string"))
        })
        .collect::<Result<_>>()?;

    let records = root
        .get("cells")
        .and_then(|v| v.as_array())
        .context("Expected a top-level 'cells' array")?;

    let mut names: Vec<String> = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    for rec in records {
        if let Some(obj) = rec.as_object() {
            for key in obj.keys() {
                if !is_reserved(key) && seen.insert(key.as_str()) {
                    names.push(key.clone());
                }
            }
        }
    }

    let mut rows = CellRows::default();
    let mut columns: Vec<Vec<MetadataValue>> =
        vec![Vec::with_capacity(records.len()); names.len()];

    for (i, rec) in records.iter().enumerate() {
        let obj = rec
            .as_object()
            .with_context(|| format!("Row {i} is not a JSON object"))?;

        let barcode = obj
            .get(BARCODE_FIELD)
            .and_then(|v| v.as_str())
            .with_context(|| format!("Row {i}: missing or non-string '{BARCODE_FIELD}'"))?;
        let embedding = json_array_to_f64(obj.get(EMBEDDING_FIELD), i, EMBEDDING_FIELD)?;
        let expression = json_array_to_f64(obj.get(EXPRESSION_FIELD), i, EXPRESSION_FIELD)?;
        rows.push(barcode.to_string(), embedding, expression, genes.len())?;

        for (name, values) in names.iter().zip(columns.iter_mut()) {
            values.push(obj.get(name).map(json_to_metadata).unwrap_or(MetadataValue::Null));
        }
    }

    let columns = names
        .into_iter()
        .zip(columns)
        .map(|(name, values)| Column::infer(name, values))
        .collect();
    rows.into_bundle(genes, columns, options)
}

fn json_array_to_f64(val: Option<&JsonValue>, row: usize, col: &str) -> Result<Vec<f64>> {
    let arr = val
        .and_then(|v| v.as_array())
        .with_context(|| format!("Row {row}: missing or invalid '{col}' array"))?;

    arr.iter()
        .enumerate()
        .map(|(j, v)| {
            v.as_f64()
                .with_context(|| format!("Row {row}, {col}[{j}]: not a number"))
        })
        .collect()
}

fn json_to_metadata(val: &JsonValue) -> MetadataValue {
    match val {
        JsonValue::String(s) => MetadataValue::String(s.clone()),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                MetadataValue::Integer(i)
            } else if let Some(f) = n.as_f64() {
                MetadataValue::Float(f)
            } else {
                MetadataValue::String(n.to_string())
            }
        }
        JsonValue::Bool(b) => MetadataValue::Bool(*b),
        JsonValue::Null => MetadataValue::Null,
        other => MetadataValue::String(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Parquet loader
// ---------------------------------------------------------------------------

/// Load a Parquet bundle.
///
/// Expected schema:
/// - `barcode`: Utf8 cell id
/// - `embedding`: List / FixedSizeList of two floats
/// - `expression`: List<Float64> or LargeList<Float64>, one value per gene
/// - any other column is metadata; its Arrow type decides the column kind
///
/// The gene ids are a JSON array stored under the `genes` key of the Arrow
/// schema metadata.
fn load_parquet(path: &Path, options: BundleOptions) -> Result<DatasetBundle> {
    let file = std::fs::File::open(path).context("opening parquet file")?;
    let builder =
        ParquetRecordBatchReaderBuilder::try_new(file).context("reading parquet metadata")?;

    let genes: Vec<String> = match builder.schema().metadata().get(GENES_METADATA_KEY) {
        Some(raw) => serde_json::from_str(raw).context("parsing gene ids from schema metadata")?,
        None => bail!("Parquet schema metadata has no '{GENES_METADATA_KEY}' entry"),
    };

    let reader = builder.build().context("building parquet reader")?;

    let mut rows = CellRows::default();
    // (column index, name, kind, values)
    let mut meta: Option<Vec<(usize, String, ColumnKind, Vec<MetadataValue>)>> = None;

    for batch_result in reader {
        let batch = batch_result.context("reading parquet record batch")?;
        let schema = batch.schema();

        let index_of = |name: &str| {
            schema
                .index_of(name)
                .map_err(|_| anyhow!("Parquet file missing '{name}' column"))
        };
        let barcode_idx = index_of(BARCODE_FIELD)?;
        let embedding_idx = index_of(EMBEDDING_FIELD)?;
        let expression_idx = index_of(EXPRESSION_FIELD)?;

        let meta = meta.get_or_insert_with(|| {
            schema
                .fields()
                .iter()
                .enumerate()
                .filter(|(_, f)| !is_reserved(f.name()))
                .map(|(i, f)| (i, f.name().clone(), column_kind(f.data_type()), Vec::new()))
                .collect()
        });

        let barcodes = cast(batch.column(barcode_idx), &DataType::Utf8)
            .context("reading 'barcode' as text")?;
        let barcodes = barcodes.as_string::<i32>();
        let embedding_col = batch.column(embedding_idx);
        let expression_col = batch.column(expression_idx);

        for row in 0..batch.num_rows() {
            // Messages use the file row, not the row within this batch.
            let file_row = rows.barcodes.len();
            if barcodes.is_null(row) {
                bail!("Row {file_row}: null barcode");
            }
            let embedding = extract_f64_list(embedding_col, row)
                .with_context(|| format!("Row {file_row}: failed to read '{EMBEDDING_FIELD}'"))?;
            let expression = extract_f64_list(expression_col, row)
                .with_context(|| format!("Row {file_row}: failed to read '{EXPRESSION_FIELD}'"))?;
            rows.push(barcodes.value(row).to_string(), embedding, expression, genes.len())?;
        }

        for (col_idx, name, kind, values) in meta.iter_mut() {
            extract_metadata_values(batch.column(*col_idx), *kind, values)
                .with_context(|| format!("reading metadata column '{name}'"))?;
        }
    }

    let columns = meta
        .unwrap_or_default()
        .into_iter()
        .map(|(_, name, kind, values)| Column::new(name, kind, values))
        .collect();
    rows.into_bundle(genes, columns, options)
}

// -- Parquet / Arrow helpers --

/// Column kind from the declared Arrow type.
fn column_kind(data_type: &DataType) -> ColumnKind {
    match data_type {
        DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View => ColumnKind::Categorical,
        DataType::Dictionary(_, value) if column_kind(value) == ColumnKind::Categorical => {
            ColumnKind::Categorical
        }
        DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32
        | DataType::UInt64 => ColumnKind::Integer,
        DataType::Float16 | DataType::Float32 | DataType::Float64 => ColumnKind::Float,
        DataType::Boolean => ColumnKind::Boolean,
        _ => ColumnKind::Unsupported,
    }
}

/// Append the values of one metadata column, normalised to the column kind.
fn extract_metadata_values(
    col: &Arc<dyn Array>,
    kind: ColumnKind,
    out: &mut Vec<MetadataValue>,
) -> Result<()> {
    let n = col.len();
    match kind {
        ColumnKind::Categorical => {
            let arr = cast(col, &DataType::Utf8)?;
            let arr = arr.as_string::<i32>();
            out.extend((0..n).map(|row| {
                if arr.is_null(row) {
                    MetadataValue::Null
                } else {
                    MetadataValue::String(arr.value(row).to_string())
                }
            }));
        }
        ColumnKind::Integer => {
            let arr = cast(col, &DataType::Int64)?;
            out.extend(
                arr.as_primitive::<Int64Type>()
                    .iter()
                    .map(|v| v.map_or(MetadataValue::Null, MetadataValue::Integer)),
            );
        }
        ColumnKind::Float => {
            let arr = cast(col, &DataType::Float64)?;
            out.extend(
                arr.as_primitive::<Float64Type>()
                    .iter()
                    .map(|v| v.map_or(MetadataValue::Null, MetadataValue::Float)),
            );
        }
        ColumnKind::Boolean => {
            out.extend(
                col.as_boolean()
                    .iter()
                    .map(|v| v.map_or(MetadataValue::Null, MetadataValue::Bool)),
            );
        }
        ColumnKind::Unsupported => out.extend((0..n).map(|_| MetadataValue::Null)),
    }
    Ok(())
}

/// Extract a `Vec<f64>` from a List, LargeList or FixedSizeList column at the given row.
fn extract_f64_list(col: &Arc<dyn Array>, row: usize) -> Result<Vec<f64>> {
    if col.is_null(row) {
        bail!("null value in list column");
    }

    let values_array = match col.data_type() {
        DataType::List(_) => col
            .as_any()
            .downcast_ref::<ListArray>()
            .context("expected ListArray")?
            .value(row),
        DataType::LargeList(_) => col
            .as_any()
            .downcast_ref::<LargeListArray>()
            .context("expected LargeListArray")?
            .value(row),
        DataType::FixedSizeList(_, _) => col
            .as_any()
            .downcast_ref::<FixedSizeListArray>()
            .context("expected FixedSizeListArray")?
            .value(row),
        other => bail!("Expected List or LargeList column, got {other:?}"),
    };

    match values_array.data_type() {
        DataType::Float64 | DataType::Float32 | DataType::Float16 => {}
        other => bail!("List inner type is {other:?}, expected a float type"),
    }
    let values = cast(&values_array, &DataType::Float64)?;
    Ok(values
        .as_primitive::<Float64Type>()
        .iter()
        .map(|v| v.unwrap_or(f64::NAN))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    use arrow::array::{DictionaryArray, Int32Array, StringArray};
    use arrow::datatypes::{Field, Int32Type, Schema};
    use arrow::record_batch::RecordBatch;
    use parquet::arrow::ArrowWriter;

    fn write_temp(suffix: &str, contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    const JSON_BUNDLE: &str = r#"{
        "genes": ["CD3E", "LYZ"],
        "cells": [
            {"barcode": "A-1", "embedding": [0.5, 1.0], "expression": [3, 0], "cell_type": "T", "n_genes": 1200},
            {"barcode": "B-1", "embedding": [2.0, -1.0], "expression": [0, 7.5], "cell_type": "Mono", "n_genes": 900.5, "doublet": true}
        ]
    }"#;

    #[test]
    fn loads_json_bundle() {
        let file = write_temp(".json", JSON_BUNDLE);
        let bundle = load_file(file.path(), BundleOptions::default()).unwrap();

        assert_eq!(bundle.len(), 2);
        assert_eq!(bundle.expression().genes(), ["CD3E", "LYZ"]);
        assert_eq!(bundle.expression().row(1), &[0.0, 7.5]);
        assert_eq!(bundle.embedding().coords()[1], [2.0, -1.0]);

        let kinds: Vec<_> = bundle
            .metadata()
            .columns()
            .iter()
            .map(|c| (c.name.as_str(), c.kind))
            .collect();
        assert_eq!(
            kinds,
            [
                ("cell_type", ColumnKind::Categorical),
                ("n_genes", ColumnKind::Float),
                ("doublet", ColumnKind::Boolean),
            ]
        );
        assert_eq!(bundle.metadata().column("doublet").unwrap().values[0], MetadataValue::Null);
    }

    #[test]
    fn json_expression_length_must_match_genes() {
        let file = write_temp(
            ".json",
            r#"{"genes": ["G1", "G2"], "cells": [{"barcode": "a", "embedding": [0, 0], "expression": [1]}]}"#,
        );
        let err = load_file(file.path(), BundleOptions::default()).unwrap_err();
        assert!(format!("{err:#}").contains("2 genes are declared"), "{err:#}");
    }

    #[test]
    fn rejects_unknown_extension() {
        let file = write_temp(".rds", "");
        let err = load_file(file.path(), BundleOptions::default()).unwrap_err();
        assert!(format!("{err:#}").contains("Unsupported file extension: .rds"));
    }

    #[test]
    fn loads_parquet_bundle() {
        let cell_type: DictionaryArray<Int32Type> = vec!["T", "B", "T"].into_iter().collect();
        let schema = Arc::new(
            Schema::new(vec![
                Field::new(BARCODE_FIELD, DataType::Utf8, false),
                Field::new(
                    EMBEDDING_FIELD,
                    DataType::List(Arc::new(Field::new("item", DataType::Float64, true))),
                    false,
                ),
                Field::new(
                    EXPRESSION_FIELD,
                    DataType::List(Arc::new(Field::new("item", DataType::Float64, true))),
                    false,
                ),
                Field::new(
                    "cell_type",
                    DataType::Dictionary(Box::new(DataType::Int32), Box::new(DataType::Utf8)),
                    false,
                ),
                Field::new("n_genes", DataType::Int32, true),
            ])
            .with_metadata(HashMap::from([(
                GENES_METADATA_KEY.to_string(),
                r#"["CD3E","MS4A1"]"#.to_string(),
            )])),
        );
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(StringArray::from(vec!["c1", "c2", "c3"])),
                Arc::new(ListArray::from_iter_primitive::<Float64Type, _, _>(vec![
                    Some(vec![Some(0.0), Some(1.0)]),
                    Some(vec![Some(2.0), Some(3.0)]),
                    Some(vec![Some(4.0), Some(5.0)]),
                ])),
                Arc::new(ListArray::from_iter_primitive::<Float64Type, _, _>(vec![
                    Some(vec![Some(1.0), Some(0.0)]),
                    Some(vec![Some(0.0), Some(2.0)]),
                    Some(vec![Some(3.0), Some(0.0)]),
                ])),
                Arc::new(cell_type),
                Arc::new(Int32Array::from(vec![Some(500), None, Some(1500)])),
            ],
        )
        .unwrap();

        let file = tempfile::Builder::new().suffix(".parquet").tempfile().unwrap();
        let mut writer =
            ArrowWriter::try_new(file.as_file().try_clone().unwrap(), schema, None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();

        let bundle = FileAdapter::default().load(file.path()).unwrap();

        assert_eq!(bundle.metadata().cells(), ["c1", "c2", "c3"]);
        assert_eq!(bundle.expression().genes(), ["CD3E", "MS4A1"]);
        assert_eq!(bundle.expression().row(1), &[0.0, 2.0, 0.0]);
        assert_eq!(bundle.embedding().coords()[2], [4.0, 5.0]);

        let cell_type = bundle.metadata().column("cell_type").unwrap();
        assert_eq!(cell_type.kind, ColumnKind::Categorical);
        assert_eq!(cell_type.values[1], MetadataValue::String("B".into()));
        let n_genes = bundle.metadata().column("n_genes").unwrap();
        assert_eq!(n_genes.kind, ColumnKind::Integer);
        assert_eq!(n_genes.values[1], MetadataValue::Null);
    }

    #[test]
    fn parquet_errors_name_the_file_row() {
        // More rows than the reader's default batch size, so the bad row sits
        // in the second batch.
        const ROWS: usize = 1100;
        const BAD_ROW: usize = 1050;

        let list_of_f64 = || DataType::List(Arc::new(Field::new("item", DataType::Float64, true)));
        let schema = Arc::new(
            Schema::new(vec![
                Field::new(BARCODE_FIELD, DataType::Utf8, false),
                Field::new(EMBEDDING_FIELD, list_of_f64(), true),
                Field::new(EXPRESSION_FIELD, list_of_f64(), false),
            ])
            .with_metadata(HashMap::from([(
                GENES_METADATA_KEY.to_string(),
                r#"["CD3E"]"#.to_string(),
            )])),
        );
        let barcodes: Vec<String> = (0..ROWS).map(|i| format!("c{i}")).collect();
        let embedding = (0..ROWS).map(|i| (i != BAD_ROW).then(|| vec![Some(0.0), Some(1.0)]));
        let expression = (0..ROWS).map(|i| Some(vec![Some(i as f64)]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(StringArray::from(barcodes)),
                Arc::new(ListArray::from_iter_primitive::<Float64Type, _, _>(embedding)),
                Arc::new(ListArray::from_iter_primitive::<Float64Type, _, _>(expression)),
            ],
        )
        .unwrap();

        let file = tempfile::Builder::new().suffix(".parquet").tempfile().unwrap();
        let mut writer =
            ArrowWriter::try_new(file.as_file().try_clone().unwrap(), schema, None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();

        let err = FileAdapter::default().load(file.path()).unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("Row 1050: failed to read 'embedding'"), "{message}");
    }
}
