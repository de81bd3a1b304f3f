use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Array, StringArray};
use arrow::record_batch::RecordBatch;
use arrow::util::pretty::pretty_format_batches;
use serde::{Deserialize, Serialize};

use crate::color::LegendEntry;
use crate::data::filter::{FilterState, GroupingChoice};
use crate::data::projector::{PlotKind, ProjectedTable};
use crate::error::{ScopeError, ScopeResult};
use crate::registry::{DatasetKey, SelectionKey};

pub const FILTER_CONFIG_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Filter configuration
// ---------------------------------------------------------------------------

/// A saved filter state: what to plot and which cells to keep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    pub version: u32,
    /// Dataset path relative to the data directory, if known.
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub genes: Vec<String>,
    #[serde(default)]
    pub predicates: FilterState,
    #[serde(default)]
    pub color_field: Option<String>,
    #[serde(default)]
    pub shape_field: Option<String>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            version: FILTER_CONFIG_VERSION,
            source: None,
            genes: Vec::new(),
            predicates: FilterState::new(),
            color_field: None,
            shape_field: None,
        }
    }
}

impl FilterConfig {
    pub fn new(
        source: Option<String>,
        genes: Vec<String>,
        predicates: FilterState,
        grouping: &GroupingChoice,
    ) -> Self {
        FilterConfig {
            version: FILTER_CONFIG_VERSION,
            source,
            genes,
            predicates,
            color_field: grouping.color().map(str::to_string),
            shape_field: grouping.shape().map(str::to_string),
        }
    }

    pub fn grouping(&self) -> GroupingChoice {
        GroupingChoice::new(self.color_field.as_deref(), self.shape_field.as_deref())
    }

    pub fn to_json(&self) -> ScopeResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| ScopeError::Validation(e.to_string()))
    }

    pub fn from_json(content: &str) -> ScopeResult<FilterConfig> {
        let config: FilterConfig = serde_json::from_str(content)
            .map_err(|e| ScopeError::Validation(format!("invalid filter config: {e}")))?;
        if config.version > FILTER_CONFIG_VERSION {
            return Err(ScopeError::Validation(format!(
                "filter config version {} is newer than supported version {FILTER_CONFIG_VERSION}",
                config.version
            )));
        }
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> ScopeResult<()> {
        fs::write(path, self.to_json()?)
            .map_err(|e| ScopeError::Filesystem(format!("{}: {e}", path.display())))
    }

    pub fn load(path: &Path) -> ScopeResult<FilterConfig> {
        let content = fs::read_to_string(path)
            .map_err(|e| ScopeError::Filesystem(format!("{}: {e}", path.display())))?;
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        parse_upload(&content, name)
    }
}

/// Interpret an uploaded file by its name: `.json` is a full filter config,
/// `.txt` is a gene list separated by commas, whitespace or newlines.
pub fn parse_upload(contents: &str, filename: &str) -> ScopeResult<FilterConfig> {
    let lower = filename.to_ascii_lowercase();
    if lower.ends_with(".json") {
        return FilterConfig::from_json(contents);
    }
    if lower.ends_with(".txt") {
        let genes = contents
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|g| !g.is_empty())
            .map(str::to_string)
            .collect();
        return Ok(FilterConfig {
            genes,
            ..FilterConfig::default()
        });
    }
    Err(ScopeError::Validation(format!("unsupported file type: {filename}")))
}

// ---------------------------------------------------------------------------
// Plot artifacts
// ---------------------------------------------------------------------------

/// A projected table together with where it came from.
#[derive(Debug, Clone, Serialize)]
pub struct PlotArtifact {
    pub kind: PlotKind,
    pub dataset: DatasetKey,
    pub selection: SelectionKey,
    pub table: ProjectedTable,
    /// Present when the selection carries a colour field.
    pub legend: Option<Vec<LegendEntry>>,
}

impl PlotArtifact {
    pub fn write_json<W: Write>(&self, writer: W) -> ScopeResult<()> {
        serde_json::to_writer_pretty(writer, self).map_err(|e| ScopeError::Filesystem(e.to_string()))
    }

    /// Write the table as CSV. Heatmaps are written wide: one row per gene,
    /// one column per cell.
    pub fn write_csv<W: Write>(&self, writer: W) -> ScopeResult<()> {
        let mut wtr = csv::Writer::from_writer(writer);
        let csv_err = |e: csv::Error| ScopeError::Filesystem(e.to_string());
        match &self.table {
            ProjectedTable::Expression { rows } => {
                for row in rows {
                    wtr.serialize(row).map_err(csv_err)?;
                }
                if rows.is_empty() {
                    wtr.write_record(["cell", "feature", "value", "color", "shape"])
                        .map_err(csv_err)?;
                }
            }
            ProjectedTable::Embedding { axes, rows } => {
                wtr.write_record(["cell", axes[0].as_str(), axes[1].as_str(), "color", "shape"])
                    .map_err(csv_err)?;
                for row in rows {
                    wtr.write_record([
                        row.cell.clone(),
                        row.x.to_string(),
                        row.y.to_string(),
                        row.color.clone().unwrap_or_default(),
                        row.shape.clone().unwrap_or_default(),
                    ])
                    .map_err(csv_err)?;
                }
            }
            ProjectedTable::Heatmap(grid) => {
                let header = std::iter::once("gene").chain(grid.cells.iter().map(String::as_str));
                wtr.write_record(header).map_err(csv_err)?;
                for (g, gene) in grid.genes.iter().enumerate() {
                    let values = (0..grid.cells.len()).map(|c| grid.get(g, c).to_string());
                    wtr.write_record(std::iter::once(gene.clone()).chain(values))
                        .map_err(csv_err)?;
                }
            }
        }
        wtr.flush().map_err(|e| ScopeError::Filesystem(e.to_string()))
    }

    /// The table as an Arrow record batch.
    pub fn to_record_batch(&self) -> ScopeResult<RecordBatch> {
        let columns: Vec<(String, ArrayRef)> = match &self.table {
            ProjectedTable::Expression { rows } => vec![
                ("cell".into(), strings(rows.iter().map(|r| r.cell.as_str()))),
                ("feature".into(), strings(rows.iter().map(|r| r.feature.as_str()))),
                ("value".into(), floats(rows.iter().map(|r| r.value))),
                ("color".into(), optional(rows.iter().map(|r| r.color.as_deref()))),
                ("shape".into(), optional(rows.iter().map(|r| r.shape.as_deref()))),
            ],
            ProjectedTable::Embedding { axes, rows } => vec![
                ("cell".into(), strings(rows.iter().map(|r| r.cell.as_str()))),
                (axes[0].clone(), floats(rows.iter().map(|r| r.x))),
                (axes[1].clone(), floats(rows.iter().map(|r| r.y))),
                ("color".into(), optional(rows.iter().map(|r| r.color.as_deref()))),
                ("shape".into(), optional(rows.iter().map(|r| r.shape.as_deref()))),
            ],
            ProjectedTable::Heatmap(grid) => {
                let mut columns = vec![(
                    "gene".to_string(),
                    strings(grid.genes.iter().map(String::as_str)),
                )];
                for (c, cell) in grid.cells.iter().enumerate() {
                    let values = (0..grid.genes.len()).map(|g| grid.get(g, c));
                    columns.push((cell.clone(), floats(values)));
                }
                columns
            }
        };
        RecordBatch::try_from_iter(columns)
            .map_err(|e| ScopeError::Validation(format!("cannot build record batch: {e}")))
    }

    /// Render the table for a terminal.
    pub fn pretty(&self) -> ScopeResult<String> {
        let batch = self.to_record_batch()?;
        pretty_format_batches(&[batch])
            .map(|table| table.to_string())
            .map_err(|e| ScopeError::Validation(e.to_string()))
    }
}

fn strings<'a>(values: impl Iterator<Item = &'a str>) -> ArrayRef {
    Arc::new(StringArray::from(values.collect::<Vec<_>>()))
}

fn optional<'a>(values: impl Iterator<Item = Option<&'a str>>) -> ArrayRef {
    Arc::new(StringArray::from(values.collect::<Vec<_>>()))
}

fn floats(values: impl Iterator<Item = f64>) -> ArrayRef {
    Arc::new(Float64Array::from(values.collect::<Vec<_>>()))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::data::filter::Predicate;
    use crate::data::projector::{EmbeddingRow, ExpressionRow, HeatmapGrid};

    fn artifact(table: ProjectedTable) -> PlotArtifact {
        PlotArtifact {
            kind: PlotKind::Boxplot,
            dataset: DatasetKey::from("d"),
            selection: SelectionKey::from("s"),
            table,
            legend: None,
        }
    }

    fn expression_table() -> ProjectedTable {
        ProjectedTable::Expression {
            rows: vec![
                ExpressionRow {
                    cell: "C1".into(),
                    feature: "CD3E".into(),
                    value: 5.0,
                    color: Some("T".into()),
                    shape: None,
                },
                ExpressionRow {
                    cell: "C2".into(),
                    feature: "CD3E".into(),
                    value: 0.5,
                    color: Some("B".into()),
                    shape: None,
                },
            ],
        }
    }

    #[test]
    fn filter_config_json_round_trip() {
        let mut predicates = FilterState::new();
        predicates.insert("cell_type".into(), Predicate::values(["T", "B"]));
        predicates.insert("n_genes".into(), Predicate::range(200.0, 1000.0));
        let config = FilterConfig::new(
            Some("pbmc/sample.parquet".into()),
            vec!["CD3E".into(), "LYZ".into()],
            predicates,
            &GroupingChoice::new(Some("cell_type"), None),
        );

        let json = config.to_json().unwrap();
        assert!(json.contains("\"color_field\": \"cell_type\""));
        let back = FilterConfig::from_json(&json).unwrap();
        assert_eq!(back, config);
        assert_eq!(back.grouping().color(), Some("cell_type"));
    }

    #[test]
    fn newer_config_version_is_rejected() {
        assert_matches!(
            FilterConfig::from_json(r#"{"version": 99}"#),
            Err(ScopeError::Validation(msg)) if msg.contains("99")
        );
    }

    #[test]
    fn uploads_dispatch_on_file_name() {
        let config = parse_upload("CD3E, MS4A1\nLYZ\n", "genes.TXT").unwrap();
        assert_eq!(config.genes, vec!["CD3E", "MS4A1", "LYZ"]);
        assert!(config.predicates.is_empty());

        let config = parse_upload(r#"{"version": 1, "genes": ["LYZ"]}"#, "f.json").unwrap();
        assert_eq!(config.genes, vec!["LYZ"]);

        assert_matches!(parse_upload("a: 1", "f.yaml"), Err(ScopeError::Validation(_)));
    }

    #[test]
    fn save_and_load_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("filters.json");
        let config = FilterConfig {
            genes: vec!["CD3E".into()],
            ..FilterConfig::default()
        };
        config.save(&path).unwrap();
        assert_eq!(FilterConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn expression_csv_has_header_and_blank_missing_labels() {
        let mut out = Vec::new();
        artifact(expression_table()).write_csv(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            "cell,feature,value,color,shape\nC1,CD3E,5.0,T,\nC2,CD3E,0.5,B,\n"
        );
    }

    #[test]
    fn embedding_csv_uses_axis_labels() {
        let table = ProjectedTable::Embedding {
            axes: ["UMAP1".into(), "UMAP2".into()],
            rows: vec![EmbeddingRow {
                cell: "C1".into(),
                x: 1.5,
                y: -2.0,
                color: None,
                shape: Some("S1".into()),
            }],
        };
        let mut out = Vec::new();
        artifact(table).write_csv(&mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "cell,UMAP1,UMAP2,color,shape\nC1,1.5,-2,,S1\n"
        );
    }

    #[test]
    fn heatmap_batch_has_one_column_per_cell() {
        let table = ProjectedTable::Heatmap(HeatmapGrid {
            genes: vec!["CD3E".into(), "LYZ".into()],
            cells: vec!["C1".into(), "C2".into(), "C3".into()],
            values: vec![1.0, 0.0, -1.0, -1.0, 0.0, 1.0],
            suppress_tick_labels: false,
        });
        let batch = artifact(table).to_record_batch().unwrap();
        assert_eq!(batch.num_columns(), 4);
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.schema().field(0).name(), "gene");
        assert_eq!(batch.schema().field(3).name(), "C3");
    }

    #[test]
    fn pretty_table_and_json_render() {
        let artifact = artifact(expression_table());
        let pretty = artifact.pretty().unwrap();
        assert!(pretty.contains("CD3E"));
        assert!(pretty.contains("feature"));

        let mut out = Vec::new();
        artifact.write_json(&mut out).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["kind"], "boxplot");
        assert_eq!(value["table"]["layout"], "expression");
        assert_eq!(value["table"]["rows"][1]["value"], 0.5);
    }
}
