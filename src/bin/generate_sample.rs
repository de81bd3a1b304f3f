use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow::array::{
    ArrayRef, BooleanArray, Float64Array, Float64Builder, Int64Array, ListBuilder, StringArray,
};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;

use cellscope::data::loader::{
    BARCODE_FIELD, EMBEDDING_FIELD, EXPRESSION_FIELD, GENES_METADATA_KEY,
};

/// Minimal deterministic PRNG (xoshiro256**)
struct SimpleRng {
    state: [u64; 4],
}

impl SimpleRng {
    fn new(seed: u64) -> Self {
        let mut s = [0u64; 4];
        let mut x = seed;
        for slot in &mut s {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1);
            *slot = x;
        }
        SimpleRng { state: s }
    }

    fn next_u64(&mut self) -> u64 {
        let result = (self.state[1].wrapping_mul(5))
            .rotate_left(7)
            .wrapping_mul(9);
        let t = self.state[1] << 17;
        self.state[2] ^= self.state[0];
        self.state[3] ^= self.state[1];
        self.state[1] ^= self.state[2];
        self.state[0] ^= self.state[3];
        self.state[2] ^= t;
        self.state[3] = self.state[3].rotate_left(45);
        result
    }

    fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Box-Muller transform for normal distribution
    fn gauss(&mut self, mean: f64, std_dev: f64) -> f64 {
        let u1 = self.next_f64().max(1e-15);
        let u2 = self.next_f64();
        let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
        mean + std_dev * z
    }

    fn below(&mut self, n: usize) -> usize {
        (self.next_u64() % n as u64) as usize
    }
}

/// A cell population: its marker genes and where it sits in the embedding.
struct Population {
    name: &'static str,
    markers: &'static [&'static str],
    centre: [f64; 2],
}

const POPULATIONS: &[Population] = &[
    Population { name: "T", markers: &["CD3E", "CD3D", "IL7R"], centre: [-6.0, 2.0] },
    Population { name: "B", markers: &["MS4A1", "CD79A"], centre: [4.0, 6.0] },
    Population { name: "Mono", markers: &["LYZ", "CD14", "FCGR3A"], centre: [5.0, -5.0] },
    Population { name: "NK", markers: &["NKG7", "GNLY"], centre: [-3.0, -6.0] },
];

const HOUSEKEEPING: &[&str] = &["ACTB", "GAPDH", "MALAT1"];
const BACKGROUND_GENES: usize = 30;
const CELLS: usize = 1200;

fn gene_ids() -> Vec<String> {
    POPULATIONS
        .iter()
        .flat_map(|p| p.markers.iter())
        .chain(HOUSEKEEPING)
        .map(|g| g.to_string())
        .chain((1..=BACKGROUND_GENES).map(|i| format!("GENE{i:03}")))
        .collect()
}

fn main() -> Result<()> {
    env_logger::init();
    let output_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("testdata/sample_cells.parquet"));

    let mut rng = SimpleRng::new(42);
    let genes = gene_ids();
    let samples = ["S1", "S2", "S3"];

    let mut barcodes = Vec::with_capacity(CELLS);
    let mut cell_types = Vec::with_capacity(CELLS);
    let mut sample_ids = Vec::with_capacity(CELLS);
    let mut n_genes = Vec::with_capacity(CELLS);
    let mut pct_mito = Vec::with_capacity(CELLS);
    let mut doublets = Vec::with_capacity(CELLS);
    let mut embedding = ListBuilder::new(Float64Builder::new());
    let mut expression = ListBuilder::new(Float64Builder::new());

    for i in 0..CELLS {
        let population = &POPULATIONS[rng.below(POPULATIONS.len())];
        barcodes.push(format!("CELL{i:05}-1"));
        cell_types.push(population.name);
        sample_ids.push(samples[rng.below(samples.len())]);
        n_genes.push(rng.gauss(1500.0, 600.0).clamp(200.0, 6000.0).round() as i64);
        pct_mito.push((rng.gauss(6.0, 3.0).clamp(0.0, 40.0) * 100.0).round() / 100.0);
        doublets.push(rng.next_f64() < 0.03);

        let coords = embedding.values();
        coords.append_value(population.centre[0] + rng.gauss(0.0, 1.2));
        coords.append_value(population.centre[1] + rng.gauss(0.0, 1.2));
        embedding.append(true);

        let values = expression.values();
        for gene in &genes {
            let mean = if population.markers.contains(&gene.as_str()) {
                3.0
            } else if HOUSEKEEPING.contains(&gene.as_str()) {
                2.0
            } else {
                0.2
            };
            values.append_value(rng.gauss(mean, 0.6).max(0.0));
        }
        expression.append(true);
    }

    let list_of_f64 = || DataType::List(Arc::new(Field::new("item", DataType::Float64, true)));
    let metadata = HashMap::from([(
        GENES_METADATA_KEY.to_string(),
        serde_json::to_string(&genes).context("encoding gene ids")?,
    )]);
    let schema = Arc::new(
        Schema::new(vec![
            Field::new(BARCODE_FIELD, DataType::Utf8, false),
            Field::new(EMBEDDING_FIELD, list_of_f64(), false),
            Field::new(EXPRESSION_FIELD, list_of_f64(), false),
            Field::new("cell_type", DataType::Utf8, false),
            Field::new("sample", DataType::Utf8, false),
            Field::new("n_genes", DataType::Int64, false),
            Field::new("pct_mito", DataType::Float64, false),
            Field::new("doublet", DataType::Boolean, false),
        ])
        .with_metadata(metadata),
    );

    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(barcodes)),
        Arc::new(embedding.finish()),
        Arc::new(expression.finish()),
        Arc::new(StringArray::from(cell_types)),
        Arc::new(StringArray::from(sample_ids)),
        Arc::new(Int64Array::from(n_genes)),
        Arc::new(Float64Array::from(pct_mito)),
        Arc::new(BooleanArray::from(doublets)),
    ];
    let batch = RecordBatch::try_new(schema.clone(), columns).context("building record batch")?;

    if let Some(parent) = output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let file = std::fs::File::create(&output_path)
        .with_context(|| format!("creating {}", output_path.display()))?;
    let mut writer = ArrowWriter::try_new(file, schema, None).context("creating parquet writer")?;
    writer.write(&batch).context("writing record batch")?;
    writer.close().context("closing parquet writer")?;

    println!(
        "Wrote {CELLS} cells ({} genes each) to {}",
        genes.len(),
        output_path.display()
    );
    Ok(())
}
