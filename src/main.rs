use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use cellscope::data::schema::FieldKind;
use cellscope::{FilterConfig, FilterState, PlotKind, Session, Settings};

#[derive(Parser)]
#[command(name = "cellscope", version, about = "Filter and project single-cell datasets")]
struct Cli {
    /// JSON settings file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Data directory, overriding the settings file and environment.
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List loadable files under the data directory.
    List,
    /// Print the filter fields derived from a dataset's metadata.
    Schema { path: String },
    /// Project the data for one plot.
    Plot {
        path: String,
        #[arg(long)]
        kind: PlotKind,
        /// Gene to plot; repeat for several.
        #[arg(long = "feature")]
        features: Vec<String>,
        /// Saved filter config (.json) or gene list (.txt).
        #[arg(long)]
        filters: Option<PathBuf>,
        #[arg(long)]
        color: Option<String>,
        #[arg(long)]
        shape: Option<String>,
        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
        /// Write to a file instead of stdout.
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Table,
    Csv,
    Json,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut settings = Settings::resolve(cli.config.as_deref())?;
    if let Some(dir) = cli.base_dir {
        settings.base_dir = dir;
    }
    let mut session = Session::new(settings);

    match cli.command {
        Command::List => {
            for entry in session.list_files()? {
                println!("{:>12}  {:>10}  {}", entry.size, entry.modified, entry.relative_path);
            }
        }
        Command::Schema { path } => {
            let outcome = session.load_dataset(&path)?;
            println!("{}", outcome.status_message);
            for field in outcome.schema.iter() {
                match &field.kind {
                    FieldKind::Categorical { values } => {
                        println!("{:<20} categorical  {}", field.name, values.join(", "))
                    }
                    FieldKind::NumericRange { min, max, step } => {
                        println!("{:<20} range        {min} – {max} (step {step})", field.name)
                    }
                }
            }
        }
        Command::Plot {
            path,
            kind,
            features,
            filters,
            color,
            shape,
            format,
            out,
        } => {
            let config = match filters {
                Some(file) => FilterConfig::load(&file)?,
                None => FilterConfig::default(),
            };
            let features = if features.is_empty() { config.genes.clone() } else { features };
            let color = color.or(config.color_field.clone());
            let shape = shape.or(config.shape_field.clone());

            let outcome = session.load_dataset(&path)?;
            let key = outcome.dataset_key;
            log::info!("{}", outcome.status_message);
            let predicates: FilterState = config.predicates;
            log::info!("{}", session.describe_filters(&key, &predicates)?);

            let selection =
                session.update_selection(&key, &predicates, color.as_deref(), shape.as_deref())?;
            let artifact = session.request_plot(&key, &selection, kind, &features)?;
            if artifact.table.is_empty() {
                log::warn!("no cells left after filtering");
            }

            let writer: Box<dyn Write> = match &out {
                Some(file) => Box::new(
                    File::create(file).with_context(|| format!("creating {}", file.display()))?,
                ),
                None => Box::new(io::stdout().lock()),
            };
            let mut writer = BufWriter::new(writer);
            match format {
                OutputFormat::Table => writeln!(writer, "{}", artifact.pretty()?)?,
                OutputFormat::Csv => artifact.write_csv(&mut writer)?,
                OutputFormat::Json => artifact.write_json(&mut writer)?,
            }
            writer.flush()?;
            if let Some(legend) = &artifact.legend {
                for entry in legend {
                    log::info!("legend {} {}", entry.color, entry.label);
                }
            }
        }
    }
    Ok(())
}
