//! Kinedit CLI: inspect, preview, and export edited robot episodes.
//!
//! Usage:
//!   kinedit inspect <EPISODE_DIR>          Show episode information
//!   kinedit preview <EPISODE_DIR>          Print the effective frame sequence
//!   kinedit export [DATASET_DIR] -e 0,1  Export episodes with their edits

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use kinedit_common::config::AppConfig;

mod commands;

#[derive(Parser)]
#[command(
    name = "kinedit",
    about = "Non-destructive editing for recorded robot episodes",
    version,
    author
)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show episode information
    Inspect {
        /// Path to the episode directory
        path: PathBuf,
    },

    /// Apply edits and print the resulting effective sequence
    Preview {
        /// Path to the episode directory
        path: PathBuf,

        /// Edit ledger (JSON) to start from
        #[arg(long)]
        edits: Option<PathBuf>,

        /// Toggle removal of an original frame (repeatable)
        #[arg(long = "remove", value_name = "FRAME")]
        remove: Vec<usize>,

        /// Remove an inclusive range of original frames, e.g. 10-20 (repeatable)
        #[arg(long = "remove-range", value_name = "START-END", value_parser = parse_range)]
        remove_range: Vec<(usize, usize)>,

        /// Insert a synthetic frame after an original frame (repeatable)
        #[arg(long = "insert", value_name = "FRAME")]
        insert: Vec<usize>,

        /// Interpolation factor for --insert (defaults to the configured value)
        #[arg(long)]
        factor: Option<f64>,

        /// Write the resulting ledger here
        #[arg(long)]
        save: Option<PathBuf>,

        /// Print the sequence as JSON
        #[arg(long)]
        json: bool,
    },

    /// Export episodes from a dataset
    Export {
        /// Dataset directory holding episode_NNNNNN folders (defaults to the configured datasets_dir)
        path: Option<PathBuf>,

        /// Episode indices to export
        #[arg(short, long, value_delimiter = ',', required = true)]
        episodes: Vec<usize>,

        /// Output dataset directory
        #[arg(short, long)]
        output: PathBuf,

        /// JSON map of episode index to edit ledger
        #[arg(long)]
        edits: Option<PathBuf>,

        /// Export the episodes exactly as recorded
        #[arg(long)]
        no_edits: bool,

        /// Write remapped subtask spans
        #[arg(long)]
        include_subtasks: bool,

        /// Output format: hdf5|bundle
        #[arg(long, default_value = "hdf5")]
        format: String,
    },
}

fn parse_range(s: &str) -> Result<(usize, usize), String> {
    let (start, end) = s
        .split_once('-')
        .ok_or_else(|| format!("expected START-END, got '{s}'"))?;
    let start = start.trim().parse().map_err(|e| format!("bad start: {e}"))?;
    let end = end.trim().parse().map_err(|e| format!("bad end: {e}"))?;
    Ok((start, end))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load();

    // Initialize logging
    let mut logging = config.logging.clone();
    if cli.verbose {
        logging.level = "debug".to_string();
    }
    kinedit_common::logging::init_logging(&logging);

    match cli.command {
        Commands::Inspect { path } => commands::inspect::run(path),
        Commands::Preview {
            path,
            edits,
            remove,
            remove_range,
            insert,
            factor,
            save,
            json,
        } => commands::preview::run(
            path,
            commands::preview::PreviewEdits {
                ledger: edits,
                remove,
                remove_range,
                insert,
                factor: factor.unwrap_or(config.export.default_insert_factor),
            },
            save,
            json,
        ),
        Commands::Export {
            path,
            episodes,
            output,
            edits,
            no_edits,
            include_subtasks,
            format,
        } => {
            let dataset = path.unwrap_or_else(|| config.datasets_dir.clone());
            commands::export::run(
                &config,
                dataset,
                episodes,
                output,
                edits,
                !no_edits,
                include_subtasks,
                format,
            )
            .await
        }
    }
}
