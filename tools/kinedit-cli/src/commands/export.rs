//! Export episodes from a dataset.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use kinedit_common::config::AppConfig;
use kinedit_episode_model::bundle::DirectoryProvider;
use kinedit_episode_model::ledger::EditLedger;
use kinedit_export_engine::{
    ExportCoordinator, ExportFormat, ExportProgress, ExportRequest, ExportStage, ProgressCallback,
};

pub async fn run(
    config: &AppConfig,
    dataset: PathBuf,
    episodes: Vec<usize>,
    output: PathBuf,
    edits: Option<PathBuf>,
    apply_edits: bool,
    include_subtasks: bool,
    format: String,
) -> anyhow::Result<()> {
    println!("Exporting from dataset: {}", dataset.display());

    let format = match format.as_str() {
        "bundle" => ExportFormat::Bundle,
        "hdf5" => ExportFormat::Hdf5,
        _ => {
            return Err(anyhow::anyhow!("Unknown format: {format}. Use: bundle, hdf5"));
        }
    };

    let edits: BTreeMap<usize, EditLedger> = match edits {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw)
                .map_err(|e| anyhow::anyhow!("Invalid edits file {}: {e}", path.display()))?
        }
        None => BTreeMap::new(),
    };

    println!("  Episodes: {episodes:?}");
    println!("  Output: {}", output.display());
    println!("  Edits: {}", if apply_edits { "applied" } else { "ignored" });

    let request = ExportRequest {
        episode_indices: episodes,
        output_path: output,
        apply_edits,
        include_subtasks,
        format,
        edits,
    };

    let coordinator = ExportCoordinator::new(
        Arc::new(DirectoryProvider::new(dataset)),
        config.export.clone(),
    );

    let progress_cb: ProgressCallback = Box::new(|p: ExportProgress| {
        if p.stage == ExportStage::Rendering {
            print!(
                "\r  Episode {}: {}/{} frames  ",
                p.episode_index, p.processed, p.total
            );
        }
    });

    let result = coordinator.export(request, Some(progress_cb)).await?;
    if result.success {
        println!(
            "\nExport complete: {} frames in {:.1}s",
            result.frames_written,
            (result.finished_at - result.started_at).num_milliseconds() as f64 / 1000.0
        );
        for path in &result.output_paths {
            println!("  {}", path.display());
        }
        Ok(())
    } else {
        Err(anyhow::anyhow!(
            "\nExport failed ({:?}): {}",
            result.error,
            result.error_message.unwrap_or_default()
        ))
    }
}
