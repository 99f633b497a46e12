//! Apply edits to an episode and print the effective sequence.

use std::path::PathBuf;
use std::sync::Arc;

use kinedit_edit_core::{EditSession, FrameOrigin};
use kinedit_episode_model::bundle::EpisodeBundle;
use kinedit_episode_model::ledger::EditLedger;

/// Edits requested on the command line, applied in this order.
pub struct PreviewEdits {
    pub ledger: Option<PathBuf>,
    pub remove: Vec<usize>,
    pub remove_range: Vec<(usize, usize)>,
    pub insert: Vec<usize>,
    pub factor: f64,
}

pub fn run(
    path: PathBuf,
    edits: PreviewEdits,
    save: Option<PathBuf>,
    json: bool,
) -> anyhow::Result<()> {
    let episode = Arc::new(
        EpisodeBundle::load(&path).map_err(|e| anyhow::anyhow!("Failed to load episode: {e}"))?,
    );

    let mut session = match &edits.ledger {
        Some(ledger_path) => {
            let raw = std::fs::read_to_string(ledger_path)?;
            let ledger: EditLedger = serde_json::from_str(&raw)
                .map_err(|e| anyhow::anyhow!("Invalid ledger {}: {e}", ledger_path.display()))?;
            EditSession::with_ledger(Arc::clone(&episode), ledger)?
        }
        None => EditSession::new(Arc::clone(&episode)),
    };

    for index in edits.remove {
        session.toggle_frame_removal(index)?;
    }
    for (start, end) in edits.remove_range {
        session.add_frame_range(start, end)?;
    }
    for anchor in edits.insert {
        session.insert_frame(anchor, edits.factor)?;
    }
    tracing::debug!(version = session.ledger().version(), "Applied command-line edits");

    if json {
        let frames = session.effective_frames();
        println!("{}", serde_json::to_string_pretty(&*frames)?);
    } else {
        print_summary(&session);
    }

    if let Some(save_path) = save {
        let raw = serde_json::to_string_pretty(&session.into_ledger())?;
        std::fs::write(&save_path, raw)?;
        println!("Ledger saved: {}", save_path.display());
    }

    Ok(())
}

fn print_summary(session: &EditSession) {
    let ledger = session.ledger();
    println!("Episode {}", session.episode().episode_index());
    println!(
        "  Frames: {} original -> {} effective",
        session.episode().frame_count(),
        session.effective_frame_count()
    );
    println!("  Removed: {}", ledger.removed_frames().len());
    println!("  Insertions: {}", ledger.insertions().len());
    println!("  Pose adjustments: {}", ledger.trajectory_adjustments().len());
    println!("  Ledger version: {}", ledger.version());
    println!();

    println!("Sequence:");
    for frame in session.effective_frames().iter() {
        match frame.origin {
            FrameOrigin::Original { source_frame_index } => {
                println!("  {:>6}  original   {source_frame_index}", frame.effective_index);
            }
            FrameOrigin::Synthetic {
                source_frame_index,
                next_source_frame_index,
                interpolation_factor,
            } => {
                println!(
                    "  {:>6}  synthetic  {source_frame_index}..{next_source_frame_index} @ {interpolation_factor:.2}",
                    frame.effective_index
                );
            }
        }
    }

    let subtasks = session.effective_subtasks();
    if !subtasks.is_empty() {
        println!();
        println!("Subtasks:");
        for span in subtasks {
            println!("  {}: {}..={}", span.label, span.start_index, span.end_index);
        }
    }
}
