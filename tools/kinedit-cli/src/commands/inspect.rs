//! Show episode information.

use std::path::PathBuf;

use kinedit_episode_model::bundle::EpisodeBundle;

pub fn run(path: PathBuf) -> anyhow::Result<()> {
    let episode =
        EpisodeBundle::load(&path).map_err(|e| anyhow::anyhow!("Failed to load episode: {e}"))?;

    println!("Episode: {}", episode.episode_index());
    println!("  Path: {}", path.display());
    println!("  Frames: {}", episode.frame_count());
    println!("  FPS: {}", episode.fps());
    if let Some(last) = episode.trajectory().last() {
        println!("  Duration: {:.2}s", last.timestamp);
    }
    println!();

    println!("Cameras:");
    for (id, source) in episode.cameras() {
        let size = source
            .frame(0)
            .ok()
            .flatten()
            .map(|img| format!("{}x{}", img.width(), img.height()))
            .unwrap_or_else(|| "no frames".to_string());
        println!("  {id}: {} frames, {size}", source.len());
    }
    println!();

    println!("Subtasks:");
    if episode.subtasks().is_empty() {
        println!("  (none)");
    }
    for span in episode.subtasks() {
        println!(
            "  {}: frames {}..={}",
            span.label, span.start_frame, span.end_frame
        );
    }

    Ok(())
}
