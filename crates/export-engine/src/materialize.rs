//! Materialize one edited episode into a sink.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use kinedit_common::error::{KineditError, KineditResult};
use kinedit_edit_core::compose::resolve_sample;
use kinedit_edit_core::image_pipeline::{apply_transform, resolve_transform};
use kinedit_edit_core::reconcile::{reconcile, remap_subtasks};
use kinedit_episode_model::bundle::EpisodeManifest;
use kinedit_episode_model::episode::{OriginalEpisode, SubtaskSpan};
use kinedit_episode_model::ledger::EditLedger;

use crate::export::ExportStage;
use crate::sink::{CommittedEpisode, DatasetSink, FrameRecord};

/// Per-episode export switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct MaterializeOptions {
    /// Write remapped subtask spans alongside the frames.
    pub include_subtasks: bool,
}

/// What one episode export produced.
pub struct MaterializedEpisode {
    pub frames_written: usize,

    /// The published output, pending the rest of its batch.
    pub committed: Box<dyn CommittedEpisode>,
}

impl MaterializedEpisode {
    pub fn output_path(&self) -> &Path {
        self.committed.output_path()
    }
}

impl fmt::Debug for MaterializedEpisode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MaterializedEpisode")
            .field("frames_written", &self.frames_written)
            .field("output_path", &self.output_path())
            .finish()
    }
}

/// Write the effective sequence of `episode` under `ledger` to `sink`.
///
/// `cancel` is checked before every frame. On any error, including
/// cancellation, the partially written episode is discarded by the sink.
/// On success the episode is published but not finalized; see
/// [`CommittedEpisode`].
/// `progress` receives `(processed, total, stage)` with non-decreasing
/// `processed`.
pub fn materialize_episode(
    episode: &OriginalEpisode,
    ledger: &EditLedger,
    options: MaterializeOptions,
    sink: &dyn DatasetSink,
    cancel: &AtomicBool,
    progress: &mut dyn FnMut(usize, usize, ExportStage),
) -> KineditResult<MaterializedEpisode> {
    ledger.validate_for(episode.frame_count())?;

    let frames = reconcile(
        episode.frame_count(),
        ledger.removed_frames(),
        ledger.insertions(),
    );
    let total = frames.len();
    progress(0, total, ExportStage::Preparing);

    let manifest = EpisodeManifest {
        episode_index: episode.episode_index(),
        fps: episode.fps(),
        frame_count: total,
        cameras: episode.camera_ids().map(str::to_string).collect(),
    };
    let mut writer = sink.open_episode(&manifest)?;

    for frame in frames.iter() {
        if cancel.load(Ordering::SeqCst) {
            tracing::info!(
                episode = episode.episode_index(),
                processed = frame.effective_index,
                total,
                "Export cancelled"
            );
            return Err(KineditError::Cancelled);
        }

        let mut sample = resolve_sample(
            frame,
            episode.trajectory(),
            ledger.trajectory_adjustments(),
        )?;
        // Exported samples are numbered in the exported sequence.
        sample.frame_index = frame.effective_index;

        let source_index = frame.source_frame_index();
        let mut images = BTreeMap::new();
        for (camera, source) in episode.cameras() {
            let image = source.frame(source_index)?.ok_or_else(|| {
                KineditError::corrupt_source(format!(
                    "episode {}: camera '{camera}' has no frame {source_index}",
                    episode.episode_index()
                ))
            })?;
            let transform = resolve_transform(camera, ledger.transforms());
            images.insert(camera.clone(), apply_transform(&image, transform));
        }

        writer.write_frame(&FrameRecord {
            frame_index: frame.effective_index,
            sample,
            images,
        })?;
        progress(frame.effective_index + 1, total, ExportStage::Rendering);
    }

    progress(total, total, ExportStage::Finalizing);
    if options.include_subtasks && !episode.subtasks().is_empty() {
        let spans: Vec<SubtaskSpan> = remap_subtasks(&frames, episode.subtasks())
            .into_iter()
            .map(|s| SubtaskSpan {
                label: s.label,
                start_frame: s.start_index,
                end_frame: s.end_index,
            })
            .collect();
        writer.write_subtasks(&spans)?;
    }

    let committed = writer.commit()?;
    progress(total, total, ExportStage::Complete);

    Ok(MaterializedEpisode {
        frames_written: total,
        committed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::sink::BundleSink;
    use image::{Rgb, RgbImage};
    use kinedit_episode_model::bundle::EpisodeBundle;
    use kinedit_episode_model::episode::{
        FrameSource, InMemoryFrames, TrajectorySample, JOINT_COUNT,
    };
    use std::sync::Arc;

    fn episode(frames: usize) -> OriginalEpisode {
        let trajectory = (0..frames)
            .map(|i| TrajectorySample {
                frame_index: i,
                timestamp: i as f64 / 10.0,
                joint_positions: [i as f64; JOINT_COUNT],
                joint_velocities: [0.0; JOINT_COUNT],
            })
            .collect();
        let images = (0..frames)
            .map(|i| RgbImage::from_pixel(2, 2, Rgb([i as u8, 0, 0])))
            .collect();
        let mut cameras: BTreeMap<String, Arc<dyn FrameSource>> = BTreeMap::new();
        cameras.insert("top".to_string(), Arc::new(InMemoryFrames::new(images)));
        OriginalEpisode::new(5, 10.0, trajectory, cameras)
            .unwrap()
            .with_subtasks(vec![SubtaskSpan {
                label: "reach".to_string(),
                start_frame: 1,
                end_frame: 3,
            }])
            .unwrap()
    }

    #[test]
    fn test_edited_episode_round_trips_through_bundle() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = BundleSink::new(tmp.path(), RetryPolicy::none());
        let episode = episode(5);
        let mut ledger = EditLedger::new(5);
        ledger.toggle_frame_removal(0).unwrap();
        ledger.insert_frame(2, 0.5).unwrap();

        let result = materialize_episode(
            &episode,
            &ledger,
            MaterializeOptions {
                include_subtasks: true,
            },
            &sink,
            &AtomicBool::new(false),
            &mut |_, _, _| {},
        )
        .unwrap();
        assert_eq!(result.frames_written, 5);

        let exported = EpisodeBundle::load(result.output_path()).unwrap();
        assert_eq!(exported.frame_count(), 5);
        // effective: 1, 2, 2*, 3, 4
        assert!((exported.trajectory()[2].joint_positions[0] - 2.5).abs() < 1e-12);
        let indices: Vec<usize> = exported.trajectory().iter().map(|s| s.frame_index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
        let synthetic = exported.cameras()["top"].frame(2).unwrap().unwrap();
        assert_eq!(synthetic.get_pixel(0, 0).0, [2, 0, 0]);
        assert_eq!(
            exported.subtasks(),
            &[SubtaskSpan {
                label: "reach".to_string(),
                start_frame: 0,
                end_frame: 3,
            }]
        );
    }

    #[test]
    fn test_cancel_between_frames_discards_output() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = BundleSink::new(tmp.path(), RetryPolicy::none());
        let cancel = AtomicBool::new(false);

        let err = materialize_episode(
            &episode(6),
            &EditLedger::new(6),
            MaterializeOptions::default(),
            &sink,
            &cancel,
            &mut |processed, _, _| {
                if processed == 2 {
                    cancel.store(true, Ordering::SeqCst);
                }
            },
        )
        .unwrap_err();

        assert!(matches!(err, KineditError::Cancelled));
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_progress_is_monotonic_and_complete() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = BundleSink::new(tmp.path(), RetryPolicy::none());
        let mut seen = Vec::new();

        materialize_episode(
            &episode(4),
            &EditLedger::new(4),
            MaterializeOptions::default(),
            &sink,
            &AtomicBool::new(false),
            &mut |processed, total, stage| seen.push((processed, total, stage)),
        )
        .unwrap();

        assert!(seen.windows(2).all(|w| w[0].0 <= w[1].0));
        assert_eq!(seen.first(), Some(&(0, 4, ExportStage::Preparing)));
        assert_eq!(seen.last(), Some(&(4, 4, ExportStage::Complete)));
    }

    #[test]
    fn test_ledger_for_other_episode_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = BundleSink::new(tmp.path(), RetryPolicy::none());
        let err = materialize_episode(
            &episode(4),
            &EditLedger::new(9),
            MaterializeOptions::default(),
            &sink,
            &AtomicBool::new(false),
            &mut |_, _, _| {},
        )
        .unwrap_err();
        assert!(err.is_invalid_edit());
    }
}
