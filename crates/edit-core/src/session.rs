//! Edit session: one episode, its ledger, and memoized derived views.

use std::cell::RefCell;
use std::sync::Arc;

use image::RgbImage;
use kinedit_common::error::{KineditError, KineditResult};
use kinedit_episode_model::episode::{CameraId, OriginalEpisode, TrajectorySample};
use kinedit_episode_model::ledger::{EditLedger, TrajectoryAdjustment};
use kinedit_episode_model::transform::ImageTransform;

use crate::compose;
use crate::image_pipeline;
use crate::reconcile::{self, EffectiveFrame, EffectiveSubtask};

/// An episode under edit.
///
/// The effective sequence is rebuilt lazily, at most once per ledger
/// version. The session is meant for a single editing thread; exports take
/// a clone of the ledger instead of sharing the session.
#[derive(Debug)]
pub struct EditSession {
    episode: Arc<OriginalEpisode>,
    ledger: EditLedger,
    effective: RefCell<Option<(u64, Arc<[EffectiveFrame]>)>>,
}

impl EditSession {
    /// Start with an empty ledger.
    pub fn new(episode: Arc<OriginalEpisode>) -> Self {
        let ledger = EditLedger::new(episode.frame_count());
        Self {
            episode,
            ledger,
            effective: RefCell::new(None),
        }
    }

    /// Resume with an existing ledger, checked against the episode.
    pub fn with_ledger(episode: Arc<OriginalEpisode>, ledger: EditLedger) -> KineditResult<Self> {
        ledger.validate_for(episode.frame_count())?;
        Ok(Self {
            episode,
            ledger,
            effective: RefCell::new(None),
        })
    }

    pub fn episode(&self) -> &OriginalEpisode {
        &self.episode
    }

    pub fn ledger(&self) -> &EditLedger {
        &self.ledger
    }

    /// Swap in another ledger, checked against the episode first.
    ///
    /// On error the current ledger is kept.
    pub fn replace_ledger(&mut self, ledger: EditLedger) -> KineditResult<()> {
        ledger.validate_for(self.episode.frame_count())?;
        self.ledger = ledger;
        self.effective.get_mut().take();
        Ok(())
    }

    pub fn into_ledger(self) -> EditLedger {
        self.ledger
    }

    // Edits. Each one bumps the ledger version, which invalidates the memo.

    pub fn toggle_frame_removal(&mut self, index: usize) -> KineditResult<bool> {
        self.ledger.toggle_frame_removal(index)
    }

    pub fn add_frame_range(&mut self, start: usize, end: usize) -> KineditResult<usize> {
        self.ledger.add_frame_range(start, end)
    }

    pub fn add_frames_by_frequency(
        &mut self,
        start: usize,
        end: usize,
        step: usize,
    ) -> KineditResult<usize> {
        self.ledger.add_frames_by_frequency(start, end, step)
    }

    pub fn clear_removed_frames(&mut self) {
        self.ledger.clear_removed_frames();
    }

    pub fn insert_frame(&mut self, anchor: usize, factor: f64) -> KineditResult<()> {
        self.ledger.insert_frame(anchor, factor)
    }

    pub fn insert_frame_default(&mut self, anchor: usize) -> KineditResult<()> {
        self.ledger.insert_frame_default(anchor)
    }

    pub fn remove_inserted_frame(&mut self, anchor: usize) -> bool {
        self.ledger.remove_inserted_frame(anchor)
    }

    pub fn set_trajectory_adjustment(
        &mut self,
        index: usize,
        partial: TrajectoryAdjustment,
    ) -> KineditResult<()> {
        self.ledger.set_trajectory_adjustment(index, partial)
    }

    pub fn remove_trajectory_adjustment(&mut self, index: usize) -> bool {
        self.ledger.remove_trajectory_adjustment(index)
    }

    pub fn clear_trajectory_adjustments(&mut self) {
        self.ledger.clear_trajectory_adjustments();
    }

    pub fn set_global_transform(&mut self, transform: Option<ImageTransform>) {
        self.ledger.set_global_transform(transform);
    }

    pub fn set_camera_transform(
        &mut self,
        camera_id: impl Into<CameraId>,
        transform: Option<ImageTransform>,
    ) {
        self.ledger.set_camera_transform(camera_id, transform);
    }

    pub fn clear_transforms(&mut self) {
        self.ledger.clear_transforms();
    }

    pub fn reset(&mut self) {
        self.ledger.reset();
    }

    /// The effective frame sequence for the current ledger.
    pub fn effective_frames(&self) -> Arc<[EffectiveFrame]> {
        let version = self.ledger.version();
        let mut cache = self.effective.borrow_mut();
        if let Some((cached_version, frames)) = cache.as_ref() {
            if *cached_version == version {
                return Arc::clone(frames);
            }
        }

        let frames: Arc<[EffectiveFrame]> = reconcile::reconcile(
            self.episode.frame_count(),
            self.ledger.removed_frames(),
            self.ledger.insertions(),
        )
        .into();
        tracing::trace!(
            episode = self.episode.episode_index(),
            version,
            frames = frames.len(),
            "Rebuilt effective sequence"
        );
        *cache = Some((version, Arc::clone(&frames)));
        frames
    }

    pub fn effective_frame_count(&self) -> usize {
        reconcile::effective_frame_count(
            self.episode.frame_count(),
            self.ledger.removed_frames(),
            self.ledger.insertions(),
        )
    }

    pub fn effective_frame(&self, index: usize) -> Option<EffectiveFrame> {
        self.effective_frames().get(index).copied()
    }

    /// Trajectory sample shown at effective index `index`.
    pub fn resolve_sample(&self, index: usize) -> KineditResult<TrajectorySample> {
        let frame = self.require_frame(index)?;
        compose::resolve_sample(
            &frame,
            self.episode.trajectory(),
            self.ledger.trajectory_adjustments(),
        )
    }

    pub fn resolve_transform(&self, camera_id: &str) -> Option<&ImageTransform> {
        image_pipeline::resolve_transform(camera_id, self.ledger.transforms())
    }

    /// Image for `camera_id` at effective index `index`, transform applied.
    ///
    /// Synthetic frames show their anchor frame's image.
    pub fn render_frame(&self, camera_id: &str, index: usize) -> KineditResult<RgbImage> {
        let frame = self.require_frame(index)?;
        let source = self
            .episode
            .cameras()
            .get(camera_id)
            .ok_or_else(|| KineditError::UnknownCamera {
                camera: camera_id.to_string(),
            })?;
        let source_index = frame.source_frame_index();
        let image = source.frame(source_index)?.ok_or_else(|| {
            KineditError::corrupt_source(format!(
                "camera '{camera_id}' has no frame {source_index}"
            ))
        })?;
        Ok(image_pipeline::apply_transform(
            &image,
            self.resolve_transform(camera_id),
        ))
    }

    /// Original index to effective index, `None` for removed frames.
    pub fn source_to_effective(&self) -> Vec<Option<usize>> {
        reconcile::source_to_effective(&self.effective_frames(), self.episode.frame_count())
    }

    pub fn effective_subtasks(&self) -> Vec<EffectiveSubtask> {
        reconcile::remap_subtasks(&self.effective_frames(), self.episode.subtasks())
    }

    fn require_frame(&self, index: usize) -> KineditResult<EffectiveFrame> {
        let frames = self.effective_frames();
        frames.get(index).copied().ok_or_else(|| {
            KineditError::invalid_frame_index(
                index,
                frames.len(),
                "effective index out of range",
            )
        })
    }
}
