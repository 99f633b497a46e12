//! Recorded episode types.
//!
//! An episode is the immutable input to every edit: a trajectory time series
//! sampled once per frame, plus one frame source per camera. Nothing in this
//! module is ever mutated after the loader hands it over.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use image::RgbImage;
use kinedit_common::error::{KineditError, KineditResult};
use serde::{Deserialize, Serialize};

/// Camera identifier (e.g. `"top"`, `"left_wrist"`).
pub type CameraId = String;

/// Number of joint channels recorded per sample.
pub const JOINT_COUNT: usize = 16;

/// Per-sample joint vector.
pub type JointVector = [f64; JOINT_COUNT];

/// Index layout of [`JointVector`].
pub mod joints {
    use std::ops::Range;

    /// Right-arm end-effector position (x, y, z).
    pub const RIGHT_ARM_XYZ: Range<usize> = 0..3;
    /// Right-arm orientation quaternion.
    pub const RIGHT_ARM_QUAT: Range<usize> = 3..7;
    /// Right gripper opening.
    pub const RIGHT_GRIPPER: usize = 7;
    /// Left-arm end-effector position (x, y, z).
    pub const LEFT_ARM_XYZ: Range<usize> = 8..11;
    /// Left-arm orientation quaternion.
    pub const LEFT_ARM_QUAT: Range<usize> = 11..15;
    /// Left gripper opening.
    pub const LEFT_GRIPPER: usize = 15;
}

/// One trajectory sample, recorded once per frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectorySample {
    /// Frame index this sample belongs to.
    pub frame_index: usize,

    /// Seconds since episode start.
    pub timestamp: f64,

    /// Joint positions, see [`joints`] for the layout.
    pub joint_positions: JointVector,

    /// Joint velocities, same layout as positions.
    pub joint_velocities: JointVector,
}

impl TrajectorySample {
    /// Sample with zeroed joints.
    pub fn zeroed(frame_index: usize, timestamp: f64) -> Self {
        Self {
            frame_index,
            timestamp,
            joint_positions: [0.0; JOINT_COUNT],
            joint_velocities: [0.0; JOINT_COUNT],
        }
    }
}

/// A labelled span of original frames (inclusive on both ends).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskSpan {
    pub label: String,
    pub start_frame: usize,
    pub end_frame: usize,
}

/// Supplies decoded images for one camera, addressed by original frame index.
///
/// Implemented by the upstream decoder. `Ok(None)` means the index has no
/// frame; the export treats that as corrupt source data.
pub trait FrameSource: Send + Sync + fmt::Debug {
    /// Decode the frame at `index`.
    fn frame(&self, index: usize) -> KineditResult<Option<RgbImage>>;

    /// Number of frames the source can supply.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Frames held in memory. Used by tests and small synthetic episodes.
#[derive(Debug, Clone, Default)]
pub struct InMemoryFrames {
    frames: Vec<RgbImage>,
}

impl InMemoryFrames {
    pub fn new(frames: Vec<RgbImage>) -> Self {
        Self { frames }
    }
}

impl FrameSource for InMemoryFrames {
    fn frame(&self, index: usize) -> KineditResult<Option<RgbImage>> {
        Ok(self.frames.get(index).cloned())
    }

    fn len(&self) -> usize {
        self.frames.len()
    }
}

/// An immutable recorded episode.
#[derive(Clone)]
pub struct OriginalEpisode {
    episode_index: usize,
    fps: f64,
    trajectory: Arc<[TrajectorySample]>,
    cameras: BTreeMap<CameraId, Arc<dyn FrameSource>>,
    subtasks: Vec<SubtaskSpan>,
}

impl OriginalEpisode {
    /// Build an episode, checking the invariants the engine relies on.
    ///
    /// `frame_count` is the trajectory length.
    pub fn new(
        episode_index: usize,
        fps: f64,
        trajectory: Vec<TrajectorySample>,
        cameras: BTreeMap<CameraId, Arc<dyn FrameSource>>,
    ) -> KineditResult<Self> {
        if !(fps.is_finite() && fps > 0.0) {
            return Err(KineditError::corrupt_source(format!(
                "episode {episode_index}: fps must be positive, got {fps}"
            )));
        }

        Ok(Self {
            episode_index,
            fps,
            trajectory: trajectory.into(),
            cameras,
            subtasks: Vec::new(),
        })
    }

    /// Attach subtask annotations. Spans outside the episode are rejected.
    pub fn with_subtasks(mut self, subtasks: Vec<SubtaskSpan>) -> KineditResult<Self> {
        for span in &subtasks {
            if span.start_frame > span.end_frame || span.end_frame >= self.frame_count() {
                return Err(KineditError::corrupt_source(format!(
                    "episode {}: subtask '{}' spans {}..={} outside {} frames",
                    self.episode_index,
                    span.label,
                    span.start_frame,
                    span.end_frame,
                    self.frame_count()
                )));
            }
        }
        self.subtasks = subtasks;
        Ok(self)
    }

    pub fn episode_index(&self) -> usize {
        self.episode_index
    }

    pub fn frame_count(&self) -> usize {
        self.trajectory.len()
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    pub fn trajectory(&self) -> &[TrajectorySample] {
        &self.trajectory
    }

    pub fn cameras(&self) -> &BTreeMap<CameraId, Arc<dyn FrameSource>> {
        &self.cameras
    }

    pub fn camera_ids(&self) -> impl Iterator<Item = &str> {
        self.cameras.keys().map(String::as_str)
    }

    pub fn subtasks(&self) -> &[SubtaskSpan] {
        &self.subtasks
    }
}

impl fmt::Debug for OriginalEpisode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OriginalEpisode")
            .field("episode_index", &self.episode_index)
            .field("frame_count", &self.frame_count())
            .field("fps", &self.fps)
            .field("cameras", &self.cameras.keys().collect::<Vec<_>>())
            .field("subtasks", &self.subtasks.len())
            .finish()
    }
}

/// Loads episodes by dataset index.
pub trait EpisodeProvider: Send + Sync {
    fn load(&self, episode_index: usize) -> KineditResult<OriginalEpisode>;
}
