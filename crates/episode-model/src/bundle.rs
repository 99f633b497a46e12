//! On-disk episode bundle layout.
//!
//! ```text
//! <dataset>/episode_000007/
//!   episode.json            manifest (index, fps, frame count, cameras)
//!   trajectory.jsonl        one TrajectorySample per line
//!   subtasks.json           optional subtask spans
//!   cameras/<id>/000000.png one PNG per frame and camera
//! ```
//!
//! The export sink writes this same layout, so an exported episode can be
//! loaded back as an original.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::RgbImage;
use kinedit_common::error::{KineditError, KineditResult};
use serde::{Deserialize, Serialize};

use crate::episode::{
    CameraId, EpisodeProvider, FrameSource, OriginalEpisode, SubtaskSpan, TrajectorySample,
};

pub const MANIFEST_FILE: &str = "episode.json";
pub const TRAJECTORY_FILE: &str = "trajectory.jsonl";
pub const SUBTASKS_FILE: &str = "subtasks.json";
pub const CAMERAS_DIR: &str = "cameras";

/// Contents of `episode.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeManifest {
    pub episode_index: usize,
    pub fps: f64,
    pub frame_count: usize,
    pub cameras: Vec<CameraId>,
}

/// Directory name for an episode inside a dataset.
pub fn episode_dir_name(episode_index: usize) -> String {
    format!("episode_{episode_index:06}")
}

/// File name of one camera frame.
pub fn frame_file_name(frame_index: usize) -> String {
    format!("{frame_index:06}.png")
}

/// Parse trajectory samples from JSONL content (one sample per line).
pub fn parse_trajectory(jsonl: &str) -> Result<Vec<TrajectorySample>, serde_json::Error> {
    jsonl
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(serde_json::from_str)
        .collect()
}

/// Serialize one sample as a JSONL line, newline included.
pub fn trajectory_line(sample: &TrajectorySample) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(sample)?;
    line.push('\n');
    Ok(line)
}

/// PNG frames of one camera inside a bundle.
#[derive(Debug, Clone)]
pub struct PngFrameSource {
    dir: PathBuf,
    frame_count: usize,
}

impl PngFrameSource {
    pub fn new(dir: impl Into<PathBuf>, frame_count: usize) -> Self {
        Self {
            dir: dir.into(),
            frame_count,
        }
    }
}

impl FrameSource for PngFrameSource {
    fn frame(&self, index: usize) -> KineditResult<Option<RgbImage>> {
        if index >= self.frame_count {
            return Ok(None);
        }
        let path = self.dir.join(frame_file_name(index));
        if !path.exists() {
            return Ok(None);
        }
        let image = image::open(&path).map_err(|e| {
            KineditError::corrupt_source(format!("cannot decode {}: {e}", path.display()))
        })?;
        Ok(Some(image.to_rgb8()))
    }

    fn len(&self) -> usize {
        self.frame_count
    }
}

/// Loader for a single episode directory.
pub struct EpisodeBundle;

impl EpisodeBundle {
    /// Load the manifest only.
    pub fn manifest(dir: impl AsRef<Path>) -> KineditResult<EpisodeManifest> {
        let path = dir.as_ref().join(MANIFEST_FILE);
        let raw = read_required(&path)?;
        serde_json::from_str(&raw).map_err(|e| {
            KineditError::corrupt_source(format!("invalid manifest {}: {e}", path.display()))
        })
    }

    /// Load an episode from its bundle directory.
    pub fn load(dir: impl AsRef<Path>) -> KineditResult<OriginalEpisode> {
        let dir = dir.as_ref();
        let manifest = Self::manifest(dir)?;

        let trajectory_path = dir.join(TRAJECTORY_FILE);
        let trajectory = parse_trajectory(&read_required(&trajectory_path)?).map_err(|e| {
            KineditError::corrupt_source(format!(
                "invalid trajectory {}: {e}",
                trajectory_path.display()
            ))
        })?;

        if trajectory.len() != manifest.frame_count {
            return Err(KineditError::corrupt_source(format!(
                "{}: manifest declares {} frames but trajectory has {} samples",
                dir.display(),
                manifest.frame_count,
                trajectory.len()
            )));
        }

        let cameras: BTreeMap<CameraId, Arc<dyn FrameSource>> = manifest
            .cameras
            .iter()
            .map(|id| {
                let source: Arc<dyn FrameSource> = Arc::new(PngFrameSource::new(
                    dir.join(CAMERAS_DIR).join(id),
                    manifest.frame_count,
                ));
                (id.clone(), source)
            })
            .collect();

        let episode =
            OriginalEpisode::new(manifest.episode_index, manifest.fps, trajectory, cameras)?;

        let subtasks_path = dir.join(SUBTASKS_FILE);
        if !subtasks_path.exists() {
            return Ok(episode);
        }
        let subtasks: Vec<SubtaskSpan> = serde_json::from_str(&read_required(&subtasks_path)?)
            .map_err(|e| {
                KineditError::corrupt_source(format!(
                    "invalid subtasks {}: {e}",
                    subtasks_path.display()
                ))
            })?;

        tracing::debug!(
            episode = manifest.episode_index,
            frames = manifest.frame_count,
            cameras = manifest.cameras.len(),
            subtasks = subtasks.len(),
            "Loaded episode bundle"
        );
        episode.with_subtasks(subtasks)
    }
}

/// Episodes stored as `episode_NNNNNN` directories under one root.
#[derive(Debug, Clone)]
pub struct DirectoryProvider {
    root: PathBuf,
}

impl DirectoryProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn episode_dir(&self, episode_index: usize) -> PathBuf {
        self.root.join(episode_dir_name(episode_index))
    }
}

impl EpisodeProvider for DirectoryProvider {
    fn load(&self, episode_index: usize) -> KineditResult<OriginalEpisode> {
        let dir = self.episode_dir(episode_index);
        if !dir.is_dir() {
            return Err(KineditError::FileNotFound { path: dir });
        }
        EpisodeBundle::load(dir)
    }
}

fn read_required(path: &Path) -> KineditResult<String> {
    if !path.exists() {
        return Err(KineditError::FileNotFound {
            path: path.to_path_buf(),
        });
    }
    Ok(std::fs::read_to_string(path)?)
}
