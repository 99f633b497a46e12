//! Dataset sinks: where materialized episodes are written.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use image::codecs::png::PngEncoder;
use image::{ColorType, ImageEncoder, RgbImage};
use kinedit_common::error::KineditResult;
use kinedit_episode_model::bundle::{
    episode_dir_name, frame_file_name, trajectory_line, EpisodeManifest, CAMERAS_DIR,
    MANIFEST_FILE, SUBTASKS_FILE, TRAJECTORY_FILE,
};
use kinedit_episode_model::episode::{CameraId, SubtaskSpan, TrajectorySample};

use crate::export::ExportFormat;
use crate::retry::RetryPolicy;

/// One effective frame ready to be written.
#[derive(Debug, Clone)]
pub struct FrameRecord {
    /// Position in the exported episode.
    pub frame_index: usize,
    pub sample: TrajectorySample,
    pub images: BTreeMap<CameraId, RgbImage>,
}

/// Output container for exported episodes.
///
/// Shared between export tasks, so it must be thread-safe. Anything that
/// can hold per-episode state lives in the [`EpisodeWriter`] it opens.
pub trait DatasetSink: Send + Sync {
    /// Container format this sink produces.
    fn format(&self) -> ExportFormat;

    /// Begin writing one episode.
    fn open_episode(&self, manifest: &EpisodeManifest) -> KineditResult<Box<dyn EpisodeWriter>>;
}

/// Writer for a single episode.
///
/// Nothing is visible at the final location until [`EpisodeWriter::commit`]
/// succeeds. Dropping a writer without committing discards its output.
pub trait EpisodeWriter: Send {
    fn write_frame(&mut self, frame: &FrameRecord) -> KineditResult<()>;

    fn write_subtasks(&mut self, spans: &[SubtaskSpan]) -> KineditResult<()>;

    /// Publish the episode at its final location.
    fn commit(self: Box<Self>) -> KineditResult<Box<dyn CommittedEpisode>>;
}

/// A published episode whose batch has not settled yet.
///
/// Whatever the episode replaced is kept until [`CommittedEpisode::finalize`],
/// so a failed batch can put it back with [`CommittedEpisode::roll_back`].
pub trait CommittedEpisode: Send {
    fn output_path(&self) -> &Path;

    /// Keep the new output and drop what it replaced.
    fn finalize(self: Box<Self>) -> KineditResult<()>;

    /// Remove the new output and restore what it replaced, if anything.
    fn roll_back(self: Box<Self>) -> KineditResult<()>;
}

/// Move `staging` to `target`, keeping an existing `target` aside as a backup.
///
/// Works for files and directories. If the final rename fails the backup is
/// moved back before the error is returned.
pub fn publish(staging: &Path, target: &Path, retry: RetryPolicy) -> KineditResult<Published> {
    let backup = if target.exists() {
        let backup = backup_path(target);
        if backup.exists() {
            tracing::debug!(path = %backup.display(), "Removing stale backup");
            remove_path(&backup, retry)?;
        }
        retry.run(target, || std::fs::rename(target, &backup))?;
        Some(backup)
    } else {
        None
    };

    if let Err(e) = retry.run(target, || std::fs::rename(staging, target)) {
        if let Some(backup) = &backup {
            if let Err(restore_err) = std::fs::rename(backup, target) {
                tracing::error!(
                    path = %target.display(),
                    backup = %backup.display(),
                    error = %restore_err,
                    "Failed to restore previous output"
                );
            }
        }
        return Err(e);
    }

    Ok(Published {
        output: target.to_path_buf(),
        backup,
        retry,
        settled: false,
    })
}

/// Output moved into place by [`publish`].
#[derive(Debug)]
pub struct Published {
    output: PathBuf,
    backup: Option<PathBuf>,
    retry: RetryPolicy,
    settled: bool,
}

impl Published {
    /// Where the replaced output is kept, if there was one.
    pub fn backup(&self) -> Option<&Path> {
        self.backup.as_deref()
    }
}

impl CommittedEpisode for Published {
    fn output_path(&self) -> &Path {
        &self.output
    }

    fn finalize(mut self: Box<Self>) -> KineditResult<()> {
        self.settled = true;
        match self.backup.take() {
            Some(backup) => remove_path(&backup, self.retry),
            None => Ok(()),
        }
    }

    fn roll_back(mut self: Box<Self>) -> KineditResult<()> {
        self.settled = true;
        remove_path(&self.output, self.retry)?;
        if let Some(backup) = self.backup.take() {
            let output = &self.output;
            self.retry.run(output, || std::fs::rename(&backup, output))?;
        }
        Ok(())
    }
}

impl Drop for Published {
    fn drop(&mut self) {
        // Unsettled: the output stays, the backup goes.
        if self.settled {
            return;
        }
        if let Some(backup) = self.backup.take() {
            if let Err(e) = remove_path(&backup, RetryPolicy::none()) {
                tracing::warn!(path = %backup.display(), error = %e, "Failed to remove backup");
            }
        }
    }
}

/// Hidden sibling used to hold a replaced output.
fn backup_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{name}.backup"))
}

/// Remove a file or directory tree. Missing paths are fine.
pub(crate) fn remove_path(path: &Path, retry: RetryPolicy) -> KineditResult<()> {
    if path.is_dir() {
        retry.run(path, || std::fs::remove_dir_all(path))
    } else if path.exists() {
        retry.run(path, || std::fs::remove_file(path))
    } else {
        Ok(())
    }
}

/// Writes episodes in the on-disk bundle layout.
#[derive(Debug, Clone)]
pub struct BundleSink {
    root: PathBuf,
    retry: RetryPolicy,
}

impl BundleSink {
    pub fn new(root: impl Into<PathBuf>, retry: RetryPolicy) -> Self {
        Self {
            root: root.into(),
            retry,
        }
    }

    /// Final directory for an episode.
    pub fn episode_dir(&self, episode_index: usize) -> PathBuf {
        self.root.join(episode_dir_name(episode_index))
    }

    fn staging_dir(&self, episode_index: usize) -> PathBuf {
        self.root
            .join(format!(".{}.partial", episode_dir_name(episode_index)))
    }
}

impl DatasetSink for BundleSink {
    fn format(&self) -> ExportFormat {
        ExportFormat::Bundle
    }

    fn open_episode(&self, manifest: &EpisodeManifest) -> KineditResult<Box<dyn EpisodeWriter>> {
        let staging = self.staging_dir(manifest.episode_index);
        if staging.exists() {
            tracing::debug!(path = %staging.display(), "Removing stale staging directory");
            self.retry
                .run(&staging, || std::fs::remove_dir_all(&staging))?;
        }

        for camera in &manifest.cameras {
            let dir = staging.join(CAMERAS_DIR).join(camera);
            self.retry.run(&dir, || std::fs::create_dir_all(&dir))?;
        }
        self.retry.run(&staging, || std::fs::create_dir_all(&staging))?;

        let writer = BundleWriter {
            staging,
            target: self.episode_dir(manifest.episode_index),
            retry: self.retry,
            trajectory: String::new(),
            committed: false,
        };

        let manifest_json = serde_json::to_vec_pretty(manifest)?;
        writer.write_file(MANIFEST_FILE, &manifest_json)?;
        Ok(Box::new(writer))
    }
}

struct BundleWriter {
    staging: PathBuf,
    target: PathBuf,
    retry: RetryPolicy,
    trajectory: String,
    committed: bool,
}

impl BundleWriter {
    fn write_file(&self, relative: impl AsRef<Path>, bytes: &[u8]) -> KineditResult<()> {
        let path = self.staging.join(relative);
        self.retry.run(&path, || std::fs::write(&path, bytes))
    }
}

impl EpisodeWriter for BundleWriter {
    fn write_frame(&mut self, frame: &FrameRecord) -> KineditResult<()> {
        for (camera, image) in &frame.images {
            let png = encode_png(image)?;
            let relative = Path::new(CAMERAS_DIR)
                .join(camera)
                .join(frame_file_name(frame.frame_index));
            self.write_file(relative, &png)?;
        }
        self.trajectory.push_str(&trajectory_line(&frame.sample)?);
        Ok(())
    }

    fn write_subtasks(&mut self, spans: &[SubtaskSpan]) -> KineditResult<()> {
        let json = serde_json::to_vec_pretty(spans)?;
        self.write_file(SUBTASKS_FILE, &json)
    }

    fn commit(mut self: Box<Self>) -> KineditResult<Box<dyn CommittedEpisode>> {
        self.write_file(TRAJECTORY_FILE, self.trajectory.as_bytes())?;
        if self.target.exists() {
            tracing::info!(path = %self.target.display(), "Replacing existing episode output");
        }
        let published = publish(&self.staging, &self.target, self.retry)?;
        self.committed = true;
        Ok(Box::new(published))
    }
}

impl Drop for BundleWriter {
    fn drop(&mut self) {
        if self.committed || !self.staging.exists() {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.staging) {
            tracing::warn!(
                path = %self.staging.display(),
                error = %e,
                "Failed to clean up staging directory"
            );
        }
    }
}

/// Encode an image as PNG in memory. Deterministic for identical input.
pub fn encode_png(image: &RgbImage) -> KineditResult<Vec<u8>> {
    let mut bytes = Vec::new();
    PngEncoder::new(&mut bytes).write_image(
        image.as_raw(),
        image.width(),
        image.height(),
        ColorType::Rgb8,
    )?;
    Ok(bytes)
}
