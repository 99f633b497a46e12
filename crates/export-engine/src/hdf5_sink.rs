//! HDF5 output: one file per episode, holding one group for that episode.
//!
//! ```text
//! episode_000003.hdf5
//! └── episode_000003/              attrs: episode_index, fps, frame_count
//!     ├── frame_index              (N)           u64
//!     ├── timestamp                (N)           f64
//!     ├── joint_positions          (N, 16)       f64
//!     ├── joint_velocities         (N, 16)       f64
//!     ├── images/<camera>          (N, H, W, 3)  u8
//!     └── subtasks/label, span     (M), (M, 2)   str, u64
//! ```
//!
//! Rows are in effective order. Frames are buffered per episode and the file
//! is written on commit, into a hidden staging file that is then renamed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hdf5::types::VarLenUnicode;
use hdf5::{Extents, Group, H5Type};
use image::RgbImage;
use kinedit_common::error::{KineditError, KineditResult};
use kinedit_episode_model::bundle::{episode_dir_name, EpisodeManifest};
use kinedit_episode_model::episode::{
    CameraId, FrameSource, InMemoryFrames, OriginalEpisode, SubtaskSpan, TrajectorySample,
    JOINT_COUNT,
};

use crate::export::ExportFormat;
use crate::retry::RetryPolicy;
use crate::sink::{publish, remove_path, CommittedEpisode, DatasetSink, EpisodeWriter, FrameRecord};

pub const HDF5_EXTENSION: &str = "hdf5";

const IMAGES_GROUP: &str = "images";
const SUBTASKS_GROUP: &str = "subtasks";

/// Writes each episode to `<root>/episode_NNNNNN.hdf5`.
#[derive(Debug, Clone)]
pub struct Hdf5Sink {
    root: PathBuf,
    retry: RetryPolicy,
}

impl Hdf5Sink {
    pub fn new(root: impl Into<PathBuf>, retry: RetryPolicy) -> Self {
        Self {
            root: root.into(),
            retry,
        }
    }

    /// Final file for an episode.
    pub fn episode_file(&self, episode_index: usize) -> PathBuf {
        self.root
            .join(format!("{}.{HDF5_EXTENSION}", episode_dir_name(episode_index)))
    }

    fn staging_file(&self, episode_index: usize) -> PathBuf {
        self.root.join(format!(
            ".{}.{HDF5_EXTENSION}.partial",
            episode_dir_name(episode_index)
        ))
    }
}

impl DatasetSink for Hdf5Sink {
    fn format(&self) -> ExportFormat {
        ExportFormat::Hdf5
    }

    fn open_episode(&self, manifest: &EpisodeManifest) -> KineditResult<Box<dyn EpisodeWriter>> {
        let root = &self.root;
        self.retry.run(root, || std::fs::create_dir_all(root))?;

        let staging = self.staging_file(manifest.episode_index);
        if staging.exists() {
            tracing::debug!(path = %staging.display(), "Removing stale staging file");
            remove_path(&staging, self.retry)?;
        }

        Ok(Box::new(Hdf5Writer {
            manifest: manifest.clone(),
            staging,
            target: self.episode_file(manifest.episode_index),
            retry: self.retry,
            trajectory: Vec::with_capacity(manifest.frame_count),
            images: BTreeMap::new(),
            subtasks: Vec::new(),
        }))
    }
}

/// Frames of one camera, packed row-major as `(N, H, W, 3)`.
struct CameraFrames {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

struct Hdf5Writer {
    manifest: EpisodeManifest,
    staging: PathBuf,
    target: PathBuf,
    retry: RetryPolicy,
    trajectory: Vec<TrajectorySample>,
    images: BTreeMap<CameraId, CameraFrames>,
    subtasks: Vec<SubtaskSpan>,
}

impl EpisodeWriter for Hdf5Writer {
    fn write_frame(&mut self, frame: &FrameRecord) -> KineditResult<()> {
        for (camera, image) in &frame.images {
            let frames = self
                .images
                .entry(camera.clone())
                .or_insert_with(|| CameraFrames {
                    width: image.width(),
                    height: image.height(),
                    pixels: Vec::new(),
                });
            if image.dimensions() != (frames.width, frames.height) {
                return Err(KineditError::corrupt_source(format!(
                    "camera '{camera}' frame {} is {}x{}, earlier frames are {}x{}",
                    frame.frame_index,
                    image.width(),
                    image.height(),
                    frames.width,
                    frames.height
                )));
            }
            frames.pixels.extend_from_slice(image.as_raw());
        }
        self.trajectory.push(frame.sample.clone());
        Ok(())
    }

    fn write_subtasks(&mut self, spans: &[SubtaskSpan]) -> KineditResult<()> {
        self.subtasks = spans.to_vec();
        Ok(())
    }

    fn commit(self: Box<Self>) -> KineditResult<Box<dyn CommittedEpisode>> {
        let labels = self
            .subtasks
            .iter()
            .map(|span| {
                span.label.parse::<VarLenUnicode>().map_err(|e| {
                    KineditError::Other(anyhow::anyhow!(
                        "subtask label {:?} cannot be stored: {e}",
                        span.label
                    ))
                })
            })
            .collect::<KineditResult<Vec<_>>>()?;

        self.write_file(&labels).map_err(|e| hdf5_error(&self.staging, e))?;
        tracing::debug!(
            path = %self.staging.display(),
            frames = self.trajectory.len(),
            cameras = self.images.len(),
            "Wrote HDF5 episode"
        );

        if self.target.exists() {
            tracing::info!(path = %self.target.display(), "Replacing existing episode output");
        }
        let published = publish(&self.staging, &self.target, self.retry)?;
        Ok(Box::new(published))
    }
}

impl Hdf5Writer {
    /// Write the buffered episode to the staging file. The file is closed on return.
    fn write_file(&self, labels: &[VarLenUnicode]) -> hdf5::Result<()> {
        let file = hdf5::File::create(&self.staging)?;
        let group = file.create_group(&episode_dir_name(self.manifest.episode_index))?;
        let n = self.trajectory.len();

        write_attr(&group, "episode_index", &(self.manifest.episode_index as u64))?;
        write_attr(&group, "fps", &self.manifest.fps)?;
        write_attr(&group, "frame_count", &(n as u64))?;

        let frame_index: Vec<u64> = self.trajectory.iter().map(|s| s.frame_index as u64).collect();
        let timestamp: Vec<f64> = self.trajectory.iter().map(|s| s.timestamp).collect();
        let positions: Vec<f64> = self
            .trajectory
            .iter()
            .flat_map(|s| s.joint_positions)
            .collect();
        let velocities: Vec<f64> = self
            .trajectory
            .iter()
            .flat_map(|s| s.joint_velocities)
            .collect();
        write_dataset(&group, "frame_index", n, &frame_index)?;
        write_dataset(&group, "timestamp", n, &timestamp)?;
        write_dataset(&group, "joint_positions", (n, JOINT_COUNT), &positions)?;
        write_dataset(&group, "joint_velocities", (n, JOINT_COUNT), &velocities)?;

        let images = group.create_group(IMAGES_GROUP)?;
        for (camera, frames) in &self.images {
            let shape = (n, frames.height as usize, frames.width as usize, 3);
            write_dataset(&images, camera, shape, &frames.pixels)?;
        }

        if !self.subtasks.is_empty() {
            let subtasks = group.create_group(SUBTASKS_GROUP)?;
            let spans: Vec<u64> = self
                .subtasks
                .iter()
                .flat_map(|s| [s.start_frame as u64, s.end_frame as u64])
                .collect();
            write_dataset(&subtasks, "label", labels.len(), labels)?;
            write_dataset(&subtasks, "span", (self.subtasks.len(), 2), &spans)?;
        }
        Ok(())
    }
}

impl Drop for Hdf5Writer {
    fn drop(&mut self) {
        // Still present only when the episode was never published.
        if !self.staging.exists() {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.staging) {
            tracing::warn!(
                path = %self.staging.display(),
                error = %e,
                "Failed to clean up staging file"
            );
        }
    }
}

fn write_attr<T: H5Type>(group: &Group, name: &str, value: &T) -> hdf5::Result<()> {
    group.new_attr::<T>().shape(()).create(name)?.write_scalar(value)
}

fn write_dataset<T: H5Type>(
    group: &Group,
    name: &str,
    shape: impl Into<Extents>,
    data: &[T],
) -> hdf5::Result<()> {
    let dataset = group.new_dataset::<T>().shape(shape).create(name)?;
    if !data.is_empty() {
        dataset.write_raw(data)?;
    }
    Ok(())
}

fn hdf5_error(path: &Path, e: hdf5::Error) -> KineditError {
    KineditError::Other(anyhow::anyhow!("HDF5 error in {}: {e}", path.display()))
}

/// Load an exported HDF5 episode back into memory.
pub fn load_hdf5_episode(path: &Path) -> KineditResult<OriginalEpisode> {
    if !path.exists() {
        return Err(KineditError::FileNotFound {
            path: path.to_path_buf(),
        });
    }
    let raw = read_file(path).map_err(|e| hdf5_error(path, e))?;
    let corrupt = |what: &str| {
        KineditError::corrupt_source(format!("{}: {what}", path.display()))
    };

    let n = raw.frame_index.len();
    if raw.timestamp.len() != n
        || raw.positions.len() != n * JOINT_COUNT
        || raw.velocities.len() != n * JOINT_COUNT
    {
        return Err(corrupt("trajectory datasets disagree on length"));
    }
    let trajectory = (0..n)
        .map(|i| {
            let row = i * JOINT_COUNT..(i + 1) * JOINT_COUNT;
            let mut sample = TrajectorySample::zeroed(raw.frame_index[i] as usize, raw.timestamp[i]);
            sample.joint_positions.copy_from_slice(&raw.positions[row.clone()]);
            sample.joint_velocities.copy_from_slice(&raw.velocities[row]);
            sample
        })
        .collect();

    let mut cameras: BTreeMap<CameraId, Arc<dyn FrameSource>> = BTreeMap::new();
    for (camera, shape, pixels) in raw.cameras {
        let [frames, height, width, 3] = shape[..] else {
            return Err(corrupt(&format!("camera '{camera}' has shape {shape:?}")));
        };
        let frame_len = height * width * 3;
        if frames != n || pixels.len() != frames * frame_len {
            return Err(corrupt(&format!("camera '{camera}' has {frames} frames for {n} samples")));
        }
        let images = pixels
            .chunks_exact(frame_len.max(1))
            .map(|chunk| {
                RgbImage::from_raw(width as u32, height as u32, chunk.to_vec())
                    .ok_or_else(|| corrupt(&format!("camera '{camera}' frame size")))
            })
            .collect::<KineditResult<Vec<_>>>()?;
        cameras.insert(camera, Arc::new(InMemoryFrames::new(images)));
    }

    if raw.spans.len() != raw.labels.len() * 2 {
        return Err(corrupt("subtask labels and spans disagree on length"));
    }
    let subtasks = raw
        .labels
        .into_iter()
        .zip(raw.spans.chunks_exact(2))
        .map(|(label, span)| SubtaskSpan {
            label,
            start_frame: span[0] as usize,
            end_frame: span[1] as usize,
        })
        .collect();

    OriginalEpisode::new(raw.episode_index as usize, raw.fps, trajectory, cameras)?
        .with_subtasks(subtasks)
}

struct RawEpisode {
    episode_index: u64,
    fps: f64,
    frame_index: Vec<u64>,
    timestamp: Vec<f64>,
    positions: Vec<f64>,
    velocities: Vec<f64>,
    cameras: Vec<(CameraId, Vec<usize>, Vec<u8>)>,
    labels: Vec<String>,
    spans: Vec<u64>,
}

fn read_file(path: &Path) -> hdf5::Result<RawEpisode> {
    let file = hdf5::File::open(path)?;
    let group = match path.file_stem().and_then(|s| s.to_str()) {
        Some(stem) if file.link_exists(stem) => file.group(stem)?,
        _ => match file.groups()?.into_iter().next() {
            Some(group) => group,
            None => return Err("file holds no episode group".into()),
        },
    };

    let mut cameras = Vec::new();
    if group.link_exists(IMAGES_GROUP) {
        for dataset in group.group(IMAGES_GROUP)?.datasets()? {
            let name = dataset.name();
            let camera = name.rsplit('/').next().unwrap_or_default().to_string();
            cameras.push((camera, dataset.shape(), dataset.read_raw::<u8>()?));
        }
    }

    let (labels, spans) = if group.link_exists(SUBTASKS_GROUP) {
        let subtasks = group.group(SUBTASKS_GROUP)?;
        let labels = subtasks
            .dataset("label")?
            .read_raw::<VarLenUnicode>()?
            .iter()
            .map(|l| l.as_str().to_string())
            .collect();
        (labels, subtasks.dataset("span")?.read_raw::<u64>()?)
    } else {
        (Vec::new(), Vec::new())
    };

    Ok(RawEpisode {
        episode_index: group.attr("episode_index")?.read_scalar()?,
        fps: group.attr("fps")?.read_scalar()?,
        frame_index: group.dataset("frame_index")?.read_raw()?,
        timestamp: group.dataset("timestamp")?.read_raw()?,
        positions: group.dataset("joint_positions")?.read_raw()?,
        velocities: group.dataset("joint_velocities")?.read_raw()?,
        cameras,
        labels,
        spans,
    })
}
