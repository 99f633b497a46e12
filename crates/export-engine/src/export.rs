//! Export requests, results and job management.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use kinedit_common::config::ExportDefaults;
use kinedit_common::error::{ErrorKind, KineditError, KineditResult};
use kinedit_episode_model::episode::EpisodeProvider;
use kinedit_episode_model::ledger::EditLedger;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::materialize::{materialize_episode, MaterializeOptions};
use crate::retry::RetryPolicy;
#[cfg(feature = "hdf5")]
use crate::hdf5_sink::Hdf5Sink;
use crate::sink::{BundleSink, CommittedEpisode, DatasetSink};

/// Output container formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    /// One HDF5 file per episode.
    #[default]
    Hdf5,
    /// Episode bundle directories, loadable as a source dataset.
    Bundle,
}

/// A request to export one or more episodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportRequest {
    pub episode_indices: Vec<usize>,

    /// Dataset root the episodes are written under.
    pub output_path: PathBuf,

    /// When false, every episode is exported exactly as recorded.
    #[serde(default = "default_true")]
    pub apply_edits: bool,

    #[serde(default)]
    pub include_subtasks: bool,

    #[serde(default)]
    pub format: ExportFormat,

    /// Ledgers by episode index. Episodes without one export unedited.
    #[serde(default)]
    pub edits: BTreeMap<usize, EditLedger>,
}

fn default_true() -> bool {
    true
}

impl ExportRequest {
    pub fn new(episode_indices: Vec<usize>, output_path: impl Into<PathBuf>) -> Self {
        Self {
            episode_indices,
            output_path: output_path.into(),
            apply_edits: true,
            include_subtasks: false,
            format: ExportFormat::default(),
            edits: BTreeMap::new(),
        }
    }

    /// Episode indices in request order, duplicates dropped.
    pub fn unique_episodes(&self) -> Vec<usize> {
        let mut seen = BTreeSet::new();
        self.episode_indices
            .iter()
            .copied()
            .filter(|i| seen.insert(*i))
            .collect()
    }
}

/// Outcome of an export request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportResult {
    pub success: bool,

    /// Frames written across all episodes. Zero when the export failed.
    pub frames_written: usize,

    /// One output per exported episode.
    pub output_paths: Vec<PathBuf>,

    pub error: Option<ErrorKind>,

    /// Human-readable error detail, when `error` is set.
    pub error_message: Option<String>,

    /// Ledger version each episode was exported at (0 for unedited exports).
    pub ledger_versions: BTreeMap<usize, u64>,

    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Progress callback for exports.
pub type ProgressCallback = Box<dyn Fn(ExportProgress) + Send>;

/// Export progress report.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportProgress {
    /// Episode currently being written.
    pub episode_index: usize,

    /// Frames of this episode written so far.
    pub processed: usize,

    /// Frames this episode will have.
    pub total: usize,

    pub stage: ExportStage,
}

/// Stages of the export process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportStage {
    Preparing,
    Rendering,
    Finalizing,
    Complete,
    Failed,
}

/// Runs exports and keeps at most one in flight per episode.
#[derive(Clone)]
pub struct ExportCoordinator {
    provider: Arc<dyn EpisodeProvider>,
    defaults: ExportDefaults,
    sinks: BTreeMap<ExportFormat, Arc<dyn DatasetSink>>,
    in_flight: Arc<Mutex<BTreeSet<usize>>>,
}

impl ExportCoordinator {
    pub fn new(provider: Arc<dyn EpisodeProvider>, defaults: ExportDefaults) -> Self {
        Self {
            provider,
            defaults,
            sinks: BTreeMap::new(),
            in_flight: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    /// Register a sink for a format, replacing the built-in one that writes
    /// under the request's output path.
    pub fn with_sink(mut self, sink: Arc<dyn DatasetSink>) -> Self {
        self.sinks.insert(sink.format(), sink);
        self
    }

    /// Episodes currently being exported.
    pub fn in_flight(&self) -> Vec<usize> {
        lock(&self.in_flight).iter().copied().collect()
    }

    /// Start an export on the blocking pool.
    ///
    /// Fails immediately, before any work starts, if any requested episode
    /// is already being exported or the format is not available in this
    /// build. Must be called from within a tokio runtime.
    pub fn start(
        &self,
        request: ExportRequest,
        progress: Option<ProgressCallback>,
    ) -> KineditResult<ExportHandle> {
        let sink = self.sink_for(&request)?;
        let episodes = request.unique_episodes();
        let guard = InFlightGuard::acquire(&self.in_flight, &episodes)?;

        tracing::info!(
            episodes = ?episodes,
            output = %request.output_path.display(),
            format = ?request.format,
            apply_edits = request.apply_edits,
            "Starting export"
        );

        let cancel = Arc::new(AtomicBool::new(false));
        let job = ExportJob {
            provider: Arc::clone(&self.provider),
            sink,
            episodes,
            apply_edits: request.apply_edits,
            options: MaterializeOptions {
                include_subtasks: request.include_subtasks,
            },
            // Owned copies: later edits to the caller's ledgers cannot leak in.
            edits: request.edits,
            cancel: Arc::clone(&cancel),
            progress,
        };

        let task = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            job.run()
        });

        Ok(ExportHandle { cancel, task })
    }

    /// Start an export and wait for it.
    pub async fn export(
        &self,
        request: ExportRequest,
        progress: Option<ProgressCallback>,
    ) -> KineditResult<ExportResult> {
        self.start(request, progress)?.wait().await
    }

    fn sink_for(&self, request: &ExportRequest) -> KineditResult<Arc<dyn DatasetSink>> {
        if let Some(sink) = self.sinks.get(&request.format) {
            return Ok(Arc::clone(sink));
        }
        let retry = RetryPolicy::from_defaults(&self.defaults);
        match request.format {
            ExportFormat::Bundle => Ok(Arc::new(BundleSink::new(&request.output_path, retry))),
            #[cfg(feature = "hdf5")]
            ExportFormat::Hdf5 => Ok(Arc::new(Hdf5Sink::new(&request.output_path, retry))),
            #[cfg(not(feature = "hdf5"))]
            ExportFormat::Hdf5 => Err(KineditError::unsupported(
                "built without the `hdf5` feature; use the bundle format",
            )),
        }
    }
}

/// A running export.
pub struct ExportHandle {
    cancel: Arc<AtomicBool>,
    task: JoinHandle<ExportResult>,
}

impl ExportHandle {
    /// Ask the export to stop before its next frame.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn wait(self) -> KineditResult<ExportResult> {
        self.task
            .await
            .map_err(|e| KineditError::Other(anyhow::anyhow!("export task failed: {e}")))
    }
}

/// Marks episodes as in flight until dropped.
struct InFlightGuard {
    set: Arc<Mutex<BTreeSet<usize>>>,
    episodes: Vec<usize>,
}

impl InFlightGuard {
    fn acquire(set: &Arc<Mutex<BTreeSet<usize>>>, episodes: &[usize]) -> KineditResult<Self> {
        let mut in_flight = lock(set);
        if let Some(busy) = episodes.iter().find(|i| in_flight.contains(i)) {
            tracing::warn!(episode = busy, "Rejecting overlapping export");
            return Err(KineditError::ExportInProgress {
                episode_index: *busy,
            });
        }
        in_flight.extend(episodes.iter().copied());
        Ok(Self {
            set: Arc::clone(set),
            episodes: episodes.to_vec(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut in_flight = lock(&self.set);
        for episode in &self.episodes {
            in_flight.remove(episode);
        }
    }
}

fn lock(set: &Mutex<BTreeSet<usize>>) -> MutexGuard<'_, BTreeSet<usize>> {
    // The set stays consistent even if a holder panicked.
    set.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct ExportJob {
    provider: Arc<dyn EpisodeProvider>,
    sink: Arc<dyn DatasetSink>,
    episodes: Vec<usize>,
    apply_edits: bool,
    options: MaterializeOptions,
    edits: BTreeMap<usize, EditLedger>,
    cancel: Arc<AtomicBool>,
    progress: Option<ProgressCallback>,
}

impl ExportJob {
    fn run(self) -> ExportResult {
        let started_at = Utc::now();
        let mut committed: Vec<Box<dyn CommittedEpisode>> = Vec::new();
        let mut frames_written = 0;
        let mut ledger_versions = BTreeMap::new();
        let mut failed_episode = None;
        // Last (processed, total) reported for the current episode.
        let mut last_progress = (0, 0);

        let outcome = self.episodes.iter().try_for_each(|&episode_index| {
            failed_episode = Some(episode_index);
            last_progress = (0, 0);
            let episode = self.provider.load(episode_index)?;
            let ledger = match self.edits.get(&episode_index) {
                Some(ledger) if self.apply_edits => ledger.clone(),
                _ => EditLedger::new(episode.frame_count()),
            };
            ledger_versions.insert(episode_index, ledger.version());

            tracing::info!(
                episode = episode_index,
                version = ledger.version(),
                frames = episode.frame_count(),
                "Exporting episode"
            );

            let mut report = |processed, total, stage| {
                last_progress = (processed, total);
                if let Some(cb) = &self.progress {
                    cb(ExportProgress {
                        episode_index,
                        processed,
                        total,
                        stage,
                    });
                }
            };
            let written = materialize_episode(
                &episode,
                &ledger,
                self.options,
                self.sink.as_ref(),
                &self.cancel,
                &mut report,
            )?;

            frames_written += written.frames_written;
            committed.push(written.committed);
            Ok::<_, KineditError>(())
        });

        let finished_at = Utc::now();
        match outcome {
            Ok(()) => {
                let mut output_paths = Vec::with_capacity(committed.len());
                for episode in committed {
                    output_paths.push(episode.output_path().to_path_buf());
                    // The new output is already in place; a leftover backup is only clutter.
                    if let Err(e) = episode.finalize() {
                        tracing::warn!(error = %e, "Failed to remove replaced output");
                    }
                }
                tracing::info!(
                    episodes = output_paths.len(),
                    frames = frames_written,
                    "Export complete"
                );
                ExportResult {
                    success: true,
                    frames_written,
                    output_paths,
                    error: None,
                    error_message: None,
                    ledger_versions,
                    started_at,
                    finished_at,
                }
            }
            Err(e) => {
                if matches!(e, KineditError::Cancelled) {
                    tracing::info!(episode = ?failed_episode, "Export cancelled, rolling back");
                } else {
                    tracing::error!(episode = ?failed_episode, error = %e, "Export failed, rolling back");
                }
                for episode in committed.into_iter().rev() {
                    let path = episode.output_path().to_path_buf();
                    if let Err(rollback_err) = episode.roll_back() {
                        tracing::warn!(
                            path = %path.display(),
                            error = %rollback_err,
                            "Failed to roll back exported episode"
                        );
                    }
                }
                if let (Some(cb), Some(episode_index)) = (&self.progress, failed_episode) {
                    let (processed, total) = last_progress;
                    cb(ExportProgress {
                        episode_index,
                        processed,
                        total,
                        stage: ExportStage::Failed,
                    });
                }
                ExportResult {
                    success: false,
                    frames_written: 0,
                    output_paths: Vec::new(),
                    error: Some(e.kind()),
                    error_message: Some(e.to_string()),
                    ledger_versions,
                    started_at,
                    finished_at,
                }
            }
        }
    }
}
