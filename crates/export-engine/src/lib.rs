//! Kinedit Export Engine
//!
//! Materializes edited episodes into a dataset on disk, running each
//! request on the blocking pool with cooperative cancellation.
//!
//! # Pipeline Architecture
//!
//! ```text
//! EpisodeProvider ──┐
//!                   ├── reconcile (removals, insertions)
//! EditLedger ───────┘         │
//!                             ├── resolve sample (adjustments, interpolation)
//!                             │
//!                             ├── per camera: fetch frame → transform
//!                             ▼
//!                     EpisodeWriter (staging file or dir)
//!                             │ commit: previous output kept as backup
//!                             ▼
//!                     <output>/episode_NNNNNN.hdf5   (or episode_NNNNNN/ bundle)
//!                             │ batch done: finalize, or roll back on failure
//! ```
//!
//! HDF5 output needs the `hdf5` feature (on by default), which links against
//! the system HDF5 library.

pub mod export;
#[cfg(feature = "hdf5")]
pub mod hdf5_sink;
pub mod materialize;
pub mod retry;
pub mod sink;

pub use export::*;
pub use materialize::{materialize_episode, MaterializeOptions, MaterializedEpisode};
pub use retry::RetryPolicy;
#[cfg(feature = "hdf5")]
pub use hdf5_sink::{load_hdf5_episode, Hdf5Sink};
pub use sink::{publish, BundleSink, CommittedEpisode, DatasetSink, EpisodeWriter, FrameRecord, Published};
