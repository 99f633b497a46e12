//! Error types shared across Kinedit crates.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level error type for Kinedit operations.
#[derive(Debug, thiserror::Error)]
pub enum KineditError {
    #[error("Invalid frame index {index} (frame count {frame_count}): {reason}")]
    InvalidFrameIndex {
        index: usize,
        frame_count: usize,
        reason: String,
    },

    #[error("Interpolation factor {factor} is outside the open interval (0, 1)")]
    InvalidInterpolationFactor { factor: f64 },

    #[error("Corrupt source data: {message}")]
    CorruptSourceData { message: String },

    #[error("An export is already running for episode {episode_index}")]
    ExportInProgress { episode_index: usize },

    #[error("Export write to {path} failed after {attempts} attempt(s): {source}")]
    ExportIoFailure {
        path: PathBuf,
        attempts: u32,
        source: std::io::Error,
    },

    #[error("Episode has no camera '{camera}'")]
    UnknownCamera { camera: String },

    #[error("Export cancelled")]
    Cancelled,

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("File not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Unsupported operation: {message}")]
    Unsupported { message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias using KineditError.
pub type KineditResult<T> = Result<T, KineditError>;

/// Serializable error classification reported in export results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidFrameIndex,
    InvalidEdit,
    CorruptSourceData,
    ExportInProgress,
    ExportIoFailure,
    Cancelled,
    Unsupported,
    Internal,
}

impl KineditError {
    pub fn invalid_frame_index(index: usize, frame_count: usize, reason: impl Into<String>) -> Self {
        Self::InvalidFrameIndex {
            index,
            frame_count,
            reason: reason.into(),
        }
    }

    pub fn corrupt_source(msg: impl Into<String>) -> Self {
        Self::CorruptSourceData {
            message: msg.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported {
            message: msg.into(),
        }
    }

    /// Classification used when the error crosses the export result boundary.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidFrameIndex { .. } => ErrorKind::InvalidFrameIndex,
            Self::InvalidInterpolationFactor { .. } => ErrorKind::InvalidEdit,
            Self::CorruptSourceData { .. } | Self::FileNotFound { .. } | Self::Image(_) => {
                ErrorKind::CorruptSourceData
            }
            Self::ExportInProgress { .. } => ErrorKind::ExportInProgress,
            Self::ExportIoFailure { .. } | Self::Io(_) => ErrorKind::ExportIoFailure,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Unsupported { .. } => ErrorKind::Unsupported,
            Self::UnknownCamera { .. }
            | Self::Config { .. }
            | Self::Json(_)
            | Self::Other(_) => ErrorKind::Internal,
        }
    }

    /// Whether the error is a rejected ledger edit (the ledger is unchanged).
    pub fn is_invalid_edit(&self) -> bool {
        matches!(
            self,
            Self::InvalidFrameIndex { .. } | Self::InvalidInterpolationFactor { .. }
        )
    }
}
