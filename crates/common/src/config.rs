//! Application configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Global application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Dataset read by `kinedit export` when no path is given.
    #[serde(default = "default_datasets_dir")]
    pub datasets_dir: PathBuf,

    /// Export behaviour defaults.
    #[serde(default)]
    pub export: ExportDefaults,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Defaults applied to export requests and edit sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportDefaults {
    /// Extra attempts for a transient write failure before the export fails.
    pub max_io_retries: u32,

    /// Delay before the first retry; doubled on each further attempt.
    pub retry_backoff_ms: u64,

    /// Interpolation factor used when an insertion does not specify one.
    pub default_insert_factor: f64,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "kinedit=debug,warn").
    pub level: String,

    /// Whether to output structured JSON logs.
    pub json: bool,

    /// Optional log file path.
    pub file: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            datasets_dir: default_datasets_dir(),
            export: ExportDefaults::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ExportDefaults {
    fn default() -> Self {
        Self {
            max_io_retries: 3,
            retry_backoff_ms: 50,
            default_insert_factor: 0.5,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: None,
        }
    }
}

impl AppConfig {
    /// Load config from the standard location, falling back to defaults.
    pub fn load() -> Self {
        let config_path = config_file_path();
        if config_path.exists() {
            match std::fs::read_to_string(&config_path) {
                Ok(content) => match serde_json::from_str(&content) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Failed to parse config at {:?}: {}", config_path, e);
                    }
                },
                Err(e) => {
                    tracing::warn!("Failed to read config at {:?}: {}", config_path, e);
                }
            }
        }
        Self::default()
    }
}

/// Standard config file location.
fn config_file_path() -> PathBuf {
    let base = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".config")
        });
    base.join("kinedit").join("config.json")
}

/// Default dataset directory.
fn default_datasets_dir() -> PathBuf {
    let base = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local").join("share")
        });
    base.join("kinedit").join("datasets")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_defaults() {
        let defaults = ExportDefaults::default();
        assert_eq!(defaults.max_io_retries, 3);
        assert!((defaults.default_insert_factor - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let parsed: AppConfig =
            serde_json::from_str(r#"{"datasets_dir":"/data","export":{"max_io_retries":7}}"#)
                .unwrap();
        assert_eq!(parsed.datasets_dir, PathBuf::from("/data"));
        assert_eq!(parsed.export.max_io_retries, 7);
        assert_eq!(parsed.export.retry_backoff_ms, 50);
        assert_eq!(parsed.logging.level, "info");
    }

    #[test]
    fn test_missing_datasets_dir_uses_default() {
        let parsed: AppConfig = serde_json::from_str(r#"{"logging":{"level":"debug"}}"#).unwrap();
        assert!(parsed.datasets_dir.ends_with("kinedit/datasets"));
        assert_eq!(parsed.logging.level, "debug");
    }
}
