//! Bounded retry for transient filesystem errors.

use std::io;
use std::path::Path;
use std::time::Duration;

use backon::{BlockingRetryable, ExponentialBuilder};
use kinedit_common::config::ExportDefaults;
use kinedit_common::error::{KineditError, KineditResult};

/// How often, and how patiently, a write is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub max_retries: u32,

    /// Delay before the first retry; doubles after each further failure.
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Single attempt, no waiting.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff: Duration::ZERO,
        }
    }

    pub fn from_defaults(defaults: &ExportDefaults) -> Self {
        Self {
            max_retries: defaults.max_io_retries,
            backoff: Duration::from_millis(defaults.retry_backoff_ms),
        }
    }

    /// Exponential schedule: `backoff`, then doubling, at most `max_retries` waits.
    fn schedule(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.backoff)
            .with_factor(2.0)
            .with_max_times(self.max_retries as usize)
    }

    /// Run `op`, retrying transient failures.
    ///
    /// A permanent error fails immediately. Either way the error surfaces as
    /// [`KineditError::ExportIoFailure`] naming `path` and the attempt count.
    pub fn run<T>(&self, path: &Path, mut op: impl FnMut() -> io::Result<T>) -> KineditResult<T> {
        let mut attempts: u32 = 0;
        let result = (|| {
            attempts += 1;
            op()
        })
        .retry(self.schedule())
        .sleep(std::thread::sleep)
        .when(is_transient)
        .notify(|e: &io::Error, delay: Duration| {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                retry_in_ms = delay.as_millis() as u64,
                "Transient write failure, retrying"
            );
        })
        .call();

        result.map_err(|source| KineditError::ExportIoFailure {
            path: path.to_path_buf(),
            attempts,
            source,
        })
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_defaults(&ExportDefaults::default())
    }
}

/// Errors worth another attempt.
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}
