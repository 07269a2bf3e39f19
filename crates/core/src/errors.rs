//! Error types for the scuttle core library.
//!
//! Each subsystem has its own error type derived with `thiserror`. Only
//! [`ProcessError`] and a failed readiness task are fatal to a run, and those
//! are unified by [`CoreError`]; probe and notification errors are logged and
//! swallowed by their callers.

use std::time::Duration;

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Error type for the fallible steps of a supervised run.
///
/// Configuration and notification errors never surface here: the former fall
/// back to defaults, the latter are logged per endpoint.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Readiness(#[from] ReadinessError),

    #[error(transparent)]
    Process(#[from] ProcessError),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from parsing individual configuration values.
///
/// The environment loader never fails a run on these: it logs them and falls
/// back to the default for the affected variable.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A boolean variable held something other than a recognised flag value.
    #[error("invalid boolean for '{var}': '{value}'")]
    InvalidBool { var: String, value: String },

    /// A duration variable could not be parsed.
    #[error("invalid duration for '{var}': '{value}' ({detail})")]
    InvalidDuration {
        var: String,
        value: String,
        detail: String,
    },
}

// ---------------------------------------------------------------------------
// Readiness errors
// ---------------------------------------------------------------------------

/// Errors from probing the proxy's `server_info` endpoint.
#[derive(Debug, Error)]
pub enum ReadinessError {
    /// Transport, status or decoding failure on a single probe.
    #[error("readiness probe failed: {0}")]
    Probe(#[from] reqwest::Error),

    /// The polling task panicked or was aborted.
    #[error("readiness task failed: {0}")]
    TaskFailed(String),
}

// ---------------------------------------------------------------------------
// Notification errors
// ---------------------------------------------------------------------------

/// Errors from sending a shutdown request to a sidecar.
#[derive(Debug, Error)]
pub enum NotificationError {
    /// HTTP error while delivering the request.
    #[error("quit request HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// The shared request deadline elapsed before a response arrived.
    #[error("quit request timed out after {timeout:?}")]
    TimedOut { timeout: Duration },

    /// The request task panicked or was aborted.
    #[error("quit request task failed: {0}")]
    TaskFailed(String),
}

// ---------------------------------------------------------------------------
// Process errors
// ---------------------------------------------------------------------------

/// Fatal errors around the supervised child process.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The executable could not be found on `$PATH` or at the given path.
    #[error("executable not found: {0}")]
    ExecutableNotFound(String),

    /// The executable was found but could not be started.
    #[error("failed to start '{path}': {source}")]
    SpawnFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Waiting on the running child failed.
    #[error("failed to wait on child process: {0}")]
    WaitFailed(#[source] std::io::Error),
}
