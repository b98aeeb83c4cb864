// Error types shared across the pipeline, codec, and filter layers.

use std::path::PathBuf;
use std::process::ExitStatus;
use thiserror::Error;

use crate::pipeline::Stage;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving the aligner or handling its output.
///
/// Stage-level failures abort only the invocation that produced them; the
/// host process keeps running and temp artifacts are cleaned up by the
/// pipeline before the error is returned.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad input path or argument. Reported immediately, never retried.
    #[error("invalid input: {0}")]
    Validation(String),

    /// Filesystem failure, surfaced with the offending path.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Malformed tabular or binary input, with the offending line/record.
    #[error("format error: {0}")]
    Format(String),

    /// External process exited non-zero.
    #[error("{stage} failed ({status}): {stderr}")]
    Process {
        stage: Stage,
        status: ExitStatus,
        stderr: String,
    },

    /// A stage exceeded its wall-clock deadline; the child was killed.
    #[error("{stage} timed out after {seconds}s")]
    Timeout { stage: Stage, seconds: u64 },

    /// The caller dropped the stream or requested cancellation.
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}
