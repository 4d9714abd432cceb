//! Error types for the download engine.
//!
//! Errors are grouped by the stage they can occur in (scheduling, transfer,
//! remux, finalization, persistence) so the facade can translate them into
//! user-facing notifications without string matching.
//!
//! Per-download failures never unwind the scheduler: the owning task settles
//! its download in `Error` status and emits a failure event, and siblings
//! keep running.

use thiserror::Error;

/// Result type alias using our EngineError type
pub type Result<T> = std::result::Result<T, EngineError>;

/// Main error type for the download engine
#[derive(Error, Debug)]
pub enum EngineError {
    // ===== Scheduling =====

    /// Not enough free space on the downloads volume to start a transfer.
    /// Not retried automatically.
    #[error("insufficient storage: need {need} bytes free, have {have}")]
    InsufficientStorage { need: u64, have: u64 },

    /// The source failed to produce a usable media track for a chapter.
    #[error("failed to resolve media track: {0}")]
    StreamResolutionFailed(String),

    // ===== Transfer =====

    /// Network-level failure during a transfer.
    #[error("network error: {message}")]
    NetworkError {
        message: String,
        /// Whether the direct-strategy retry loop may try again.
        is_transient: bool,
    },

    /// Direct transfer gave up after exhausting its retry budget.
    #[error("transfer failed after {attempts} attempts: {message}")]
    TransferFailed { attempts: u32, message: String },

    // ===== Remux =====

    /// The remux tool exited abnormally or produced corrupt output.
    #[error("remux failed: {0}")]
    RemuxFailed(String),

    /// ffmpeg/ffprobe binary not found in PATH.
    #[error("ffmpeg not found; install ffmpeg and ensure it is in your PATH")]
    FfmpegNotFound,

    // ===== Finalization =====

    /// A completed transfer could not be verified or renamed into place.
    #[error("finalize failed: {0}")]
    FinalizeFailed(String),

    // ===== Persistence =====

    /// A persisted queue or deletion record could not be decoded. Dropped
    /// during restore, never fatal to the application.
    #[error("corrupt persistence record: {0}")]
    PersistenceCorrupt(String),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // ===== I/O =====

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Whether the direct-transfer retry loop may try this error again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::NetworkError {
                is_transient: true,
                ..
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        let transient = EngineError::NetworkError {
            message: "connection reset".to_string(),
            is_transient: true,
        };
        assert!(transient.is_transient());

        let permanent = EngineError::NetworkError {
            message: "HTTP 404".to_string(),
            is_transient: false,
        };
        assert!(!permanent.is_transient());

        assert!(!EngineError::FfmpegNotFound.is_transient());
        assert!(!EngineError::InsufficientStorage { need: 1, have: 0 }.is_transient());
    }
}
