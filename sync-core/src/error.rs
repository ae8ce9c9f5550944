//! Error taxonomy: one enum per component, grouped by how the Sync
//! Engine is expected to react to each variant.

use std::collections::BTreeSet;

use thiserror::Error;

/// Errors raised by the Source Adapter.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Every host in the failover attempt returned rate-limit (HTTP 429 or
    /// `errors[].code == 88`). Carries the set of exhausted hosts.
    #[error("rate-limited on all hosts: {hosts:?}")]
    RateLimited { hosts: BTreeSet<String> },

    /// Auth rotation exhausted across every bearer/auth-pair combination.
    #[error("authentication failed and rotation is exhausted: {0}")]
    AuthInvalid(String),

    /// Paging, parsing, or transport failure not classified above.
    #[error("source request failed: {0}")]
    Generic(String),
}

/// Errors raised by the State Store. Lock-contention is not represented
/// here: `acquire_lock` returns a bool, never an error.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("state store I/O error: {0}")]
    Io(#[from] sqlx::Error),

    #[error("state store directory setup failed: {0}")]
    Directory(#[from] std::io::Error),

    #[error("state store migration error: {0}")]
    Migration(String),
}

/// Errors raised by the Media Downloader.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("download request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("download response had no usable body")]
    EmptyBody,

    #[error("download I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the Sink Adapter.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink request failed: {0}")]
    Request(String),

    #[error("sink rejected the upload: {0}")]
    Rejected(String),
}

/// Top-level error surfaced from a Sync Engine run: a schema or
/// environment failure. Everything below the per-account boundary is
/// caught and folded into the run summary instead of propagating here.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error("scratch directory setup failed: {0}")]
    Scratch(#[from] std::io::Error),
}
