//! Error taxonomy shared by the cache core.
//!
//! Request-level failures (`InvalidIdentifier`, `StoreUnavailable`) are
//! surfaced straight to the HTTP boundary; job-level failures
//! (`RetrievalFailed`) are recorded in the job ledger before they propagate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    /// The input did not match any recognized identifier form, or the
    /// extracted token failed grammar validation. Rejected before any ledger
    /// or filesystem access happens.
    #[error("unrecognized video identifier: {0:?}")]
    InvalidIdentifier(String),

    /// The ledger's backing store could not be reached or queried. Retryable;
    /// distinct from a cache miss so clients do not mistake infrastructure
    /// trouble for "still caching".
    #[error("job ledger unavailable: {0}")]
    StoreUnavailable(String),

    /// The external downloading tool failed, or its output was missing or
    /// empty. Recorded in the JobRecord; the identifier stays eligible for a
    /// fresh claim on the next request.
    #[error("retrieval failed for {video_id}: {reason}")]
    RetrievalFailed { video_id: String, reason: String },

    /// The ledger reports a successful job but the artifacts are missing or
    /// zero-byte on disk. Treated as a cache miss.
    #[error("cached artifacts for {0} are missing or empty despite a succeeded job")]
    ArtifactCorrupt(String),
}

impl CacheError {
    pub fn store_unavailable(action: &str, err: impl std::fmt::Display) -> Self {
        Self::StoreUnavailable(format!("{action}: {err}"))
    }
}
