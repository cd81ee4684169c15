//! The cache-readiness state machine.
//!
//! Ties the media store, the job ledger, and the job queue together: decide
//! whether cached content exists, and if not, make sure exactly one retrieval
//! task is in flight for the identifier no matter how many requests race.

use std::sync::Arc;

use serde::Serialize;

use crate::error::CacheError;
use crate::identity::VideoId;
use crate::ledger::{JobLedger, JobStatus};
use crate::queue::{self, JobQueue, TaskSpec};
use crate::store::MediaStore;

/// Observable per-identifier state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheState {
    /// No cached artifacts and no caching attempt on record.
    Unknown,
    /// Video and audio artifacts exist; media URLs are servable.
    Ready,
    /// This call claimed the identifier and enqueued a retrieval task.
    Claiming,
    /// Another caller holds the active claim; no new work was enqueued.
    Pending,
    /// The last caching attempt failed; the next ensure call re-claims.
    Failed,
}

/// Outcome of an orchestrator call, consumed by the API surface.
#[derive(Debug, Clone, Serialize)]
pub struct Readiness {
    pub video_id: String,
    pub ready: bool,
    pub state: CacheState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_status: Option<JobStatus>,
}

impl Readiness {
    pub fn ready(id: &VideoId) -> Self {
        Self {
            video_id: id.as_str().to_owned(),
            ready: true,
            state: CacheState::Ready,
            job_ref: None,
            job_status: None,
        }
    }

    fn not_ready(id: &VideoId, state: CacheState, job_ref: Option<String>, status: Option<JobStatus>) -> Self {
        Self {
            video_id: id.as_str().to_owned(),
            ready: false,
            state,
            job_ref,
            job_status: status,
        }
    }
}

pub struct Orchestrator {
    store: MediaStore,
    ledger: Arc<dyn JobLedger>,
    queue: Arc<dyn JobQueue>,
}

impl Orchestrator {
    pub fn new(store: MediaStore, ledger: Arc<dyn JobLedger>, queue: Arc<dyn JobQueue>) -> Self {
        Self {
            store,
            ledger,
            queue,
        }
    }

    pub fn store(&self) -> &MediaStore {
        &self.store
    }

    /// Returns current readiness and, when not ready, makes sure a retrieval
    /// task is (or becomes) active for `id`.
    ///
    /// The ready fast path is a pure filesystem check; once an identifier is
    /// cached, polling never touches the ledger again.
    pub fn ensure_cached(&self, id: &VideoId) -> Result<Readiness, CacheError> {
        if self.store.is_ready(id) {
            return Ok(Readiness::ready(id));
        }

        let candidate = queue::mint_job_ref(id);
        let (record, is_new_claim) = self.ledger.claim_or_join(id, &candidate)?;

        if !is_new_claim {
            return Ok(Readiness::not_ready(
                id,
                CacheState::Pending,
                Some(record.job_ref),
                Some(record.status),
            ));
        }

        let task = TaskSpec {
            video_id: id.clone(),
            job_ref: record.job_ref.clone(),
        };
        if let Err(err) = self.queue.enqueue(task) {
            // Release the claim so the next request can retry instead of
            // waiting out the staleness window.
            if let Err(mark_err) = self.ledger.mark_failed(&record.job_ref) {
                tracing::error!(
                    job_ref = %record.job_ref,
                    error = %mark_err,
                    "could not release claim after enqueue failure"
                );
            }
            return Err(err);
        }

        Ok(Readiness::not_ready(
            id,
            CacheState::Claiming,
            Some(record.job_ref),
            Some(JobStatus::Queued),
        ))
    }

    /// Read-only status query; never enqueues work.
    ///
    /// Lets a polling client distinguish "still working" from "permanently
    /// failed" from "never requested".
    pub fn check_status(&self, id: &VideoId) -> Result<Readiness, CacheError> {
        if self.store.is_ready(id) {
            return Ok(Readiness::ready(id));
        }

        match self.ledger.get_status(id)? {
            None => Ok(Readiness::not_ready(id, CacheState::Unknown, None, None)),
            Some(record) => match record.status {
                JobStatus::Queued | JobStatus::Running => Ok(Readiness::not_ready(
                    id,
                    CacheState::Pending,
                    Some(record.job_ref),
                    Some(record.status),
                )),
                JobStatus::Failed => Ok(Readiness::not_ready(
                    id,
                    CacheState::Failed,
                    Some(record.job_ref),
                    Some(record.status),
                )),
                JobStatus::Succeeded => {
                    // The ledger says done but the files are not servable:
                    // report a cache miss so the next ensure call re-claims.
                    tracing::warn!(
                        video_id = %id,
                        error = %CacheError::ArtifactCorrupt(id.as_str().to_owned()),
                        "treating succeeded job with unreadable artifacts as a cache miss"
                    );
                    Ok(Readiness::not_ready(id, CacheState::Unknown, None, None))
                }
            },
        }
    }
}
