//! Job-enqueue collaborator: hands claimed retrieval work to a runner.
//!
//! The runner only promises to attempt each enqueued task; effectively-once
//! execution per identifier comes from the ledger claim, never from here.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::CacheError;
use crate::identity::VideoId;
use crate::ledger::JobLedger;
use crate::retrieval;
use crate::store::MediaStore;

/// Descriptor of one claimed retrieval task.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub video_id: VideoId,
    pub job_ref: String,
}

/// Enqueue primitive. Returns the job reference the task will execute under.
pub trait JobQueue: Send + Sync {
    fn enqueue(&self, task: TaskSpec) -> Result<String, CacheError>;
}

/// Mints an opaque job reference for a pending claim.
///
/// References only need to be unique per ledger; hashing the identifier with
/// the wall clock and a process-local counter keeps them short and
/// collision-free without carrying a dedicated id crate.
pub fn mint_job_ref(id: &VideoId) -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let nonce = COUNTER.fetch_add(1, Ordering::Relaxed);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();

    let mut hasher = blake3::Hasher::new();
    hasher.update(id.as_str().as_bytes());
    hasher.update(&now.as_nanos().to_le_bytes());
    hasher.update(&nonce.to_le_bytes());
    let hex = hasher.finalize().to_hex();

    format!("job-{}", &hex[..16])
}

/// In-process runner backed by the tokio worker pool.
///
/// Each task runs as `tokio::spawn` → `spawn_blocking` around the subprocess
/// work, keeping downloads entirely off the request path. The runtime handle
/// is captured at construction so enqueueing works from blocking contexts
/// too.
pub struct TokioJobQueue {
    handle: tokio::runtime::Handle,
    store: MediaStore,
    ledger: Arc<dyn JobLedger>,
}

impl TokioJobQueue {
    /// Must be called from within a tokio runtime.
    pub fn new(store: MediaStore, ledger: Arc<dyn JobLedger>) -> Self {
        Self {
            handle: tokio::runtime::Handle::current(),
            store,
            ledger,
        }
    }
}

impl JobQueue for TokioJobQueue {
    fn enqueue(&self, task: TaskSpec) -> Result<String, CacheError> {
        let job_ref = task.job_ref.clone();
        let store = self.store.clone();
        let ledger = self.ledger.clone();

        self.handle.spawn(async move {
            let TaskSpec { video_id, job_ref } = task;
            let ledger_for_panic = ledger.clone();
            let panic_ref = job_ref.clone();
            let video_label = video_id.clone();

            let outcome = tokio::task::spawn_blocking(move || {
                retrieval::run(&store, ledger.as_ref(), &video_id, &job_ref)
            })
            .await;

            match outcome {
                Ok(Ok(())) => {
                    tracing::info!(video_id = %video_label, "retrieval task finished");
                }
                Ok(Err(err)) => {
                    // Already recorded in the ledger by the task itself.
                    tracing::warn!(video_id = %video_label, error = %err, "retrieval task failed");
                }
                Err(err) => {
                    tracing::error!(video_id = %video_label, error = %err, "retrieval task panicked");
                    if let Err(mark_err) = ledger_for_panic.mark_failed(&panic_ref) {
                        tracing::error!(
                            job_ref = %panic_ref,
                            error = %mark_err,
                            "could not record panicked retrieval task as failed"
                        );
                    }
                }
            }
        });

        Ok(job_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity;

    #[test]
    fn job_refs_are_unique_and_opaque() {
        let id = identity::resolve("abc12345678").unwrap();
        let first = mint_job_ref(&id);
        let second = mint_job_ref(&id);

        assert!(first.starts_with("job-"));
        assert_eq!(first.len(), "job-".len() + 16);
        assert_ne!(first, second);
        assert!(!first.contains("abc12345678"));
    }
}
