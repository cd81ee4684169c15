//! Job ledger: one record per identifier tracking the caching attempt.
//!
//! The ledger is the only piece of shared mutable state in the system, and
//! `claim_or_join` is the one operation that needs true cross-request
//! synchronization. The SQLite implementation runs it inside an IMMEDIATE
//! transaction, so concurrent callers serialize on the write lock and exactly
//! one of them observes "no active job" and wins the claim.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use serde::Serialize;

use crate::error::CacheError;
use crate::identity::VideoId;

/// How long a queued/running record stays authoritative before it is treated
/// as abandoned and becomes re-claimable. Operator tunable; see config.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(600);

/// Lifecycle of one caching attempt. Transitions are monotonic:
/// queued → running → succeeded | failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Active records block new claims (unless stale).
    pub fn is_active(self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }
}

/// One row of the ledger.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub video_id: String,
    pub job_ref: String,
    pub status: JobStatus,
    /// Unix seconds of the last status change.
    pub updated_at: i64,
}

/// Keyed record store with atomic claim-or-join semantics.
///
/// Injected as a trait so the backing store can be swapped without touching
/// the orchestrator. Implementations must make `claim_or_join` atomic with
/// respect to concurrent callers; everything else is single-writer per job.
pub trait JobLedger: Send + Sync {
    /// Claims a fresh caching attempt for `id`, or joins the active one.
    ///
    /// When no active record exists (absent, terminal, or stale), a new
    /// record with status `queued` and `candidate_ref` is written and
    /// `(record, true)` is returned. Otherwise the existing record comes back
    /// with `false` and `candidate_ref` is discarded.
    fn claim_or_join(
        &self,
        id: &VideoId,
        candidate_ref: &str,
    ) -> Result<(JobRecord, bool), CacheError>;

    /// Current record for `id`, if any caching attempt was ever made.
    fn get_status(&self, id: &VideoId) -> Result<Option<JobRecord>, CacheError>;

    /// queued → running. Invoked by the retrieval task it refers to.
    fn mark_running(&self, job_ref: &str) -> Result<(), CacheError>;

    /// queued/running → succeeded.
    fn mark_succeeded(&self, job_ref: &str) -> Result<(), CacheError>;

    /// queued/running → failed.
    fn mark_failed(&self, job_ref: &str) -> Result<(), CacheError>;
}

/// SQLite-backed ledger.
///
/// Follows the per-operation-connection pattern: each call opens a dedicated
/// connection with a busy timeout, so long operations never pin a shared
/// handle across threads. WAL mode keeps readers from blocking the writer.
#[derive(Debug, Clone)]
pub struct SqliteLedger {
    db_path: PathBuf,
    stale_after: Duration,
}

impl SqliteLedger {
    /// Opens (and if necessary creates) the ledger DB and its schema.
    pub fn open(path: impl AsRef<Path>, stale_after: Duration) -> Result<Self, CacheError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| CacheError::store_unavailable("creating ledger directory", err))?;
        }

        let conn = Connection::open(path)
            .map_err(|err| CacheError::store_unavailable("opening job ledger", err))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|err| CacheError::store_unavailable("enabling WAL mode", err))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|err| CacheError::store_unavailable("setting synchronous mode", err))?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                video_id TEXT PRIMARY KEY,
                job_ref TEXT NOT NULL,
                status TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_ref ON jobs(job_ref);
            "#,
        )
        .map_err(|err| CacheError::store_unavailable("creating ledger schema", err))?;

        Ok(Self {
            db_path: path.to_path_buf(),
            stale_after,
        })
    }

    fn with_connection<F, T>(&self, action: &str, f: F) -> Result<T, CacheError>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T>,
    {
        let mut conn = Connection::open(&self.db_path)
            .map_err(|err| CacheError::store_unavailable("opening job ledger", err))?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(|err| CacheError::store_unavailable("configuring job ledger", err))?;
        f(&mut conn).map_err(|err| CacheError::store_unavailable(action, err))
    }

    /// Shared guard-clause update for status transitions. The WHERE clause
    /// enforces monotonicity; a refused transition is logged, not an error.
    fn transition(&self, job_ref: &str, next: JobStatus) -> Result<(), CacheError> {
        let sql = match next {
            JobStatus::Running => {
                "UPDATE jobs SET status = ?1, updated_at = ?2 \
                 WHERE job_ref = ?3 AND status = 'queued'"
            }
            JobStatus::Succeeded | JobStatus::Failed => {
                "UPDATE jobs SET status = ?1, updated_at = ?2 \
                 WHERE job_ref = ?3 AND status IN ('queued', 'running')"
            }
            JobStatus::Queued => {
                unreachable!("queued is only ever written by claim_or_join")
            }
        };

        let now = Utc::now().timestamp();
        let changed = self.with_connection("updating job status", |conn| {
            conn.execute(sql, params![next.as_str(), now, job_ref])
        })?;

        if changed == 0 {
            tracing::warn!(
                job_ref,
                next = next.as_str(),
                "ignoring status transition with no matching active record"
            );
        }

        Ok(())
    }
}

impl JobLedger for SqliteLedger {
    fn claim_or_join(
        &self,
        id: &VideoId,
        candidate_ref: &str,
    ) -> Result<(JobRecord, bool), CacheError> {
        let stale_secs = self.stale_after.as_secs() as i64;

        self.with_connection("claiming job", |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now = Utc::now().timestamp();

            let existing = tx
                .query_row(
                    "SELECT video_id, job_ref, status, updated_at FROM jobs WHERE video_id = ?1",
                    [id.as_str()],
                    row_to_record,
                )
                .optional()?;

            if let Some(record) = existing
                && record.status.is_active()
                && now - record.updated_at <= stale_secs
            {
                return Ok((record, false));
            }

            tx.execute(
                r#"
                INSERT INTO jobs (video_id, job_ref, status, updated_at)
                VALUES (?1, ?2, 'queued', ?3)
                ON CONFLICT(video_id) DO UPDATE SET
                    job_ref = excluded.job_ref,
                    status = excluded.status,
                    updated_at = excluded.updated_at
                "#,
                params![id.as_str(), candidate_ref, now],
            )?;
            tx.commit()?;

            Ok((
                JobRecord {
                    video_id: id.as_str().to_owned(),
                    job_ref: candidate_ref.to_owned(),
                    status: JobStatus::Queued,
                    updated_at: now,
                },
                true,
            ))
        })
    }

    fn get_status(&self, id: &VideoId) -> Result<Option<JobRecord>, CacheError> {
        self.with_connection("reading job status", |conn| {
            conn.query_row(
                "SELECT video_id, job_ref, status, updated_at FROM jobs WHERE video_id = ?1",
                [id.as_str()],
                row_to_record,
            )
            .optional()
        })
    }

    fn mark_running(&self, job_ref: &str) -> Result<(), CacheError> {
        self.transition(job_ref, JobStatus::Running)
    }

    fn mark_succeeded(&self, job_ref: &str) -> Result<(), CacheError> {
        self.transition(job_ref, JobStatus::Succeeded)
    }

    fn mark_failed(&self, job_ref: &str) -> Result<(), CacheError> {
        self.transition(job_ref, JobStatus::Failed)
    }
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<JobRecord> {
    let status_text: String = row.get("status")?;
    let status = JobStatus::parse(&status_text).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown job status {status_text:?}").into(),
        )
    })?;

    Ok(JobRecord {
        video_id: row.get("video_id")?,
        job_ref: row.get("job_ref")?,
        status,
        updated_at: row.get("updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn open_ledger(dir: &Path) -> SqliteLedger {
        SqliteLedger::open(dir.join("jobs.db"), DEFAULT_STALE_AFTER).unwrap()
    }

    fn id(raw: &str) -> VideoId {
        identity::resolve(raw).unwrap()
    }

    #[test]
    fn first_claim_wins_second_caller_joins() {
        let temp = tempdir().unwrap();
        let ledger = open_ledger(temp.path());
        let vid = id("abc12345678");

        let (first, is_new) = ledger.claim_or_join(&vid, "job-one").unwrap();
        assert!(is_new);
        assert_eq!(first.status, JobStatus::Queued);
        assert_eq!(first.job_ref, "job-one");

        let (second, is_new) = ledger.claim_or_join(&vid, "job-two").unwrap();
        assert!(!is_new);
        assert_eq!(second.job_ref, "job-one");
    }

    #[test]
    fn transitions_are_monotonic() {
        let temp = tempdir().unwrap();
        let ledger = open_ledger(temp.path());
        let vid = id("abc12345678");
        ledger.claim_or_join(&vid, "job-one").unwrap();

        ledger.mark_running("job-one").unwrap();
        assert_eq!(
            ledger.get_status(&vid).unwrap().unwrap().status,
            JobStatus::Running
        );

        ledger.mark_succeeded("job-one").unwrap();
        assert_eq!(
            ledger.get_status(&vid).unwrap().unwrap().status,
            JobStatus::Succeeded
        );

        // Terminal states are sticky.
        ledger.mark_failed("job-one").unwrap();
        assert_eq!(
            ledger.get_status(&vid).unwrap().unwrap().status,
            JobStatus::Succeeded
        );
        ledger.mark_running("job-one").unwrap();
        assert_eq!(
            ledger.get_status(&vid).unwrap().unwrap().status,
            JobStatus::Succeeded
        );
    }

    #[test]
    fn failed_jobs_are_reclaimable() {
        let temp = tempdir().unwrap();
        let ledger = open_ledger(temp.path());
        let vid = id("abc12345678");

        ledger.claim_or_join(&vid, "job-one").unwrap();
        ledger.mark_running("job-one").unwrap();
        ledger.mark_failed("job-one").unwrap();

        let (record, is_new) = ledger.claim_or_join(&vid, "job-two").unwrap();
        assert!(is_new);
        assert_eq!(record.job_ref, "job-two");
        assert_eq!(record.status, JobStatus::Queued);
    }

    #[test]
    fn stale_active_jobs_are_reclaimable() {
        let temp = tempdir().unwrap();
        let ledger = SqliteLedger::open(temp.path().join("jobs.db"), Duration::ZERO).unwrap();
        let vid = id("abc12345678");

        ledger.claim_or_join(&vid, "job-one").unwrap();
        ledger.mark_running("job-one").unwrap();

        // With a zero staleness window even a just-written record counts as
        // abandoned once the clock ticks past it.
        std::thread::sleep(Duration::from_millis(1100));
        let (record, is_new) = ledger.claim_or_join(&vid, "job-two").unwrap();
        assert!(is_new);
        assert_eq!(record.job_ref, "job-two");
    }

    #[test]
    fn distinct_identifiers_claim_independently() {
        let temp = tempdir().unwrap();
        let ledger = open_ledger(temp.path());

        let (_, first_new) = ledger.claim_or_join(&id("abc12345678"), "job-one").unwrap();
        let (_, second_new) = ledger.claim_or_join(&id("xyz98765432"), "job-two").unwrap();
        assert!(first_new);
        assert!(second_new);
    }

    #[test]
    fn concurrent_claims_produce_exactly_one_winner() {
        let temp = tempdir().unwrap();
        let ledger = Arc::new(open_ledger(temp.path()));
        let vid = id("abc12345678");
        let wins = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|n| {
                let ledger = ledger.clone();
                let vid = vid.clone();
                let wins = wins.clone();
                std::thread::spawn(move || {
                    let candidate = format!("job-{n}");
                    let (record, is_new) = ledger.claim_or_join(&vid, &candidate).unwrap();
                    if is_new {
                        wins.fetch_add(1, Ordering::SeqCst);
                    }
                    record.job_ref
                })
            })
            .collect();

        let refs: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(wins.load(Ordering::SeqCst), 1);
        // Every caller observed the winning reference.
        assert!(refs.windows(2).all(|pair| pair[0] == pair[1]));
        let stored = ledger.get_status(&vid).unwrap().unwrap();
        assert_eq!(stored.job_ref, refs[0]);
    }

    #[test]
    fn get_status_reports_absence() {
        let temp = tempdir().unwrap();
        let ledger = open_ledger(temp.path());
        assert!(ledger.get_status(&id("abc12345678")).unwrap().is_none());
    }
}
