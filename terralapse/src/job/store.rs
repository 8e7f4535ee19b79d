//! Job persistence.
//!
//! The [`JobStore`] trait is the single mutation path for job records.
//! All writes go through [`JobStore::update`], an atomic read-modify-
//! write closure serialized per store, which is where the lifecycle
//! rules live: terminal records reject status changes, `completed_at`
//! is stamped exactly once, and `updated_at` tracks every mutation.
//!
//! Two implementations: an in-memory map for tests and one-shot CLI
//! runs, and a file-backed store that persists one JSON document per
//! job so records survive restarts.

use super::record::{JobId, JobRecord, JobStatus};
use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Errors from job store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No record with the given ID
    #[error("job not found: {0}")]
    NotFound(JobId),

    /// A record with the given ID already exists
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),

    /// Attempted status change on a terminal record
    #[error("job {id} is already terminal ({status})")]
    AlreadyTerminal { id: JobId, status: JobStatus },

    /// Disallowed lifecycle transition
    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    /// Underlying filesystem failure
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Record could not be encoded or decoded
    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Filter for listing jobs. Empty filter matches everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobFilter {
    pub kind: Option<super::record::JobKind>,
    pub status: Option<JobStatus>,
}

impl JobFilter {
    fn matches(&self, record: &JobRecord) -> bool {
        self.kind.map_or(true, |k| k == record.kind)
            && self.status.map_or(true, |s| s == record.status)
    }
}

/// Applies a status change to a record, enforcing the lifecycle rules.
///
/// Allowed transitions: Pending -> Processing, Pending -> Cancelled,
/// Processing -> Completed | Failed | Cancelled. Entering a terminal
/// status stamps `completed_at` and snaps progress to 100. Setting the
/// current status again is a no-op.
pub fn transition(record: &mut JobRecord, to: JobStatus) -> Result<(), StoreError> {
    let from = record.status;
    if from == to {
        return Ok(());
    }
    if from.is_terminal() {
        return Err(StoreError::AlreadyTerminal {
            id: record.id.clone(),
            status: from,
        });
    }

    let allowed = matches!(
        (from, to),
        (JobStatus::Pending, JobStatus::Processing)
            | (JobStatus::Pending, JobStatus::Cancelled)
            | (JobStatus::Processing, JobStatus::Completed)
            | (JobStatus::Processing, JobStatus::Failed)
            | (JobStatus::Processing, JobStatus::Cancelled)
    );
    if !allowed {
        return Err(StoreError::InvalidTransition { from, to });
    }

    record.status = to;
    if to.is_terminal() {
        record.completed_at = Some(Utc::now());
        record.progress = 100;
    }
    Ok(())
}

/// Async persistence for job records.
///
/// `update` is the only way to mutate a stored record; implementations
/// serialize updates so concurrent unit completions from download
/// workers never clobber each other.
pub trait JobStore: Send + Sync + 'static {
    /// Inserts a new record.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` if the ID is taken.
    fn create(&self, record: JobRecord) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Fetches a record by ID.
    fn get(&self, id: &JobId) -> impl Future<Output = Result<Option<JobRecord>, StoreError>> + Send;

    /// Atomically mutates a record and returns the updated copy.
    ///
    /// The closure runs under the store's write lock; `updated_at` is
    /// refreshed after it returns. An error from the closure aborts the
    /// update without persisting anything.
    fn update<F>(
        &self,
        id: &JobId,
        f: F,
    ) -> impl Future<Output = Result<JobRecord, StoreError>> + Send
    where
        F: FnOnce(&mut JobRecord) -> Result<(), StoreError> + Send;

    /// Lists records matching the filter, newest first.
    fn list(&self, filter: &JobFilter)
        -> impl Future<Output = Result<Vec<JobRecord>, StoreError>> + Send;

    /// Removes a record. Returns whether it existed.
    fn delete(&self, id: &JobId) -> impl Future<Output = Result<bool, StoreError>> + Send;
}

/// Deletes terminal records whose `completed_at` is older than the
/// retention window. Returns the IDs removed.
pub async fn sweep_terminal<S: JobStore>(
    store: &S,
    retention: std::time::Duration,
) -> Result<Vec<JobId>, StoreError> {
    let cutoff =
        Utc::now() - ChronoDuration::from_std(retention).unwrap_or(ChronoDuration::MAX);
    let mut removed = Vec::new();

    for record in store.list(&JobFilter::default()).await? {
        if !record.status.is_terminal() {
            continue;
        }
        let Some(completed_at) = record.completed_at else {
            warn!(job_id = %record.id, "terminal record missing completed_at, skipping sweep");
            continue;
        };
        if completed_at < cutoff && store.delete(&record.id).await? {
            debug!(job_id = %record.id, status = %record.status, "swept expired job");
            removed.push(record.id);
        }
    }
    Ok(removed)
}

/// In-memory job store backed by a mutex-guarded map.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<JobId, JobRecord>>,
}

impl MemoryJobStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for MemoryJobStore {
    async fn create(&self, record: JobRecord) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(&record.id) {
            return Err(StoreError::AlreadyExists(record.id));
        }
        jobs.insert(record.id.clone(), record);
        Ok(())
    }

    async fn get(&self, id: &JobId) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.jobs.lock().await.get(id).cloned())
    }

    async fn update<F>(&self, id: &JobId, f: F) -> Result<JobRecord, StoreError>
    where
        F: FnOnce(&mut JobRecord) -> Result<(), StoreError> + Send,
    {
        let mut jobs = self.jobs.lock().await;
        let record = jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;

        // Mutate a copy so a failing closure leaves the record untouched
        let mut updated = record.clone();
        f(&mut updated)?;
        updated.updated_at = Utc::now();
        *record = updated.clone();
        Ok(updated)
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, StoreError> {
        let jobs = self.jobs.lock().await;
        let mut records: Vec<JobRecord> =
            jobs.values().filter(|r| filter.matches(r)).cloned().collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    async fn delete(&self, id: &JobId) -> Result<bool, StoreError> {
        Ok(self.jobs.lock().await.remove(id).is_some())
    }
}

/// File-backed job store: one JSON document per job under a root
/// directory. Writes go through a temp file and rename so a crashed
/// write never leaves a truncated record behind.
#[derive(Debug)]
pub struct FileJobStore {
    root: PathBuf,
    // Serializes read-modify-write cycles across tasks
    write_lock: Mutex<()>,
}

impl FileJobStore {
    /// Creates a store rooted at `root`, creating the directory if needed.
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    fn record_path(&self, id: &JobId) -> PathBuf {
        self.root.join(format!("{}.json", id))
    }

    async fn read_record(path: &Path) -> Result<Option<JobRecord>, StoreError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_record(&self, record: &JobRecord) -> Result<(), StoreError> {
        let path = self.record_path(&record.id);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(record)?;
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

impl JobStore for FileJobStore {
    async fn create(&self, record: JobRecord) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let path = self.record_path(&record.id);
        if tokio::fs::try_exists(&path).await? {
            return Err(StoreError::AlreadyExists(record.id));
        }
        self.write_record(&record).await
    }

    async fn get(&self, id: &JobId) -> Result<Option<JobRecord>, StoreError> {
        Self::read_record(&self.record_path(id)).await
    }

    async fn update<F>(&self, id: &JobId, f: F) -> Result<JobRecord, StoreError>
    where
        F: FnOnce(&mut JobRecord) -> Result<(), StoreError> + Send,
    {
        let _guard = self.write_lock.lock().await;
        let path = self.record_path(id);
        let mut record = Self::read_record(&path)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;

        f(&mut record)?;
        record.updated_at = Utc::now();
        self.write_record(&record).await?;
        Ok(record)
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, StoreError> {
        let mut records = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            match Self::read_record(&path).await {
                Ok(Some(record)) if filter.matches(&record) => records.push(record),
                Ok(_) => {}
                Err(e) => {
                    // A corrupt record should not hide the rest
                    warn!(path = %path.display(), error = %e, "skipping unreadable job record");
                }
            }
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    async fn delete(&self, id: &JobId) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(self.record_path(id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
