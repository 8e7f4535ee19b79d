//! Pipeline stages.
//!
//! Each stage drives one job kind from Pending to a terminal status:
//! ingest downloads tiles, frame generation composes per-date frames,
//! export encodes the final artifact. Stages share the lifecycle
//! helpers here; work failures become a Failed record with an error
//! summary, and only store failures propagate as errors.

pub mod export;
pub mod frames;
pub mod ingest;

pub use export::ExportStage;
pub use frames::FrameStage;
pub use ingest::IngestStage;

use crate::job::{transition, JobId, JobRecord, JobStatus, JobStore, StoreError};
use tracing::{info, warn};

/// Moves a job from Pending to Processing.
///
/// Returns the record if the stage should run, or `None` when the job
/// reached a terminal status before starting (cancelled while queued).
pub(crate) async fn begin<S: JobStore>(
    store: &S,
    id: &JobId,
) -> Result<Option<JobRecord>, StoreError> {
    match store
        .update(id, |record| transition(record, JobStatus::Processing))
        .await
    {
        Ok(record) => {
            info!(job_id = %id, kind = %record.kind, "stage starting");
            Ok(Some(record))
        }
        Err(StoreError::AlreadyTerminal { status, .. }) => {
            info!(job_id = %id, status = %status, "job already terminal, skipping stage");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Finalizes a job in a terminal status.
///
/// A concurrent cancel may have already terminated the record; that
/// race resolves in favor of whichever transition landed first.
pub(crate) async fn finish<S: JobStore>(
    store: &S,
    id: &JobId,
    status: JobStatus,
    error: Option<String>,
    output_ref: Option<String>,
) -> Result<JobStatus, StoreError> {
    let result = store
        .update(id, |record| {
            transition(record, status)?;
            record.error = error;
            if output_ref.is_some() {
                record.output_ref = output_ref;
            }
            Ok(())
        })
        .await;

    match result {
        Ok(record) => {
            info!(job_id = %id, status = %record.status, "stage finished");
            Ok(record.status)
        }
        Err(StoreError::AlreadyTerminal { status: actual, .. }) => {
            warn!(job_id = %id, status = %actual, "job terminated concurrently");
            Ok(actual)
        }
        Err(e) => Err(e),
    }
}
