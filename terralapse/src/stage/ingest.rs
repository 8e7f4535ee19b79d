//! Ingest stage: tile download for a date range and extent.

use super::{begin, finish};
use crate::fetch::RetryingFetcher;
use crate::job::{JobId, JobParams, JobStatus, JobStore, StoreError, UnitKey, UnitStatus};
use crate::limiter::ConcurrencyLimiter;
use crate::pipeline::{BatchError, PipelineConfig, TileBatchDownloader};
use crate::provider::TileProvider;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

/// Errors that abort an ingest run (work failures do not).
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Batch(#[from] BatchError),
}

/// Downloads every tile unit of an ingest job and settles the record.
///
/// Success policy: every date in the range must have at least one
/// usable tile; a date whose tiles all failed makes the job Failed.
/// Partial tile loss within a date is tolerated and rendered as gaps
/// downstream.
pub struct IngestStage<P: TileProvider, S: JobStore> {
    provider: Arc<P>,
    store: Arc<S>,
    config: PipelineConfig,
}

impl<P: TileProvider, S: JobStore> IngestStage<P, S> {
    pub fn new(provider: Arc<P>, store: Arc<S>, config: PipelineConfig) -> Self {
        Self {
            provider,
            store,
            config,
        }
    }

    /// Runs the stage to a terminal status.
    ///
    /// # Errors
    ///
    /// Only store and filesystem failures; fetch failures are recorded
    /// on the job.
    #[instrument(skip(self, cancel), fields(job_id = %job_id))]
    pub async fn run(
        &self,
        job_id: &JobId,
        cancel: CancellationToken,
    ) -> Result<JobStatus, IngestError> {
        let Some(record) = begin(self.store.as_ref(), job_id).await? else {
            return Ok(JobStatus::Cancelled);
        };

        let JobParams::Ingest(params) = record.params.clone() else {
            let status = finish(
                self.store.as_ref(),
                job_id,
                JobStatus::Failed,
                Some("record is not an ingest job".to_string()),
                None,
            )
            .await?;
            return Ok(status);
        };

        // Per-job overrides fall back to pipeline defaults
        let fetcher = RetryingFetcher::new(Arc::clone(&self.provider))
            .with_max_attempts(params.retries.unwrap_or(self.config.max_attempts()))
            .with_base_delay(self.config.base_delay())
            .with_request_timeout(self.config.request_timeout());
        let limiter = Arc::new(ConcurrencyLimiter::new(
            params
                .max_concurrent
                .unwrap_or(self.config.max_concurrent_fetches()),
        ));
        let downloader = TileBatchDownloader::new(
            fetcher,
            Arc::clone(&self.provider),
            limiter,
            Arc::clone(&self.store),
        );

        let job_dir = self.config.job_dir(job_id);
        let outcome = downloader
            .run(job_id, &params.layer, &job_dir, cancel.clone())
            .await?;

        if outcome.cancelled {
            let status = finish(
                self.store.as_ref(),
                job_id,
                JobStatus::Cancelled,
                None,
                None,
            )
            .await?;
            return Ok(status);
        }

        // Every date needs at least one usable tile
        let record = self
            .store
            .get(job_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(job_id.clone()))?;
        let mut per_date: BTreeMap<chrono::NaiveDate, usize> =
            params.dates().into_iter().map(|d| (d, 0)).collect();
        for unit in &record.units {
            if let UnitKey::Tile { date, .. } = &unit.key {
                if unit.status == UnitStatus::Completed {
                    *per_date.entry(*date).or_insert(0) += 1;
                }
            }
        }
        let empty_dates: Vec<String> = per_date
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(date, _)| date.to_string())
            .collect();

        let status = if empty_dates.is_empty() {
            finish(
                self.store.as_ref(),
                job_id,
                JobStatus::Completed,
                None,
                Some(job_dir.join("tiles").display().to_string()),
            )
            .await?
        } else {
            warn!(
                job_id = %job_id,
                dates = ?empty_dates,
                "ingest failed: dates with no usable tiles"
            );
            finish(
                self.store.as_ref(),
                job_id,
                JobStatus::Failed,
                Some(format!(
                    "{} of {} dates have no usable tiles: {}",
                    empty_dates.len(),
                    per_date.len(),
                    empty_dates.join(", ")
                )),
                None,
            )
            .await?
        };
        Ok(status)
    }
}
