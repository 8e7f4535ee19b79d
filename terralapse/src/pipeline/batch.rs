//! Batch tile downloader.
//!
//! Expands an ingest job's work units into concurrent fetch tasks,
//! bounded by the shared [`ConcurrencyLimiter`], and records each unit's
//! outcome in the job store as it lands. A failed unit consumes its
//! retries inside the [`RetryingFetcher`] and is then recorded, never
//! raised; the batch always runs to completion or cancellation.

use crate::fetch::RetryingFetcher;
use crate::job::{JobId, JobStore, StoreError, UnitKey, UnitStatus};
use crate::limiter::ConcurrencyLimiter;
use crate::provider::TileProvider;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Errors that abort a whole batch (individual tile failures do not).
#[derive(Debug, Error)]
pub enum BatchError {
    /// Job store rejected an update
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Tile directory could not be created
    #[error("failed to prepare tile directory: {0}")]
    Io(#[from] std::io::Error),
}

/// Aggregate result of one batch download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Units that produced a tile file
    pub completed: usize,
    /// Units that exhausted their retries
    pub failed: usize,
    /// Total tile units in the job
    pub total: usize,
    /// Whether the batch was cut short by cancellation
    pub cancelled: bool,
}

impl BatchOutcome {
    /// Units that never ran (cancelled before being collected).
    pub fn pending(&self) -> usize {
        self.total - self.completed - self.failed
    }
}

/// Result of one tile task, fed back into the store.
struct TileResult {
    key: UnitKey,
    outcome: Result<PathBuf, String>,
}

/// Downloads every tile unit of an ingest job concurrently.
///
/// Each unit acquires a limiter permit, fetches through the retrying
/// fetcher and writes its bytes under
/// `{job_dir}/tiles/{date}/z{z}_x{x}_y{y}.{ext}`. Unit outcomes are
/// written to the store as they complete so pollers see live progress.
pub struct TileBatchDownloader<P: TileProvider, S: JobStore> {
    fetcher: RetryingFetcher<P>,
    provider: Arc<P>,
    limiter: Arc<ConcurrencyLimiter>,
    store: Arc<S>,
}

impl<P: TileProvider, S: JobStore> TileBatchDownloader<P, S> {
    /// Creates a downloader sharing the given fetcher, limiter and store.
    pub fn new(
        fetcher: RetryingFetcher<P>,
        provider: Arc<P>,
        limiter: Arc<ConcurrencyLimiter>,
        store: Arc<S>,
    ) -> Self {
        Self {
            fetcher,
            provider,
            limiter,
            store,
        }
    }

    /// Runs the batch for a job, returning the aggregate outcome.
    ///
    /// Reads the job's tile units from the store, spawns one task per
    /// unit and collects results as they land. On cancellation,
    /// in-flight fetches are aborted and already-recorded outcomes are
    /// kept; units never collected stay Pending.
    ///
    /// # Errors
    ///
    /// Only store and directory-creation failures abort the batch; tile
    /// fetch failures are recorded as unit failures.
    #[instrument(skip(self, job_dir, cancel), fields(job_id = %job_id))]
    pub async fn run(
        &self,
        job_id: &JobId,
        layer: &str,
        job_dir: &Path,
        cancel: CancellationToken,
    ) -> Result<BatchOutcome, BatchError> {
        let record = self
            .store
            .get(job_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(job_id.clone()))?;

        let tile_units: Vec<UnitKey> = record
            .units
            .iter()
            .filter(|u| !u.status.is_terminal())
            .filter_map(|u| match &u.key {
                key @ UnitKey::Tile { .. } => Some(key.clone()),
                _ => None,
            })
            .collect();
        let total = record
            .units
            .iter()
            .filter(|u| matches!(u.key, UnitKey::Tile { .. }))
            .count();

        let mut outcome = BatchOutcome {
            completed: record.completed_units(),
            failed: record.failed_units(),
            total,
            cancelled: false,
        };

        if cancel.is_cancelled() {
            outcome.cancelled = true;
            return Ok(outcome);
        }

        let ext = self.provider.tile_extension(layer);
        let tiles_dir = job_dir.join("tiles");

        // One directory per date, created up front so workers only write
        for key in &tile_units {
            if let UnitKey::Tile { date, .. } = key {
                tokio::fs::create_dir_all(tiles_dir.join(date.to_string())).await?;
            }
        }

        let mut tasks = JoinSet::new();
        for key in tile_units {
            let UnitKey::Tile { date, tile } = key.clone() else {
                continue;
            };
            let fetcher = self.fetcher.clone();
            let limiter = Arc::clone(&self.limiter);
            let token = cancel.clone();
            let layer = layer.to_string();
            let path = tiles_dir
                .join(date.to_string())
                .join(format!("{}.{}", tile, ext));

            tasks.spawn(async move {
                let _permit = limiter.acquire().await;
                let outcome = match fetcher.fetch(&layer, date, &tile, &token).await {
                    Ok(bytes) => match tokio::fs::write(&path, &bytes).await {
                        Ok(()) => Ok(path),
                        Err(e) => Err(format!("write failed: {}", e)),
                    },
                    Err(e) => Err(e.to_string()),
                };
                TileResult { key, outcome }
            });
        }

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!(
                        job_id = %job_id,
                        completed = outcome.completed,
                        failed = outcome.failed,
                        "batch cancelled, aborting remaining fetches"
                    );
                    tasks.abort_all();
                    outcome.cancelled = true;
                    break;
                }

                result = tasks.join_next() => {
                    match result {
                        Some(Ok(tile_result)) => {
                            self.record_unit(job_id, &tile_result, &mut outcome).await?;
                        }
                        Some(Err(join_err)) => {
                            if !join_err.is_cancelled() {
                                warn!(job_id = %job_id, error = %join_err, "tile task panicked");
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        debug!(
            job_id = %job_id,
            completed = outcome.completed,
            failed = outcome.failed,
            total = outcome.total,
            cancelled = outcome.cancelled,
            "batch download complete"
        );
        Ok(outcome)
    }

    /// Writes one unit outcome to the store and updates the tally.
    async fn record_unit(
        &self,
        job_id: &JobId,
        result: &TileResult,
        outcome: &mut BatchOutcome,
    ) -> Result<(), StoreError> {
        let key = result.key.clone();
        let unit_outcome = result.outcome.clone();
        match &result.outcome {
            Ok(_) => outcome.completed += 1,
            Err(error) => {
                warn!(job_id = %job_id, unit = %key, error = %error, "tile unit failed");
                outcome.failed += 1;
            }
        }

        self.store
            .update(job_id, move |record| {
                if let Some(unit) = record.unit_mut(&key) {
                    match unit_outcome {
                        Ok(path) => {
                            unit.status = UnitStatus::Completed;
                            unit.artifact = Some(path.display().to_string());
                        }
                        Err(error) => {
                            unit.status = UnitStatus::Failed;
                            unit.error = Some(error);
                        }
                    }
                }
                record.recompute_progress();
                Ok(())
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::{BoundingBox, TileCoord};
    use crate::job::{IngestParams, JobParams, JobRecord, MemoryJobStore, WorkUnit};
    use crate::provider::FetchError;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Provider that serves fixed bytes, failing for tiles in a deny set.
    struct ScriptedProvider {
        deny: Vec<TileCoord>,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new(deny: Vec<TileCoord>) -> Self {
            Self {
                deny,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl TileProvider for ScriptedProvider {
        async fn fetch_tile(
            &self,
            _layer: &str,
            _date: NaiveDate,
            tile: &TileCoord,
        ) -> Result<Vec<u8>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.deny.contains(tile) {
                Err(FetchError::Status {
                    status: 404,
                    url: "http://test".to_string(),
                })
            } else {
                Ok(vec![1, 2, 3])
            }
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn ingest_record(dates: &[&str], tiles: &[TileCoord]) -> JobRecord {
        let dates: Vec<NaiveDate> = dates.iter().map(|d| d.parse().unwrap()).collect();
        let params = JobParams::Ingest(IngestParams {
            layer: "MODIS_Terra_CorrectedReflectance_TrueColor".to_string(),
            start_date: dates[0],
            end_date: *dates.last().unwrap(),
            bbox: BoundingBox::new(10.0, -10.0, 10.0, -10.0).unwrap(),
            zoom: tiles[0].zoom,
            max_concurrent: None,
            retries: None,
        });
        let units = dates
            .iter()
            .flat_map(|date| {
                tiles.iter().map(|tile| {
                    WorkUnit::pending(UnitKey::Tile {
                        date: *date,
                        tile: tile.clone(),
                    })
                })
            })
            .collect();
        JobRecord::new(params, units)
    }

    fn downloader<P: TileProvider>(
        provider: P,
        store: Arc<MemoryJobStore>,
    ) -> TileBatchDownloader<P, MemoryJobStore> {
        let provider = Arc::new(provider);
        let fetcher = RetryingFetcher::new(Arc::clone(&provider))
            .with_max_attempts(1)
            .with_base_delay(Duration::from_millis(1));
        TileBatchDownloader::new(
            fetcher,
            provider,
            Arc::new(ConcurrencyLimiter::new(4)),
            store,
        )
    }

    #[tokio::test]
    async fn test_all_tiles_succeed() {
        let store = Arc::new(MemoryJobStore::new());
        let tiles = vec![
            TileCoord { x: 0, y: 0, zoom: 2 },
            TileCoord { x: 1, y: 0, zoom: 2 },
        ];
        let record = ingest_record(&["2024-01-01", "2024-01-02"], &tiles);
        let job_id = record.id.clone();
        store.create(record).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let dl = downloader(ScriptedProvider::new(vec![]), Arc::clone(&store));
        let outcome = dl
            .run(&job_id, "layer", dir.path(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.completed, 4);
        assert_eq!(outcome.failed, 0);
        assert_eq!(outcome.total, 4);
        assert!(!outcome.cancelled);

        let record = store.get(&job_id).await.unwrap().unwrap();
        assert_eq!(record.progress, 100);
        assert!(record
            .units
            .iter()
            .all(|u| u.status == UnitStatus::Completed && u.artifact.is_some()));

        // Tiles land under per-date directories
        let tile_path = dir.path().join("tiles/2024-01-01/z2_x0_y0.jpg");
        assert!(tile_path.exists());
        assert_eq!(std::fs::read(tile_path).unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_partial_failure_is_recorded_not_raised() {
        let store = Arc::new(MemoryJobStore::new());
        let good = TileCoord { x: 0, y: 0, zoom: 2 };
        let bad = TileCoord { x: 3, y: 3, zoom: 2 };
        let record = ingest_record(&["2024-01-01"], &[good.clone(), bad.clone()]);
        let job_id = record.id.clone();
        store.create(record).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let dl = downloader(ScriptedProvider::new(vec![bad]), Arc::clone(&store));
        let outcome = dl
            .run(&job_id, "layer", dir.path(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.completed, 1);
        assert_eq!(outcome.failed, 1);

        let record = store.get(&job_id).await.unwrap().unwrap();
        assert_eq!(record.progress, 100);
        let failed: Vec<_> = record
            .units
            .iter()
            .filter(|u| u.status == UnitStatus::Failed)
            .collect();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].error.as_ref().unwrap().contains("404"));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_runs_nothing() {
        let store = Arc::new(MemoryJobStore::new());
        let record = ingest_record(&["2024-01-01"], &[TileCoord { x: 0, y: 0, zoom: 2 }]);
        let job_id = record.id.clone();
        store.create(record).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();

        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![]);
        let dl = downloader(provider, Arc::clone(&store));
        let outcome = dl.run(&job_id, "layer", dir.path(), cancel).await.unwrap();

        assert!(outcome.cancelled);
        assert_eq!(outcome.completed, 0);
        assert_eq!(outcome.pending(), 1);

        let record = store.get(&job_id).await.unwrap().unwrap();
        assert_eq!(record.units[0].status, UnitStatus::Pending);
    }

    #[tokio::test]
    async fn test_concurrency_stays_within_limit() {
        let store = Arc::new(MemoryJobStore::new());
        let tiles: Vec<TileCoord> = (0..10)
            .map(|x| TileCoord { x, y: 0, zoom: 5 })
            .collect();
        let record = ingest_record(&["2024-01-01"], &tiles);
        let job_id = record.id.clone();
        store.create(record).await.unwrap();

        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let fetcher = RetryingFetcher::new(Arc::clone(&provider)).with_max_attempts(1);
        let limiter = Arc::new(ConcurrencyLimiter::new(2));
        let dl = TileBatchDownloader::new(
            fetcher,
            provider,
            Arc::clone(&limiter),
            Arc::clone(&store),
        );

        let dir = tempfile::tempdir().unwrap();
        dl.run(&job_id, "layer", dir.path(), CancellationToken::new())
            .await
            .unwrap();

        assert!(limiter.peak_in_flight() <= 2);
    }
}
