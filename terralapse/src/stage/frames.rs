//! Frame-generation stage: per-date mosaic composition.

use super::{begin, finish};
use crate::job::{
    JobId, JobParams, JobRecord, JobStatus, JobStore, StoreError, UnitKey, UnitStatus,
};
use crate::pipeline::PipelineConfig;
use crate::render::{FrameRenderer, TileSource};
use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Errors that abort a frame run (render failures do not).
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Composes one frame per date from a completed ingest job's tiles.
///
/// Frames are rendered sequentially in date order; composition is
/// CPU-and-disk work, so the fetch limiter does not apply here. A date
/// whose render fails is recorded and skipped, and surviving frames are
/// numbered contiguously so the encoder's input pattern has no holes.
/// Success policy: at least one frame must render.
pub struct FrameStage<R: FrameRenderer, S: JobStore> {
    renderer: Arc<R>,
    store: Arc<S>,
    config: PipelineConfig,
}

impl<R: FrameRenderer, S: JobStore> FrameStage<R, S> {
    pub fn new(renderer: Arc<R>, store: Arc<S>, config: PipelineConfig) -> Self {
        Self {
            renderer,
            store,
            config,
        }
    }

    /// Groups a source ingest record's usable tiles by date.
    fn tiles_by_date(source: &JobRecord) -> BTreeMap<NaiveDate, Vec<TileSource>> {
        let mut by_date: BTreeMap<NaiveDate, Vec<TileSource>> = BTreeMap::new();
        for unit in &source.units {
            if unit.status != UnitStatus::Completed {
                continue;
            }
            if let (UnitKey::Tile { date, tile }, Some(artifact)) = (&unit.key, &unit.artifact) {
                by_date.entry(*date).or_default().push(TileSource {
                    tile: tile.clone(),
                    path: PathBuf::from(artifact),
                });
            }
        }
        by_date
    }

    /// Runs the stage to a terminal status.
    #[instrument(skip(self, cancel), fields(job_id = %job_id))]
    pub async fn run(
        &self,
        job_id: &JobId,
        cancel: CancellationToken,
    ) -> Result<JobStatus, FrameError> {
        let Some(record) = begin(self.store.as_ref(), job_id).await? else {
            return Ok(JobStatus::Cancelled);
        };

        let JobParams::FrameGeneration(params) = record.params.clone() else {
            let status = finish(
                self.store.as_ref(),
                job_id,
                JobStatus::Failed,
                Some("record is not a frame-generation job".to_string()),
                None,
            )
            .await?;
            return Ok(status);
        };

        let Some(source) = self.store.get(&params.source_job_id).await? else {
            let status = finish(
                self.store.as_ref(),
                job_id,
                JobStatus::Failed,
                Some(format!("source job not found: {}", params.source_job_id)),
                None,
            )
            .await?;
            return Ok(status);
        };
        let tiles_by_date = Self::tiles_by_date(&source);

        let frames_dir = self.config.job_dir(job_id).join("frames");
        let mut rendered = 0usize;
        let mut failed = 0usize;

        let frame_dates: Vec<NaiveDate> = record
            .units
            .iter()
            .filter_map(|u| match &u.key {
                UnitKey::Frame { date } => Some(*date),
                _ => None,
            })
            .collect();

        for date in frame_dates {
            if cancel.is_cancelled() {
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

            let tiles = tiles_by_date.get(&date).cloned().unwrap_or_default();
            let output = frames_dir.join(format!("frame_{:05}.png", rendered));

            let result = tokio::time::timeout(
                self.config.render_timeout(),
                self.renderer.render(tiles, output, params.width),
            )
            .await;
            let outcome = match result {
                Ok(Ok(path)) => Ok(path),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err("frame render timed out".to_string()),
            };

            match &outcome {
                Ok(path) => {
                    rendered += 1;
                    debug!(job_id = %job_id, date = %date, path = %path.display(), "frame rendered");
                }
                Err(error) => {
                    failed += 1;
                    warn!(job_id = %job_id, date = %date, error = %error, "frame render failed");
                }
            }

            let key = UnitKey::Frame { date };
            self.store
                .update(job_id, move |record| {
                    if let Some(unit) = record.unit_mut(&key) {
                        match outcome {
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
        }

        let status = if rendered > 0 {
            finish(
                self.store.as_ref(),
                job_id,
                JobStatus::Completed,
                None,
                Some(frames_dir.display().to_string()),
            )
            .await?
        } else {
            finish(
                self.store.as_ref(),
                job_id,
                JobStatus::Failed,
                Some(format!("all {} frames failed to render", failed)),
                None,
            )
            .await?
        };
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::{BoundingBox, TileCoord};
    use crate::job::{
        transition, FrameParams, IngestParams, JobRecord, MemoryJobStore, WorkUnit,
    };
    use crate::render::RenderError;
    use std::sync::Mutex;

    /// Renderer that records calls and fails for dates in a deny list.
    struct ScriptedRenderer {
        fail_if_empty: bool,
        calls: Mutex<Vec<(usize, PathBuf)>>,
    }

    impl ScriptedRenderer {
        fn new() -> Self {
            Self {
                fail_if_empty: true,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl FrameRenderer for ScriptedRenderer {
        async fn render(
            &self,
            tiles: Vec<TileSource>,
            output: PathBuf,
            _width: Option<u32>,
        ) -> Result<PathBuf, RenderError> {
            if self.fail_if_empty && tiles.is_empty() {
                return Err(RenderError::Empty);
            }
            self.calls.lock().unwrap().push((tiles.len(), output.clone()));
            Ok(output)
        }
    }

    /// Builds a Completed ingest job whose tiles exist for `good_dates`.
    async fn seed_source(store: &MemoryJobStore, good_dates: &[&str], all_dates: &[&str]) -> JobId {
        let dates: Vec<NaiveDate> = all_dates.iter().map(|d| d.parse().unwrap()).collect();
        let good: Vec<NaiveDate> = good_dates.iter().map(|d| d.parse().unwrap()).collect();
        let params = JobParams::Ingest(IngestParams {
            layer: "test".to_string(),
            start_date: dates[0],
            end_date: *dates.last().unwrap(),
            bbox: BoundingBox::new(10.0, -10.0, 10.0, -10.0).unwrap(),
            zoom: 2,
            max_concurrent: None,
            retries: None,
        });
        let tile = TileCoord { x: 0, y: 0, zoom: 2 };
        let units = dates
            .iter()
            .map(|date| {
                let mut unit = WorkUnit::pending(UnitKey::Tile {
                    date: *date,
                    tile: tile.clone(),
                });
                if good.contains(date) {
                    unit.status = UnitStatus::Completed;
                    unit.artifact = Some(format!("/tiles/{}/z2_x0_y0.jpg", date));
                } else {
                    unit.status = UnitStatus::Failed;
                    unit.error = Some("404".to_string());
                }
                unit
            })
            .collect();
        let mut record = JobRecord::new(params, units);
        transition(&mut record, JobStatus::Processing).unwrap();
        transition(&mut record, JobStatus::Completed).unwrap();
        let id = record.id.clone();
        store.create(record).await.unwrap();
        id
    }

    async fn seed_frame_job(store: &MemoryJobStore, source: JobId, dates: &[&str]) -> JobId {
        let params = JobParams::FrameGeneration(FrameParams {
            source_job_id: source,
            width: None,
        });
        let units = dates
            .iter()
            .map(|d| {
                WorkUnit::pending(UnitKey::Frame {
                    date: d.parse().unwrap(),
                })
            })
            .collect();
        let record = JobRecord::new(params, units);
        let id = record.id.clone();
        store.create(record).await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_renders_one_frame_per_date() {
        let store = Arc::new(MemoryJobStore::new());
        let dir = tempfile::tempdir().unwrap();
        let dates = ["2024-01-01", "2024-01-02"];
        let source = seed_source(&store, &dates, &dates).await;
        let job_id = seed_frame_job(&store, source, &dates).await;

        let renderer = Arc::new(ScriptedRenderer::new());
        let stage = FrameStage::new(
            Arc::clone(&renderer),
            Arc::clone(&store),
            PipelineConfig::new(dir.path()),
        );
        let status = stage.run(&job_id, CancellationToken::new()).await.unwrap();
        assert_eq!(status, JobStatus::Completed);

        let calls = renderer.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        // Contiguous numbering in date order
        assert!(calls[0].1.ends_with("frame_00000.png"));
        assert!(calls[1].1.ends_with("frame_00001.png"));

        let record = store.get(&job_id).await.unwrap().unwrap();
        assert_eq!(record.progress, 100);
        assert!(record.output_ref.as_ref().unwrap().ends_with("frames"));
    }

    #[tokio::test]
    async fn test_failed_date_skipped_and_numbering_stays_contiguous() {
        let store = Arc::new(MemoryJobStore::new());
        let dir = tempfile::tempdir().unwrap();
        let all = ["2024-01-01", "2024-01-02", "2024-01-03"];
        // Middle date has no usable tiles, so its render fails
        let source = seed_source(&store, &["2024-01-01", "2024-01-03"], &all).await;
        let job_id = seed_frame_job(&store, source, &all).await;

        let renderer = Arc::new(ScriptedRenderer::new());
        let stage = FrameStage::new(
            Arc::clone(&renderer),
            Arc::clone(&store),
            PipelineConfig::new(dir.path()),
        );
        let status = stage.run(&job_id, CancellationToken::new()).await.unwrap();
        assert_eq!(status, JobStatus::Completed);

        let calls = renderer.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert!(calls[1].1.ends_with("frame_00001.png"));

        let record = store.get(&job_id).await.unwrap().unwrap();
        assert_eq!(record.failed_units(), 1);
        assert_eq!(record.completed_units(), 2);
    }

    #[tokio::test]
    async fn test_all_frames_failing_fails_job() {
        let store = Arc::new(MemoryJobStore::new());
        let dir = tempfile::tempdir().unwrap();
        let dates = ["2024-01-01"];
        let source = seed_source(&store, &[], &dates).await;
        let job_id = seed_frame_job(&store, source, &dates).await;

        let stage = FrameStage::new(
            Arc::new(ScriptedRenderer::new()),
            Arc::clone(&store),
            PipelineConfig::new(dir.path()),
        );
        let status = stage.run(&job_id, CancellationToken::new()).await.unwrap();
        assert_eq!(status, JobStatus::Failed);

        let record = store.get(&job_id).await.unwrap().unwrap();
        assert!(record.error.as_ref().unwrap().contains("all 1 frames"));
    }

    #[tokio::test]
    async fn test_missing_source_job_fails() {
        let store = Arc::new(MemoryJobStore::new());
        let dir = tempfile::tempdir().unwrap();
        let job_id = seed_frame_job(
            &store,
            JobId::from_string("job-gone"),
            &["2024-01-01"],
        )
        .await;

        let stage = FrameStage::new(
            Arc::new(ScriptedRenderer::new()),
            Arc::clone(&store),
            PipelineConfig::new(dir.path()),
        );
        let status = stage.run(&job_id, CancellationToken::new()).await.unwrap();
        assert_eq!(status, JobStatus::Failed);

        let record = store.get(&job_id).await.unwrap().unwrap();
        assert!(record.error.as_ref().unwrap().contains("source job not found"));
    }
}
