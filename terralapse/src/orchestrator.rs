//! Job orchestrator.
//!
//! The single entry point for creating, inspecting, cancelling and
//! expiring jobs. Validation happens here, at admission: a request that
//! passes produces a Pending record and a spawned stage task; a request
//! that fails produces no record at all. Stage tasks run detached and
//! settle their own records, so the orchestrator never blocks a caller
//! on pipeline work.

use crate::coord::{tiles_for_bbox, BoundingBox, CoordError, MAX_ZOOM};
use crate::job::{
    sweep_terminal, transition, ExportFormat, ExportParams, FrameParams, IngestParams, JobFilter,
    JobId, JobKind, JobParams, JobRecord, JobStatus, JobStore, Quality, StoreError, UnitKey,
    WorkUnit,
};
use crate::pipeline::PipelineConfig;
use crate::provider::TileProvider;
use crate::render::FrameRenderer;
use crate::encode::VideoEncoder;
use crate::stage::{ExportStage, FrameStage, IngestStage};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Longest allowed ingest date range, inclusive.
pub const MAX_DATE_SPAN_DAYS: i64 = 366;

/// Highest accepted frames-per-second for video exports.
pub const MAX_FPS: u32 = 60;

/// Errors from orchestrator operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Request rejected at admission
    #[error("invalid request: {0}")]
    Validation(String),

    /// Geographic input rejected
    #[error(transparent)]
    Coord(#[from] CoordError),

    /// No job with the given ID
    #[error("job not found: {0}")]
    NotFound(JobId),

    /// Upstream job is not Completed
    #[error("upstream job {id} is {status}, not completed")]
    UpstreamNotReady { id: JobId, status: JobStatus },

    /// Upstream job is the wrong kind for this stage
    #[error("upstream job {id} is {actual}, expected {expected}")]
    UpstreamWrongKind {
        id: JobId,
        actual: JobKind,
        expected: JobKind,
    },

    /// Store failure
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Request to ingest a layer over a date range and extent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRequest {
    pub layer: String,
    pub start_date: chrono::NaiveDate,
    pub end_date: chrono::NaiveDate,
    pub north: f64,
    pub south: f64,
    pub east: f64,
    pub west: f64,
    pub zoom: u8,
    #[serde(default)]
    pub max_concurrent: Option<usize>,
    #[serde(default)]
    pub retries: Option<u32>,
}

/// Request to compose frames from a completed ingest job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameRequest {
    pub source_job_id: String,
    #[serde(default)]
    pub width: Option<u32>,
}

/// Request to encode a completed frame job into an artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportRequest {
    pub source_job_id: String,
    pub format: ExportFormat,
    #[serde(default)]
    pub fps: Option<u32>,
    #[serde(default)]
    pub quality: Option<Quality>,
    #[serde(default)]
    pub width: Option<u32>,
}

/// Creates jobs, spawns their stage tasks and tracks cancellation.
pub struct JobOrchestrator<P, R, E, S>
where
    P: TileProvider,
    R: FrameRenderer,
    E: VideoEncoder,
    S: JobStore,
{
    store: Arc<S>,
    config: PipelineConfig,
    ingest: Arc<IngestStage<P, S>>,
    frames: Arc<FrameStage<R, S>>,
    export: Arc<ExportStage<E, S>>,
    active: Arc<Mutex<HashMap<JobId, CancellationToken>>>,
}

impl<P, R, E, S> JobOrchestrator<P, R, E, S>
where
    P: TileProvider,
    R: FrameRenderer,
    E: VideoEncoder,
    S: JobStore,
{
    /// Creates an orchestrator wiring the provider, renderer and
    /// encoder into their stages.
    pub fn new(
        provider: Arc<P>,
        renderer: Arc<R>,
        encoder: Arc<E>,
        store: Arc<S>,
        config: PipelineConfig,
    ) -> Self {
        let ingest = Arc::new(IngestStage::new(
            provider,
            Arc::clone(&store),
            config.clone(),
        ));
        let frames = Arc::new(FrameStage::new(
            renderer,
            Arc::clone(&store),
            config.clone(),
        ));
        let export = Arc::new(ExportStage::new(
            encoder,
            Arc::clone(&store),
            config.clone(),
        ));
        Self {
            store,
            config,
            ingest,
            frames,
            export,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Admits an ingest job and spawns its download task.
    ///
    /// # Errors
    ///
    /// Validation failures (empty layer, inverted or oversized date
    /// range, bad extent or zoom) reject the request without creating
    /// a record.
    pub async fn create_ingest(
        &self,
        request: IngestRequest,
    ) -> Result<JobId, OrchestratorError> {
        if request.layer.trim().is_empty() {
            return Err(OrchestratorError::Validation("layer must not be empty".into()));
        }
        if request.start_date > request.end_date {
            return Err(OrchestratorError::Validation(format!(
                "start date {} is after end date {}",
                request.start_date, request.end_date
            )));
        }
        let span = (request.end_date - request.start_date).num_days() + 1;
        if span > MAX_DATE_SPAN_DAYS {
            return Err(OrchestratorError::Validation(format!(
                "date range spans {} days, maximum is {}",
                span, MAX_DATE_SPAN_DAYS
            )));
        }
        if request.zoom > MAX_ZOOM {
            return Err(OrchestratorError::Validation(format!(
                "zoom {} exceeds maximum {}",
                request.zoom, MAX_ZOOM
            )));
        }
        if let Some(0) = request.max_concurrent {
            return Err(OrchestratorError::Validation(
                "max_concurrent must be at least 1".into(),
            ));
        }
        if let Some(0) = request.retries {
            return Err(OrchestratorError::Validation(
                "retries must be at least 1".into(),
            ));
        }

        let bbox = BoundingBox::new(request.north, request.south, request.east, request.west)?;
        let tiles = tiles_for_bbox(&bbox, request.zoom, self.config.max_tiles_per_frame())?;

        let params = IngestParams {
            layer: request.layer,
            start_date: request.start_date,
            end_date: request.end_date,
            bbox,
            zoom: request.zoom,
            max_concurrent: request.max_concurrent,
            retries: request.retries,
        };
        let units: Vec<WorkUnit> = params
            .dates()
            .into_iter()
            .flat_map(|date| {
                tiles.iter().map(move |tile| {
                    WorkUnit::pending(UnitKey::Tile {
                        date,
                        tile: tile.clone(),
                    })
                })
            })
            .collect();

        let record = JobRecord::new(JobParams::Ingest(params), units);
        let job_id = record.id.clone();
        info!(
            job_id = %job_id,
            units = record.total_units(),
            "ingest job admitted"
        );
        self.store.create(record).await?;

        let stage = Arc::clone(&self.ingest);
        let token = self.register(&job_id).await;
        let active = Arc::clone(&self.active);
        let id = job_id.clone();
        tokio::spawn(async move {
            if let Err(e) = stage.run(&id, token).await {
                error!(job_id = %id, error = %e, "ingest stage aborted");
            }
            active.lock().await.remove(&id);
        });
        Ok(job_id)
    }

    /// Admits a frame-generation job against a completed ingest job.
    pub async fn create_frames(&self, request: FrameRequest) -> Result<JobId, OrchestratorError> {
        let source_id = JobId::from_string(request.source_job_id);
        let source = self.require_completed(&source_id, JobKind::Ingest).await?;

        let JobParams::Ingest(source_params) = &source.params else {
            return Err(OrchestratorError::UpstreamWrongKind {
                id: source_id,
                actual: source.kind,
                expected: JobKind::Ingest,
            });
        };

        let params = FrameParams {
            source_job_id: source_id,
            width: request.width,
        };
        let units: Vec<WorkUnit> = source_params
            .dates()
            .into_iter()
            .map(|date| WorkUnit::pending(UnitKey::Frame { date }))
            .collect();

        let record = JobRecord::new(JobParams::FrameGeneration(params), units);
        let job_id = record.id.clone();
        info!(job_id = %job_id, frames = record.total_units(), "frame job admitted");
        self.store.create(record).await?;

        let stage = Arc::clone(&self.frames);
        let token = self.register(&job_id).await;
        let active = Arc::clone(&self.active);
        let id = job_id.clone();
        tokio::spawn(async move {
            if let Err(e) = stage.run(&id, token).await {
                error!(job_id = %id, error = %e, "frame stage aborted");
            }
            active.lock().await.remove(&id);
        });
        Ok(job_id)
    }

    /// Admits an export job against a completed frame job.
    pub async fn create_export(&self, request: ExportRequest) -> Result<JobId, OrchestratorError> {
        if let Some(fps) = request.fps {
            if fps == 0 || fps > MAX_FPS {
                return Err(OrchestratorError::Validation(format!(
                    "fps must be between 1 and {}",
                    MAX_FPS
                )));
            }
        }
        let source_id = JobId::from_string(request.source_job_id);
        self.require_completed(&source_id, JobKind::FrameGeneration)
            .await?;

        let params = ExportParams {
            source_job_id: source_id,
            format: request.format,
            fps: request.fps,
            quality: request.quality,
            width: request.width,
        };
        let record = JobRecord::new(
            JobParams::Export(params),
            vec![WorkUnit::pending(UnitKey::Encode)],
        );
        let job_id = record.id.clone();
        info!(job_id = %job_id, format = ?request.format, "export job admitted");
        self.store.create(record).await?;

        let stage = Arc::clone(&self.export);
        let token = self.register(&job_id).await;
        let active = Arc::clone(&self.active);
        let id = job_id.clone();
        tokio::spawn(async move {
            if let Err(e) = stage.run(&id, token).await {
                error!(job_id = %id, error = %e, "export stage aborted");
            }
            active.lock().await.remove(&id);
        });
        Ok(job_id)
    }

    /// Fetches a job record.
    pub async fn status(&self, id: &JobId) -> Result<JobRecord, OrchestratorError> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(id.clone()))
    }

    /// Lists job records matching the filter, newest first.
    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, OrchestratorError> {
        Ok(self.store.list(filter).await?)
    }

    /// Requests cancellation of a job.
    ///
    /// Idempotent: cancelling a terminal or already-cancelled job
    /// returns its current status unchanged. A running stage observes
    /// the token and settles the record as Cancelled; a job with no
    /// live task (after a restart) is terminated directly.
    pub async fn cancel(&self, id: &JobId) -> Result<JobStatus, OrchestratorError> {
        let record = self.status(id).await?;
        if record.status.is_terminal() {
            return Ok(record.status);
        }

        let token = self.active.lock().await.get(id).cloned();
        match token {
            Some(token) => {
                info!(job_id = %id, "cancellation requested");
                token.cancel();
                Ok(record.status)
            }
            None => {
                // No live task owns this record; settle it here
                warn!(job_id = %id, "cancelling job with no running task");
                let record = self
                    .store
                    .update(id, |r| transition(r, JobStatus::Cancelled))
                    .await?;
                Ok(record.status)
            }
        }
    }

    /// Deletes a job's record and its artifact directory.
    ///
    /// A Pending or Processing job is cancelled first and its record
    /// allowed to settle terminal before removal, so a running stage
    /// task never writes into a deleted record.
    pub async fn delete(&self, id: &JobId) -> Result<(), OrchestratorError> {
        let record = self.status(id).await?;
        if !record.status.is_terminal() {
            info!(job_id = %id, status = %record.status, "cancelling active job before delete");
            self.cancel(id).await?;
            self.wait(id).await?;
        }
        self.store.delete(id).await?;
        let job_dir = self.config.job_dir(id);
        if let Err(e) = tokio::fs::remove_dir_all(&job_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %job_dir.display(), error = %e, "failed to remove job directory");
            }
        }
        info!(job_id = %id, "job deleted");
        Ok(())
    }

    /// Removes terminal records older than the retention window,
    /// along with their artifact directories.
    pub async fn sweep(&self) -> Result<usize, OrchestratorError> {
        let removed = sweep_terminal(self.store.as_ref(), self.config.retention()).await?;
        for id in &removed {
            let job_dir = self.config.job_dir(id);
            if let Err(e) = tokio::fs::remove_dir_all(&job_dir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %job_dir.display(), error = %e, "failed to remove swept job directory");
                }
            }
        }
        if !removed.is_empty() {
            info!(count = removed.len(), "swept expired jobs");
        }
        Ok(removed.len())
    }

    /// Waits for a job to reach a terminal status, polling the store.
    pub async fn wait(&self, id: &JobId) -> Result<JobRecord, OrchestratorError> {
        loop {
            let record = self.status(id).await?;
            if record.status.is_terminal() {
                return Ok(record);
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    }

    /// Verifies an upstream job exists, is the expected kind and has
    /// completed.
    async fn require_completed(
        &self,
        id: &JobId,
        expected: JobKind,
    ) -> Result<JobRecord, OrchestratorError> {
        let record = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(id.clone()))?;
        if record.kind != expected {
            return Err(OrchestratorError::UpstreamWrongKind {
                id: id.clone(),
                actual: record.kind,
                expected,
            });
        }
        if record.status != JobStatus::Completed {
            return Err(OrchestratorError::UpstreamNotReady {
                id: id.clone(),
                status: record.status,
            });
        }
        Ok(record)
    }

    /// Registers a cancellation token for a newly spawned job.
    async fn register(&self, id: &JobId) -> CancellationToken {
        let token = CancellationToken::new();
        self.active.lock().await.insert(id.clone(), token.clone());
        token
    }
}
