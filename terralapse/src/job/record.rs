//! Job records: the typed, versioned state for a unit of pipeline work.
//!
//! A [`JobRecord`] is created once by the orchestrator, mutated only
//! through the store's atomic update path, and read by pollers. Its
//! `units` list is fixed at creation; progress is always derived from
//! unit terminal counts so concurrent completions can never regress it.

use crate::coord::{BoundingBox, TileCoord};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Global counter mixed into job IDs for uniqueness within a process.
static JOB_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Opaque unique identifier for a job.
///
/// Combines the creation timestamp with a process-local counter so IDs
/// remain unique across restarts of a file-backed store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Creates a new unique job ID.
    pub fn new() -> Self {
        let seq = JOB_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        let millis = Utc::now().timestamp_millis();
        Self(format!("job-{:x}-{:x}", millis, seq))
    }

    /// Wraps an existing identifier (from the CLI or a persisted record).
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The pipeline stage a job belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobKind {
    /// Download tiles for a date range and extent
    Ingest,
    /// Compose per-date frames from ingested tiles
    FrameGeneration,
    /// Encode ordered frames into a video or archive
    Export,
}

impl JobKind {
    /// Returns the kind name for logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ingest => "ingest",
            Self::FrameGeneration => "frame_generation",
            Self::Export => "export",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Job lifecycle status.
///
/// `Pending` is the only initial state; `Processing` the only working
/// state; the remaining three are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Returns true for Completed, Failed or Cancelled.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns the status name for logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status of a single work unit within a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl UnitStatus {
    /// Returns true once the unit can no longer change.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Identity of a work unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UnitKey {
    /// One tile fetch for an ingest job
    Tile { date: NaiveDate, tile: TileCoord },
    /// One frame render for a frame-generation job
    Frame { date: NaiveDate },
    /// The single monolithic encode of an export job
    Encode,
}

impl std::fmt::Display for UnitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tile { date, tile } => write!(f, "{}/{}", date, tile),
            Self::Frame { date } => write!(f, "frame/{}", date),
            Self::Encode => write!(f, "encode"),
        }
    }
}

/// The smallest independently retryable piece of work in a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkUnit {
    /// What this unit covers
    pub key: UnitKey,
    /// Unit lifecycle status
    pub status: UnitStatus,
    /// Path/URL of the produced artifact, set on success
    pub artifact: Option<String>,
    /// Last error message, set on failure
    pub error: Option<String>,
}

impl WorkUnit {
    /// Creates a pending unit.
    pub fn pending(key: UnitKey) -> Self {
        Self {
            key,
            status: UnitStatus::Pending,
            artifact: None,
            error: None,
        }
    }
}

/// Output container format for export jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Mp4,
    Gif,
    Webm,
    Zip,
}

impl ExportFormat {
    /// File extension for the produced artifact.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Gif => "gif",
            Self::Webm => "webm",
            Self::Zip => "zip",
        }
    }
}

/// Encoder quality preset, mapped to CRF values by the ffmpeg encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Low,
    Medium,
    High,
}

/// Parameters for an ingest job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestParams {
    /// Remote layer identifier (e.g. a GIBS layer name)
    pub layer: String,
    /// First imagery date, inclusive
    pub start_date: NaiveDate,
    /// Last imagery date, inclusive
    pub end_date: NaiveDate,
    /// Geographic extent
    pub bbox: BoundingBox,
    /// Tile zoom level
    pub zoom: u8,
    /// Override for concurrent fetches (limiter size)
    pub max_concurrent: Option<usize>,
    /// Override for fetch attempts per tile
    pub retries: Option<u32>,
}

impl IngestParams {
    /// Returns the inclusive list of dates covered by this job, in order.
    pub fn dates(&self) -> Vec<NaiveDate> {
        let mut dates = Vec::new();
        let mut current = self.start_date;
        while current <= self.end_date {
            dates.push(current);
            match current.succ_opt() {
                Some(next) => current = next,
                None => break,
            }
        }
        dates
    }
}

/// Parameters for a frame-generation job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameParams {
    /// Ingest job supplying the tiles; must be Completed
    pub source_job_id: JobId,
    /// Optional downscale width for composed frames
    pub width: Option<u32>,
}

/// Parameters for an export job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportParams {
    /// Frame-generation job supplying the frames; must be Completed
    pub source_job_id: JobId,
    /// Output container format
    pub format: ExportFormat,
    /// Frames per second (video formats)
    pub fps: Option<u32>,
    /// Quality preset (video formats)
    pub quality: Option<Quality>,
    /// Output width (gif scaling)
    pub width: Option<u32>,
}

/// Kind-specific immutable input for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobParams {
    Ingest(IngestParams),
    FrameGeneration(FrameParams),
    Export(ExportParams),
}

impl JobParams {
    /// Returns the job kind these parameters belong to.
    pub fn kind(&self) -> JobKind {
        match self {
            Self::Ingest(_) => JobKind::Ingest,
            Self::FrameGeneration(_) => JobKind::FrameGeneration,
            Self::Export(_) => JobKind::Export,
        }
    }
}

/// Durable state for one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// Opaque unique identifier, immutable
    pub id: JobId,
    /// Pipeline stage, immutable
    pub kind: JobKind,
    /// Lifecycle status (see state machine in the stage module)
    pub status: JobStatus,
    /// Derived percentage, 0-100, monotone while Processing
    pub progress: u8,
    /// Kind-specific immutable input
    pub params: JobParams,
    /// Work units; length fixed at creation
    pub units: Vec<WorkUnit>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last mutation time
    pub updated_at: DateTime<Utc>,
    /// Set exactly once, on entering a terminal status
    pub completed_at: Option<DateTime<Utc>>,
    /// Human-readable failure summary, present only when Failed
    pub error: Option<String>,
    /// Final artifact reference, set on Completed for frame/export jobs
    pub output_ref: Option<String>,
}

impl JobRecord {
    /// Creates a new Pending record with a fixed unit list.
    pub fn new(params: JobParams, units: Vec<WorkUnit>) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            kind: params.kind(),
            status: JobStatus::Pending,
            progress: 0,
            params,
            units,
            created_at: now,
            updated_at: now,
            completed_at: None,
            error: None,
            output_ref: None,
        }
    }

    /// Total number of work units.
    #[inline]
    pub fn total_units(&self) -> usize {
        self.units.len()
    }

    /// Number of units that completed successfully.
    pub fn completed_units(&self) -> usize {
        self.units
            .iter()
            .filter(|u| u.status == UnitStatus::Completed)
            .count()
    }

    /// Number of units that failed.
    pub fn failed_units(&self) -> usize {
        self.units
            .iter()
            .filter(|u| u.status == UnitStatus::Failed)
            .count()
    }

    /// Recomputes `progress` from unit terminal counts.
    ///
    /// `round(100 * (completed + failed) / total)`; a job with no units
    /// reports 0 until a terminal status forces 100.
    pub fn recompute_progress(&mut self) {
        let total = self.total_units();
        if total == 0 {
            return;
        }
        let done = self.completed_units() + self.failed_units();
        self.progress = ((100.0 * done as f64 / total as f64).round()) as u8;
    }

    /// Finds the unit with the given key.
    pub fn unit_mut(&mut self, key: &UnitKey) -> Option<&mut WorkUnit> {
        self.units.iter_mut().find(|u| &u.key == key)
    }
}
