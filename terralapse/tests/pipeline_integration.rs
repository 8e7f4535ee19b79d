//! Integration tests for the job pipeline.
//!
//! These tests drive the complete flow through a real orchestrator,
//! file-backed job store, mosaic renderer and zip encoder, with only
//! the tile provider mocked:
//! - ingest -> frames -> export chaining and artifact layout
//! - progress monotonicity while downloads complete concurrently
//! - per-unit failure recording and the black-gap rendering policy
//! - cancellation, concurrency bounding and store persistence
//!
//! Run with: `cargo test --test pipeline_integration`

use std::collections::HashSet;
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use image::{Rgb, RgbImage};

use terralapse::coord::TileCoord;
use terralapse::encode::FfmpegEncoder;
use terralapse::job::{ExportFormat, FileJobStore, JobFilter, JobStatus, UnitStatus};
use terralapse::orchestrator::{
    ExportRequest, FrameRequest, IngestRequest, JobOrchestrator,
};
use terralapse::pipeline::PipelineConfig;
use terralapse::provider::{FetchError, TileProvider};
use terralapse::render::MosaicRenderer;

// ============================================================================
// Mock Provider
// ============================================================================

/// Tile provider serving a synthesized PNG, with configurable failures,
/// latency and in-flight tracking.
struct TestProvider {
    png: Vec<u8>,
    delay: Duration,
    fail_tiles: HashSet<(u32, u32)>,
    fail_dates: HashSet<NaiveDate>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl TestProvider {
    fn new() -> Self {
        let mut img = RgbImage::new(256, 256);
        for pixel in img.pixels_mut() {
            *pixel = Rgb([0, 128, 255]);
        }
        let mut png = Vec::new();
        img.write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        Self {
            png,
            delay: Duration::ZERO,
            fail_tiles: HashSet::new(),
            fail_dates: HashSet::new(),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn with_failing_tile(mut self, x: u32, y: u32) -> Self {
        self.fail_tiles.insert((x, y));
        self
    }

    fn with_failing_date(mut self, date: &str) -> Self {
        self.fail_dates.insert(date.parse().unwrap());
        self
    }

    fn peak(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

impl TileProvider for TestProvider {
    async fn fetch_tile(
        &self,
        _layer: &str,
        date: NaiveDate,
        tile: &TileCoord,
    ) -> Result<Vec<u8>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail_dates.contains(&date) || self.fail_tiles.contains(&(tile.x, tile.y)) {
            return Err(FetchError::Status {
                status: 404,
                url: format!("http://test/{}", tile),
            });
        }
        Ok(self.png.clone())
    }

    fn name(&self) -> &str {
        "test"
    }

    fn tile_extension(&self, _layer: &str) -> &'static str {
        "png"
    }
}

// ============================================================================
// Harness
// ============================================================================

type TestOrchestrator =
    JobOrchestrator<TestProvider, MosaicRenderer, FfmpegEncoder, FileJobStore>;

async fn orchestrator(provider: TestProvider, work_dir: &Path) -> TestOrchestrator {
    let store = FileJobStore::new(work_dir.join("jobs")).await.unwrap();
    JobOrchestrator::new(
        Arc::new(provider),
        Arc::new(MosaicRenderer::new()),
        Arc::new(FfmpegEncoder::new()),
        Arc::new(store),
        PipelineConfig::new(work_dir)
            .with_max_attempts(1)
            .with_base_delay(Duration::from_millis(1)),
    )
}

/// A two-date request over a +/-10 degree box at zoom 2 (a 2x2 grid,
/// so 4 tiles per date).
fn small_request() -> IngestRequest {
    IngestRequest {
        layer: "MODIS_Terra_CorrectedReflectance_TrueColor".to_string(),
        start_date: "2024-03-01".parse().unwrap(),
        end_date: "2024-03-02".parse().unwrap(),
        north: 10.0,
        south: -10.0,
        east: 10.0,
        west: -10.0,
        zoom: 2,
        max_concurrent: None,
        retries: None,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_full_pipeline_produces_archive() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(TestProvider::new(), dir.path()).await;

    let ingest_id = orch.create_ingest(small_request()).await.unwrap();
    let ingest = orch.wait(&ingest_id).await.unwrap();
    assert_eq!(ingest.status, JobStatus::Completed);
    assert_eq!(ingest.total_units(), 8);
    assert_eq!(ingest.progress, 100);

    let frames_id = orch
        .create_frames(FrameRequest {
            source_job_id: ingest_id.as_str().to_string(),
            width: None,
        })
        .await
        .unwrap();
    let frames = orch.wait(&frames_id).await.unwrap();
    assert_eq!(frames.status, JobStatus::Completed);
    assert_eq!(frames.completed_units(), 2);

    // Frames are real mosaics: 2x2 tiles of 256px
    let frame_path = frames.units[0].artifact.as_ref().unwrap();
    let frame = image::open(frame_path).unwrap().to_rgb8();
    assert_eq!(frame.width(), 512);
    assert_eq!(frame.height(), 512);
    assert_eq!(frame.get_pixel(10, 10), &Rgb([0, 128, 255]));

    let export_id = orch
        .create_export(ExportRequest {
            source_job_id: frames_id.as_str().to_string(),
            format: ExportFormat::Zip,
            fps: None,
            quality: None,
            width: None,
        })
        .await
        .unwrap();
    let export = orch.wait(&export_id).await.unwrap();
    assert_eq!(export.status, JobStatus::Completed);

    let archive_path = export.output_ref.unwrap();
    assert!(archive_path.ends_with("animation.zip"));
    let file = std::fs::File::open(&archive_path).unwrap();
    let archive = zip::ZipArchive::new(file).unwrap();
    assert_eq!(archive.len(), 2);
}

#[tokio::test]
async fn test_single_tile_request_yields_one_unit_per_date() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(TestProvider::new(), dir.path()).await;

    // Both corners of this box land in the same zoom-5 tile
    let request = IngestRequest {
        layer: "MODIS_Terra_CorrectedReflectance_TrueColor".to_string(),
        start_date: "2024-03-01".parse().unwrap(),
        end_date: "2024-03-02".parse().unwrap(),
        north: 43.0,
        south: 42.0,
        east: -73.0,
        west: -74.0,
        zoom: 5,
        max_concurrent: None,
        retries: None,
    };
    let job_id = orch.create_ingest(request).await.unwrap();
    let record = orch.wait(&job_id).await.unwrap();

    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.total_units(), 2);
}

#[tokio::test]
async fn test_progress_is_monotonic_while_units_complete() {
    let dir = tempfile::tempdir().unwrap();
    let provider = TestProvider::new().with_delay(Duration::from_millis(15));
    let orch = Arc::new(orchestrator(provider, dir.path()).await);

    let job_id = orch.create_ingest(small_request()).await.unwrap();

    let mut snapshots = vec![0u8];
    loop {
        let record = orch.status(&job_id).await.unwrap();
        snapshots.push(record.progress);
        if record.status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(
        snapshots.windows(2).all(|w| w[0] <= w[1]),
        "progress regressed: {:?}",
        snapshots
    );
    assert_eq!(*snapshots.last().unwrap(), 100);
}

#[tokio::test]
async fn test_failed_tiles_become_black_gaps_downstream() {
    let dir = tempfile::tempdir().unwrap();
    // The south-east tile of the 2x2 grid is permanently missing
    let provider = TestProvider::new().with_failing_tile(2, 2);
    let orch = orchestrator(provider, dir.path()).await;

    let ingest_id = orch.create_ingest(small_request()).await.unwrap();
    let ingest = orch.wait(&ingest_id).await.unwrap();

    // Each date still has 3 usable tiles, so ingest completes
    assert_eq!(ingest.status, JobStatus::Completed);
    assert_eq!(ingest.failed_units(), 2);
    let failed: Vec<_> = ingest
        .units
        .iter()
        .filter(|u| u.status == UnitStatus::Failed)
        .collect();
    assert!(failed.iter().all(|u| u.error.as_ref().unwrap().contains("404")));

    let frames_id = orch
        .create_frames(FrameRequest {
            source_job_id: ingest_id.as_str().to_string(),
            width: None,
        })
        .await
        .unwrap();
    let frames = orch.wait(&frames_id).await.unwrap();
    assert_eq!(frames.status, JobStatus::Completed);

    // The missing tile's quadrant renders black
    let frame_path = frames.units[0].artifact.as_ref().unwrap();
    let frame = image::open(frame_path).unwrap().to_rgb8();
    assert_eq!(frame.get_pixel(10, 10), &Rgb([0, 128, 255]));
    assert_eq!(frame.get_pixel(300, 300), &Rgb([0, 0, 0]));
}

#[tokio::test]
async fn test_fully_dark_date_fails_ingest() {
    let dir = tempfile::tempdir().unwrap();
    let provider = TestProvider::new().with_failing_date("2024-03-02");
    let orch = orchestrator(provider, dir.path()).await;

    let job_id = orch.create_ingest(small_request()).await.unwrap();
    let record = orch.wait(&job_id).await.unwrap();

    assert_eq!(record.status, JobStatus::Failed);
    assert!(record.error.as_ref().unwrap().contains("2024-03-02"));
    // The good date's tiles were still fetched and recorded
    assert_eq!(record.completed_units(), 4);
}

#[tokio::test]
async fn test_cancel_stops_in_flight_ingest() {
    let dir = tempfile::tempdir().unwrap();
    let provider = TestProvider::new().with_delay(Duration::from_millis(50));
    let orch = orchestrator(provider, dir.path()).await;

    let mut request = small_request();
    request.max_concurrent = Some(1);
    let job_id = orch.create_ingest(request).await.unwrap();

    // Let a couple of units land, then cancel
    tokio::time::sleep(Duration::from_millis(80)).await;
    orch.cancel(&job_id).await.unwrap();

    let record = orch.wait(&job_id).await.unwrap();
    assert_eq!(record.status, JobStatus::Cancelled);
    // Serialized fetches of 50ms cannot have finished all 8 units
    let terminal = record.completed_units() + record.failed_units();
    assert!(terminal < record.total_units(), "units: {}", terminal);
}

#[tokio::test]
async fn test_concurrency_respects_request_limit() {
    let dir = tempfile::tempdir().unwrap();
    let provider = TestProvider::new().with_delay(Duration::from_millis(20));
    let store = FileJobStore::new(dir.path().join("jobs")).await.unwrap();

    let provider = Arc::new(provider);
    let orch: TestOrchestrator = JobOrchestrator::new(
        Arc::clone(&provider),
        Arc::new(MosaicRenderer::new()),
        Arc::new(FfmpegEncoder::new()),
        Arc::new(store),
        PipelineConfig::new(dir.path())
            .with_max_attempts(1)
            .with_base_delay(Duration::from_millis(1)),
    );

    let mut request = small_request();
    request.max_concurrent = Some(3);
    let job_id = orch.create_ingest(request).await.unwrap();
    let record = orch.wait(&job_id).await.unwrap();

    assert_eq!(record.status, JobStatus::Completed);
    assert!(provider.peak() <= 3, "peak in-flight {}", provider.peak());
}

#[tokio::test]
async fn test_records_survive_orchestrator_restart() {
    let dir = tempfile::tempdir().unwrap();

    let ingest_id = {
        let orch = orchestrator(TestProvider::new(), dir.path()).await;
        let id = orch.create_ingest(small_request()).await.unwrap();
        orch.wait(&id).await.unwrap();
        id
    };

    // Fresh orchestrator over the same work directory
    let orch = orchestrator(TestProvider::new(), dir.path()).await;
    let record = orch.status(&ingest_id).await.unwrap();
    assert_eq!(record.status, JobStatus::Completed);

    // Chaining off the persisted record still works
    let frames_id = orch
        .create_frames(FrameRequest {
            source_job_id: ingest_id.as_str().to_string(),
            width: None,
        })
        .await
        .unwrap();
    let frames = orch.wait(&frames_id).await.unwrap();
    assert_eq!(frames.status, JobStatus::Completed);

    let all = orch.list(&JobFilter::default()).await.unwrap();
    assert_eq!(all.len(), 2);
}

#[tokio::test]
async fn test_downscaled_frames_honor_width() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(TestProvider::new(), dir.path()).await;

    let ingest_id = orch.create_ingest(small_request()).await.unwrap();
    orch.wait(&ingest_id).await.unwrap();

    let frames_id = orch
        .create_frames(FrameRequest {
            source_job_id: ingest_id.as_str().to_string(),
            width: Some(256),
        })
        .await
        .unwrap();
    let frames = orch.wait(&frames_id).await.unwrap();
    assert_eq!(frames.status, JobStatus::Completed);

    let frame_path = frames.units[0].artifact.as_ref().unwrap();
    let frame = image::open(frame_path).unwrap().to_rgb8();
    assert_eq!(frame.width(), 256);
    assert_eq!(frame.height(), 256);
}
