//! Terralapse CLI - Command-line interface
//!
//! This binary drives the terralapse job pipeline: ingest tiles,
//! compose frames, export an animation, and inspect or manage jobs.
//! Job records are persisted under the work directory so runs can be
//! chained across invocations.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use terralapse::encode::FfmpegEncoder;
use terralapse::job::{
    ExportFormat, FileJobStore, JobFilter, JobId, JobKind, JobStatus, Quality,
};
use terralapse::logging::{default_log_dir, default_log_file, init_logging};
use terralapse::orchestrator::{
    ExportRequest, FrameRequest, IngestRequest, JobOrchestrator,
};
use terralapse::pipeline::PipelineConfig;
use terralapse::provider::{GibsProvider, ReqwestFetch};
use terralapse::render::MosaicRenderer;

type Orchestrator =
    JobOrchestrator<GibsProvider<ReqwestFetch>, MosaicRenderer, FfmpegEncoder, FileJobStore>;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliFormat {
    /// H.264 video, broadly playable
    Mp4,
    /// Palette-optimized animated GIF
    Gif,
    /// VP9 video
    Webm,
    /// Zip archive of the raw frames
    Zip,
}

impl From<CliFormat> for ExportFormat {
    fn from(format: CliFormat) -> Self {
        match format {
            CliFormat::Mp4 => ExportFormat::Mp4,
            CliFormat::Gif => ExportFormat::Gif,
            CliFormat::Webm => ExportFormat::Webm,
            CliFormat::Zip => ExportFormat::Zip,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliQuality {
    Low,
    Medium,
    High,
}

impl From<CliQuality> for Quality {
    fn from(quality: CliQuality) -> Self {
        match quality {
            CliQuality::Low => Quality::Low,
            CliQuality::Medium => Quality::Medium,
            CliQuality::High => Quality::High,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliKind {
    Ingest,
    Frames,
    Export,
}

impl From<CliKind> for JobKind {
    fn from(kind: CliKind) -> Self {
        match kind {
            CliKind::Ingest => JobKind::Ingest,
            CliKind::Frames => JobKind::FrameGeneration,
            CliKind::Export => JobKind::Export,
        }
    }
}

#[derive(Parser)]
#[command(name = "terralapse")]
#[command(about = "Build timelapse animations from daily satellite imagery", long_about = None)]
#[command(version = terralapse::VERSION)]
struct Cli {
    /// Work directory for tiles, frames, exports and job records
    #[arg(long, default_value = ".terralapse", global = true)]
    work_dir: PathBuf,

    /// Override the tile service base URL (mirrors, test servers)
    #[arg(long, global = true)]
    base_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download tiles for a layer over a date range and extent
    Ingest {
        /// Remote layer identifier (e.g. MODIS_Terra_CorrectedReflectance_TrueColor)
        #[arg(long)]
        layer: String,
        /// First date, inclusive (YYYY-MM-DD)
        #[arg(long)]
        start_date: chrono::NaiveDate,
        /// Last date, inclusive (YYYY-MM-DD)
        #[arg(long)]
        end_date: chrono::NaiveDate,
        /// Northern edge in decimal degrees
        #[arg(long)]
        north: f64,
        /// Southern edge in decimal degrees
        #[arg(long)]
        south: f64,
        /// Eastern edge in decimal degrees
        #[arg(long)]
        east: f64,
        /// Western edge in decimal degrees
        #[arg(long)]
        west: f64,
        /// Tile zoom level (0-9)
        #[arg(long, default_value = "3")]
        zoom: u8,
        /// Concurrent fetch limit
        #[arg(long)]
        max_concurrent: Option<usize>,
        /// Fetch attempts per tile
        #[arg(long)]
        retries: Option<u32>,
        /// Block until the job reaches a terminal status
        #[arg(long)]
        wait: bool,
    },

    /// Compose per-date frames from a completed ingest job
    Frames {
        /// Completed ingest job ID
        #[arg(long)]
        source: String,
        /// Downscale frames to this width, aspect preserved
        #[arg(long)]
        width: Option<u32>,
        /// Block until the job reaches a terminal status
        #[arg(long)]
        wait: bool,
    },

    /// Encode a completed frame job into a video or archive
    Export {
        /// Completed frame job ID
        #[arg(long)]
        source: String,
        /// Output format
        #[arg(long, value_enum, default_value = "mp4")]
        format: CliFormat,
        /// Frames per second
        #[arg(long)]
        fps: Option<u32>,
        /// Quality preset
        #[arg(long, value_enum)]
        quality: Option<CliQuality>,
        /// Output width, aspect preserved
        #[arg(long)]
        width: Option<u32>,
        /// Block until the job reaches a terminal status
        #[arg(long)]
        wait: bool,
    },

    /// Run ingest, frames and export as one chained pipeline
    Run {
        #[arg(long)]
        layer: String,
        #[arg(long)]
        start_date: chrono::NaiveDate,
        #[arg(long)]
        end_date: chrono::NaiveDate,
        #[arg(long)]
        north: f64,
        #[arg(long)]
        south: f64,
        #[arg(long)]
        east: f64,
        #[arg(long)]
        west: f64,
        #[arg(long, default_value = "3")]
        zoom: u8,
        #[arg(long, value_enum, default_value = "mp4")]
        format: CliFormat,
        #[arg(long)]
        fps: Option<u32>,
        #[arg(long, value_enum)]
        quality: Option<CliQuality>,
        #[arg(long)]
        width: Option<u32>,
    },

    /// Print a job record as JSON
    Status {
        /// Job ID
        job_id: String,
    },

    /// List job records, newest first
    List {
        /// Filter by job kind
        #[arg(long, value_enum)]
        kind: Option<CliKind>,
    },

    /// Request cancellation of a job
    Cancel {
        /// Job ID
        job_id: String,
    },

    /// Delete a terminal job's record and artifacts
    Delete {
        /// Job ID
        job_id: String,
    },

    /// Remove terminal jobs older than the retention window
    Sweep,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let _guard = match init_logging(default_log_dir(), default_log_file()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error initializing logging: {}", e);
            process::exit(1);
        }
    };

    match run(cli).await {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

async fn build_orchestrator(
    work_dir: &PathBuf,
    base_url: Option<String>,
) -> Result<Orchestrator, Box<dyn std::error::Error>> {
    let http = ReqwestFetch::new()?;
    let provider = match base_url {
        Some(url) => GibsProvider::with_base_url(http, url),
        None => GibsProvider::new(http),
    };
    let store = FileJobStore::new(work_dir.join("jobs")).await?;
    Ok(JobOrchestrator::new(
        Arc::new(provider),
        Arc::new(MosaicRenderer::new()),
        Arc::new(FfmpegEncoder::new()),
        Arc::new(store),
        PipelineConfig::new(work_dir.clone()),
    ))
}

async fn run(cli: Cli) -> Result<i32, Box<dyn std::error::Error>> {
    let orchestrator = build_orchestrator(&cli.work_dir, cli.base_url.clone()).await?;

    match cli.command {
        Command::Ingest {
            layer,
            start_date,
            end_date,
            north,
            south,
            east,
            west,
            zoom,
            max_concurrent,
            retries,
            wait,
        } => {
            let job_id = orchestrator
                .create_ingest(IngestRequest {
                    layer,
                    start_date,
                    end_date,
                    north,
                    south,
                    east,
                    west,
                    zoom,
                    max_concurrent,
                    retries,
                })
                .await?;
            finish_job(&orchestrator, job_id, wait).await
        }

        Command::Frames { source, width, wait } => {
            let job_id = orchestrator
                .create_frames(FrameRequest {
                    source_job_id: source,
                    width,
                })
                .await?;
            finish_job(&orchestrator, job_id, wait).await
        }

        Command::Export {
            source,
            format,
            fps,
            quality,
            width,
            wait,
        } => {
            let job_id = orchestrator
                .create_export(ExportRequest {
                    source_job_id: source,
                    format: format.into(),
                    fps,
                    quality: quality.map(Into::into),
                    width,
                })
                .await?;
            finish_job(&orchestrator, job_id, wait).await
        }

        Command::Run {
            layer,
            start_date,
            end_date,
            north,
            south,
            east,
            west,
            zoom,
            format,
            fps,
            quality,
            width,
        } => {
            run_pipeline(
                &orchestrator,
                IngestRequest {
                    layer,
                    start_date,
                    end_date,
                    north,
                    south,
                    east,
                    west,
                    zoom,
                    max_concurrent: None,
                    retries: None,
                },
                format.into(),
                fps,
                quality.map(Into::into),
                width,
            )
            .await
        }

        Command::Status { job_id } => {
            let record = orchestrator.status(&JobId::from_string(job_id)).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(0)
        }

        Command::List { kind } => {
            let filter = JobFilter {
                kind: kind.map(Into::into),
                status: None,
            };
            let records = orchestrator.list(&filter).await?;
            for record in &records {
                println!(
                    "{}  {:<16}  {:<10}  {:>3}%  {}",
                    record.id,
                    record.kind.to_string(),
                    record.status.to_string(),
                    record.progress,
                    record.created_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
            if records.is_empty() {
                eprintln!("No jobs found");
            }
            Ok(0)
        }

        Command::Cancel { job_id } => {
            let status = orchestrator.cancel(&JobId::from_string(job_id)).await?;
            println!("{}", status);
            Ok(0)
        }

        Command::Delete { job_id } => {
            orchestrator.delete(&JobId::from_string(job_id)).await?;
            println!("deleted");
            Ok(0)
        }

        Command::Sweep => {
            let removed = orchestrator.sweep().await?;
            println!("removed {} job(s)", removed);
            Ok(0)
        }
    }
}

/// Prints the admitted job ID, optionally waiting for the terminal
/// record. Exit code reflects the final status when waiting.
async fn finish_job(
    orchestrator: &Orchestrator,
    job_id: JobId,
    wait: bool,
) -> Result<i32, Box<dyn std::error::Error>> {
    println!("{}", job_id);
    if !wait {
        return Ok(0);
    }
    let record = orchestrator.wait(&job_id).await?;
    eprintln!("{}: {}", job_id, record.status);
    if let Some(output) = &record.output_ref {
        println!("{}", output);
    }
    Ok(exit_code_for(record.status))
}

/// Chains ingest -> frames -> export, waiting on each stage.
async fn run_pipeline(
    orchestrator: &Orchestrator,
    ingest: IngestRequest,
    format: ExportFormat,
    fps: Option<u32>,
    quality: Option<Quality>,
    width: Option<u32>,
) -> Result<i32, Box<dyn std::error::Error>> {
    let ingest_id = orchestrator.create_ingest(ingest).await?;
    eprintln!("ingest: {}", ingest_id);
    let record = orchestrator.wait(&ingest_id).await?;
    if record.status != JobStatus::Completed {
        return Err(pipeline_failure("ingest", &record.status, record.error));
    }

    let frames_id = orchestrator
        .create_frames(FrameRequest {
            source_job_id: ingest_id.as_str().to_string(),
            width,
        })
        .await?;
    eprintln!("frames: {}", frames_id);
    let record = orchestrator.wait(&frames_id).await?;
    if record.status != JobStatus::Completed {
        return Err(pipeline_failure("frames", &record.status, record.error));
    }

    let export_id = orchestrator
        .create_export(ExportRequest {
            source_job_id: frames_id.as_str().to_string(),
            format,
            fps,
            quality,
            width,
        })
        .await?;
    eprintln!("export: {}", export_id);
    let record = orchestrator.wait(&export_id).await?;
    if record.status != JobStatus::Completed {
        return Err(pipeline_failure("export", &record.status, record.error));
    }

    if let Some(output) = &record.output_ref {
        println!("{}", output);
    }
    Ok(0)
}

fn pipeline_failure(
    stage: &str,
    status: &JobStatus,
    error: Option<String>,
) -> Box<dyn std::error::Error> {
    let detail = error.unwrap_or_else(|| "no error recorded".to_string());
    format!("{} stage ended {}: {}", stage, status, detail).into()
}

fn exit_code_for(status: JobStatus) -> i32 {
    match status {
        JobStatus::Completed => 0,
        JobStatus::Cancelled => 2,
        _ => 1,
    }
}
