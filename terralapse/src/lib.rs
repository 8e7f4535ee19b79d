//! Terralapse - timelapse animations from daily satellite imagery
//!
//! This library implements an asynchronous job pipeline that ingests a
//! named remote raster layer across a date range and geographic extent,
//! composes per-date frames from the fetched tiles, and exports the
//! frames as a video or archive.
//!
//! # High-Level API
//!
//! The [`orchestrator`] module is the front door:
//!
//! ```ignore
//! use terralapse::encode::FfmpegEncoder;
//! use terralapse::job::MemoryJobStore;
//! use terralapse::orchestrator::{IngestRequest, JobOrchestrator};
//! use terralapse::pipeline::PipelineConfig;
//! use terralapse::provider::{GibsProvider, ReqwestFetch};
//! use terralapse::render::MosaicRenderer;
//! use std::sync::Arc;
//!
//! let provider = Arc::new(GibsProvider::new(ReqwestFetch::new()?));
//! let orchestrator = JobOrchestrator::new(
//!     provider,
//!     Arc::new(MosaicRenderer::new()),
//!     Arc::new(FfmpegEncoder::new()),
//!     Arc::new(MemoryJobStore::new()),
//!     PipelineConfig::new("./work"),
//! );
//!
//! let job_id = orchestrator.create_ingest(request).await?;
//! let record = orchestrator.wait(&job_id).await?;
//! ```

pub mod coord;
pub mod encode;
pub mod fetch;
pub mod job;
pub mod limiter;
pub mod logging;
pub mod orchestrator;
pub mod pipeline;
pub mod provider;
pub mod render;
pub mod stage;

/// Version of the Terralapse library and CLI.
///
/// Synchronized across all components in the workspace; defined in
/// `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
