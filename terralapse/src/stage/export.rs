//! Export stage: encoding frames into the final artifact.

use super::{begin, finish};
use crate::encode::{
    EncodeOptions, FrameSequence, VideoEncoder, ZipEncoder, DEFAULT_FPS,
};
use crate::job::{
    ExportFormat, JobId, JobParams, JobStatus, JobStore, Quality, StoreError, UnitKey, UnitStatus,
};
use crate::pipeline::PipelineConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

/// Errors that abort an export run (encode failures do not).
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Encodes a completed frame job's output into a video or archive.
///
/// The encode is monolithic: it either produces the whole artifact or
/// the job fails and any partial output is discarded. Cancellation is
/// honored before the encode starts; an encode already underway runs to
/// its own completion or timeout.
pub struct ExportStage<E: VideoEncoder, S: JobStore> {
    video: Arc<E>,
    archive: ZipEncoder,
    store: Arc<S>,
    config: PipelineConfig,
}

impl<E: VideoEncoder, S: JobStore> ExportStage<E, S> {
    pub fn new(video: Arc<E>, store: Arc<S>, config: PipelineConfig) -> Self {
        Self {
            video,
            archive: ZipEncoder::new(),
            store,
            config,
        }
    }

    /// Runs the stage to a terminal status.
    #[instrument(skip(self, cancel), fields(job_id = %job_id))]
    pub async fn run(
        &self,
        job_id: &JobId,
        cancel: CancellationToken,
    ) -> Result<JobStatus, ExportError> {
        let Some(record) = begin(self.store.as_ref(), job_id).await? else {
            return Ok(JobStatus::Cancelled);
        };

        let JobParams::Export(params) = record.params.clone() else {
            let status = finish(
                self.store.as_ref(),
                job_id,
                JobStatus::Failed,
                Some("record is not an export job".to_string()),
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

        // Frame artifacts, in the contiguous order the frame stage wrote
        let paths: Vec<PathBuf> = source
            .units
            .iter()
            .filter(|u| {
                matches!(u.key, UnitKey::Frame { .. }) && u.status == UnitStatus::Completed
            })
            .filter_map(|u| u.artifact.as_ref().map(PathBuf::from))
            .collect();

        let Some(first) = paths.first() else {
            let status = finish(
                self.store.as_ref(),
                job_id,
                JobStatus::Failed,
                Some("source job has no frames".to_string()),
                None,
            )
            .await?;
            return Ok(status);
        };
        let frames = FrameSequence {
            dir: first.parent().map(PathBuf::from).unwrap_or_default(),
            pattern: "frame_%05d.png".to_string(),
            paths,
        };

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

        let options = EncodeOptions {
            format: params.format,
            fps: params.fps.unwrap_or(DEFAULT_FPS),
            quality: params.quality.unwrap_or(Quality::Medium),
            width: params.width,
        };
        let output = self
            .config
            .job_dir(job_id)
            .join("export")
            .join(format!("animation.{}", params.format.extension()));

        let encode = async {
            match params.format {
                ExportFormat::Zip => self.archive.encode(frames, output.clone(), options).await,
                _ => self.video.encode(frames, output.clone(), options).await,
            }
        };
        let outcome = match tokio::time::timeout(self.config.encode_timeout(), encode).await {
            Ok(Ok(path)) => Ok(path),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("encode timed out".to_string()),
        };

        let status = match outcome {
            Ok(path) => {
                let artifact = path.display().to_string();
                let unit_artifact = artifact.clone();
                self.store
                    .update(job_id, move |record| {
                        if let Some(unit) = record.unit_mut(&UnitKey::Encode) {
                            unit.status = UnitStatus::Completed;
                            unit.artifact = Some(unit_artifact);
                        }
                        record.recompute_progress();
                        Ok(())
                    })
                    .await?;
                finish(
                    self.store.as_ref(),
                    job_id,
                    JobStatus::Completed,
                    None,
                    Some(artifact),
                )
                .await?
            }
            Err(error) => {
                warn!(job_id = %job_id, error = %error, "encode failed");
                // Discard any partial output
                if let Err(e) = tokio::fs::remove_file(&output).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %output.display(), error = %e, "failed to remove partial output");
                    }
                }
                let unit_error = error.clone();
                self.store
                    .update(job_id, move |record| {
                        if let Some(unit) = record.unit_mut(&UnitKey::Encode) {
                            unit.status = UnitStatus::Failed;
                            unit.error = Some(unit_error);
                        }
                        record.recompute_progress();
                        Ok(())
                    })
                    .await?;
                finish(
                    self.store.as_ref(),
                    job_id,
                    JobStatus::Failed,
                    Some(error),
                    None,
                )
                .await?
            }
        };
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::EncodeError;
    use crate::job::{
        transition, ExportParams, FrameParams, JobRecord, MemoryJobStore, WorkUnit,
    };
    use std::sync::Mutex;

    /// Encoder that records its input and optionally fails.
    struct ScriptedEncoder {
        fail: bool,
        calls: Mutex<Vec<(usize, EncodeOptions)>>,
    }

    impl ScriptedEncoder {
        fn new(fail: bool) -> Self {
            Self {
                fail,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl VideoEncoder for ScriptedEncoder {
        async fn encode(
            &self,
            frames: FrameSequence,
            output: PathBuf,
            options: EncodeOptions,
        ) -> Result<PathBuf, EncodeError> {
            self.calls.lock().unwrap().push((frames.len(), options));
            if self.fail {
                Err(EncodeError::EncoderFailed {
                    program: "ffmpeg".to_string(),
                    status: "exit status: 1".to_string(),
                    stderr: "boom".to_string(),
                })
            } else {
                Ok(output)
            }
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    /// Builds a Completed frame job with `count` frame artifacts.
    async fn seed_source(store: &MemoryJobStore, dir: &std::path::Path, count: usize) -> JobId {
        let params = JobParams::FrameGeneration(FrameParams {
            source_job_id: JobId::from_string("job-ingest"),
            width: None,
        });
        let units = (0..count)
            .map(|i| {
                let date = chrono::NaiveDate::from_ymd_opt(2024, 1, 1 + i as u32).unwrap();
                let path = dir.join(format!("frame_{:05}.png", i));
                std::fs::write(&path, b"png").unwrap();
                let mut unit = WorkUnit::pending(UnitKey::Frame { date });
                unit.status = UnitStatus::Completed;
                unit.artifact = Some(path.display().to_string());
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

    async fn seed_export(
        store: &MemoryJobStore,
        source: JobId,
        format: ExportFormat,
    ) -> JobId {
        let params = JobParams::Export(ExportParams {
            source_job_id: source,
            format,
            fps: Some(12),
            quality: Some(Quality::High),
            width: None,
        });
        let record = JobRecord::new(params, vec![WorkUnit::pending(UnitKey::Encode)]);
        let id = record.id.clone();
        store.create(record).await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_successful_export_sets_output_ref() {
        let store = Arc::new(MemoryJobStore::new());
        let dir = tempfile::tempdir().unwrap();
        let source = seed_source(&store, dir.path(), 3).await;
        let job_id = seed_export(&store, source, ExportFormat::Mp4).await;

        let encoder = Arc::new(ScriptedEncoder::new(false));
        let stage = ExportStage::new(
            Arc::clone(&encoder),
            Arc::clone(&store),
            PipelineConfig::new(dir.path()),
        );
        let status = stage.run(&job_id, CancellationToken::new()).await.unwrap();
        assert_eq!(status, JobStatus::Completed);

        let calls = encoder.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, 3);
        assert_eq!(calls[0].1.fps, 12);

        let record = store.get(&job_id).await.unwrap().unwrap();
        assert!(record.output_ref.as_ref().unwrap().ends_with("animation.mp4"));
        assert_eq!(record.progress, 100);
        assert_eq!(record.units[0].status, UnitStatus::Completed);
    }

    #[tokio::test]
    async fn test_encode_failure_fails_job() {
        let store = Arc::new(MemoryJobStore::new());
        let dir = tempfile::tempdir().unwrap();
        let source = seed_source(&store, dir.path(), 2).await;
        let job_id = seed_export(&store, source, ExportFormat::Mp4).await;

        let stage = ExportStage::new(
            Arc::new(ScriptedEncoder::new(true)),
            Arc::clone(&store),
            PipelineConfig::new(dir.path()),
        );
        let status = stage.run(&job_id, CancellationToken::new()).await.unwrap();
        assert_eq!(status, JobStatus::Failed);

        let record = store.get(&job_id).await.unwrap().unwrap();
        assert!(record.error.as_ref().unwrap().contains("boom"));
        assert!(record.output_ref.is_none());
        assert_eq!(record.units[0].status, UnitStatus::Failed);
    }

    #[tokio::test]
    async fn test_zip_export_bypasses_video_encoder() {
        let store = Arc::new(MemoryJobStore::new());
        let dir = tempfile::tempdir().unwrap();
        let source = seed_source(&store, dir.path(), 2).await;
        let job_id = seed_export(&store, source, ExportFormat::Zip).await;

        let encoder = Arc::new(ScriptedEncoder::new(true));
        let stage = ExportStage::new(
            Arc::clone(&encoder),
            Arc::clone(&store),
            PipelineConfig::new(dir.path()),
        );
        let status = stage.run(&job_id, CancellationToken::new()).await.unwrap();
        assert_eq!(status, JobStatus::Completed);

        // Video encoder never invoked for archives
        assert!(encoder.calls.lock().unwrap().is_empty());

        let record = store.get(&job_id).await.unwrap().unwrap();
        let output = record.output_ref.unwrap();
        assert!(output.ends_with("animation.zip"));
        assert!(std::path::Path::new(&output).exists());
    }

    #[tokio::test]
    async fn test_source_with_no_frames_fails() {
        let store = Arc::new(MemoryJobStore::new());
        let dir = tempfile::tempdir().unwrap();
        let source = seed_source(&store, dir.path(), 0).await;
        let job_id = seed_export(&store, source, ExportFormat::Mp4).await;

        let stage = ExportStage::new(
            Arc::new(ScriptedEncoder::new(false)),
            Arc::clone(&store),
            PipelineConfig::new(dir.path()),
        );
        let status = stage.run(&job_id, CancellationToken::new()).await.unwrap();
        assert_eq!(status, JobStatus::Failed);

        let record = store.get(&job_id).await.unwrap().unwrap();
        assert!(record.error.as_ref().unwrap().contains("no frames"));
    }
}
