//! Export encoding.
//!
//! Turns an ordered frame sequence into a deliverable artifact: an
//! H.264 MP4, a VP9 WebM, a palette-optimized GIF (all via an external
//! `ffmpeg` binary) or a plain zip archive of the frames. Encoding is
//! monolithic; a failure discards the partial output file.

use crate::job::{ExportFormat, Quality};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

/// An ordered, contiguous frame sequence on disk.
///
/// `pattern` is the printf-style filename pattern within `dir`
/// (e.g. `frame_%05d.png`) that `paths` conform to, in order.
#[derive(Debug, Clone)]
pub struct FrameSequence {
    pub dir: PathBuf,
    pub pattern: String,
    pub paths: Vec<PathBuf>,
}

impl FrameSequence {
    /// Number of frames in the sequence.
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    fn pattern_path(&self) -> PathBuf {
        self.dir.join(&self.pattern)
    }
}

/// Options for one encode.
#[derive(Debug, Clone, Copy)]
pub struct EncodeOptions {
    pub format: ExportFormat,
    pub fps: u32,
    pub quality: Quality,
    /// Optional output width; height follows the aspect ratio
    pub width: Option<u32>,
}

/// Default frames per second for video exports.
pub const DEFAULT_FPS: u32 = 10;

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            format: ExportFormat::Mp4,
            fps: DEFAULT_FPS,
            quality: Quality::Medium,
            width: None,
        }
    }
}

/// Maps a quality preset to an x264/vp9 CRF value.
fn crf(quality: Quality) -> &'static str {
    match quality {
        Quality::Low => "28",
        Quality::Medium => "23",
        Quality::High => "18",
    }
}

/// Errors from export encoding.
#[derive(Debug, Error)]
pub enum EncodeError {
    /// Sequence has no frames
    #[error("no frames to encode")]
    NoFrames,

    /// Encoder binary could not be launched
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    /// Encoder exited non-zero
    #[error("{program} exited with {status}: {stderr}")]
    EncoderFailed {
        program: String,
        status: String,
        stderr: String,
    },

    /// Archive write failure
    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    /// Filesystem failure
    #[error("encode I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Encode task aborted before finishing
    #[error("encode task failed: {0}")]
    Task(String),
}

/// Trait for export encoders.
pub trait VideoEncoder: Send + Sync + 'static {
    /// Encodes a frame sequence into `output`.
    ///
    /// Monolithic: there is no partial success. On error the caller
    /// discards any partial output file.
    fn encode(
        &self,
        frames: FrameSequence,
        output: PathBuf,
        options: EncodeOptions,
    ) -> impl Future<Output = Result<PathBuf, EncodeError>> + Send;

    /// Returns the encoder name for logging.
    fn name(&self) -> &str;
}

/// Encoder that shells out to `ffmpeg`.
#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    program: String,
}

impl Default for FfmpegEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FfmpegEncoder {
    /// Creates an encoder using `ffmpeg` from `PATH`.
    pub fn new() -> Self {
        Self {
            program: "ffmpeg".to_string(),
        }
    }

    /// Creates an encoder using an explicit binary path.
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Builds the ffmpeg argument list for a single-pass encode.
    ///
    /// GIF is handled separately (two passes, palette file).
    fn build_args(frames: &FrameSequence, output: &Path, options: &EncodeOptions) -> Vec<String> {
        let mut args = vec![
            "-y".to_string(),
            "-framerate".to_string(),
            options.fps.to_string(),
            "-i".to_string(),
            frames.pattern_path().display().to_string(),
        ];

        // Even dimensions are required by yuv420p; -2 keeps the aspect
        let scale = options
            .width
            .map(|w| format!("scale={}:-2", w))
            .unwrap_or_else(|| "scale=trunc(iw/2)*2:trunc(ih/2)*2".to_string());

        match options.format {
            ExportFormat::Mp4 => {
                args.extend([
                    "-vf".to_string(),
                    scale,
                    "-c:v".to_string(),
                    "libx264".to_string(),
                    "-pix_fmt".to_string(),
                    "yuv420p".to_string(),
                    "-crf".to_string(),
                    crf(options.quality).to_string(),
                    "-movflags".to_string(),
                    "+faststart".to_string(),
                ]);
            }
            ExportFormat::Webm => {
                args.extend([
                    "-vf".to_string(),
                    scale,
                    "-c:v".to_string(),
                    "libvpx-vp9".to_string(),
                    "-b:v".to_string(),
                    "0".to_string(),
                    "-crf".to_string(),
                    crf(options.quality).to_string(),
                ]);
            }
            ExportFormat::Gif | ExportFormat::Zip => {
                unreachable!("handled by dedicated paths");
            }
        }

        args.push(output.display().to_string());
        args
    }

    /// Builds the palette-generation pass arguments for GIF output.
    fn build_gif_palette_args(
        frames: &FrameSequence,
        palette: &Path,
        options: &EncodeOptions,
    ) -> Vec<String> {
        let width = options.width.unwrap_or(480);
        vec![
            "-y".to_string(),
            "-framerate".to_string(),
            options.fps.to_string(),
            "-i".to_string(),
            frames.pattern_path().display().to_string(),
            "-vf".to_string(),
            format!("fps={},scale={}:-1:flags=lanczos,palettegen", options.fps, width),
            palette.display().to_string(),
        ]
    }

    /// Builds the palette-application pass arguments for GIF output.
    fn build_gif_encode_args(
        frames: &FrameSequence,
        palette: &Path,
        output: &Path,
        options: &EncodeOptions,
    ) -> Vec<String> {
        let width = options.width.unwrap_or(480);
        vec![
            "-y".to_string(),
            "-framerate".to_string(),
            options.fps.to_string(),
            "-i".to_string(),
            frames.pattern_path().display().to_string(),
            "-i".to_string(),
            palette.display().to_string(),
            "-lavfi".to_string(),
            format!(
                "fps={},scale={}:-1:flags=lanczos[x];[x][1:v]paletteuse",
                options.fps, width
            ),
            output.display().to_string(),
        ]
    }

    /// Runs ffmpeg with the given arguments, capturing stderr.
    async fn run_ffmpeg(&self, args: &[String]) -> Result<(), EncodeError> {
        debug!(program = %self.program, ?args, "running encoder");
        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| EncodeError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // Keep the tail; ffmpeg banners bury the actual error
            let tail: String = stderr
                .lines()
                .rev()
                .take(5)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect::<Vec<_>>()
                .join("\n");
            return Err(EncodeError::EncoderFailed {
                program: self.program.clone(),
                status: output.status.to_string(),
                stderr: tail,
            });
        }
        Ok(())
    }
}

impl VideoEncoder for FfmpegEncoder {
    async fn encode(
        &self,
        frames: FrameSequence,
        output: PathBuf,
        options: EncodeOptions,
    ) -> Result<PathBuf, EncodeError> {
        if frames.is_empty() {
            return Err(EncodeError::NoFrames);
        }
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        match options.format {
            ExportFormat::Zip => {
                // Archive exports go through ZipEncoder
                return Err(EncodeError::Task(
                    "zip format is not a video encode".to_string(),
                ));
            }
            ExportFormat::Gif => {
                let palette = frames.dir.join("palette.png");
                let pass1 = Self::build_gif_palette_args(&frames, &palette, &options);
                let pass2 = Self::build_gif_encode_args(&frames, &palette, &output, &options);
                self.run_ffmpeg(&pass1).await?;
                let result = self.run_ffmpeg(&pass2).await;
                if let Err(e) = tokio::fs::remove_file(&palette).await {
                    warn!(error = %e, "failed to remove palette file");
                }
                result?;
            }
            _ => {
                let args = Self::build_args(&frames, &output, &options);
                self.run_ffmpeg(&args).await?;
            }
        }

        debug!(output = %output.display(), frames = frames.len(), "encode complete");
        Ok(output)
    }

    fn name(&self) -> &str {
        "ffmpeg"
    }
}

/// Encoder that packs frames into a zip archive instead of a video.
#[derive(Debug, Default, Clone)]
pub struct ZipEncoder;

impl ZipEncoder {
    pub fn new() -> Self {
        Self
    }

    /// Synchronous archive write; runs under `spawn_blocking`.
    fn write_archive(paths: &[PathBuf], output: &Path) -> Result<PathBuf, EncodeError> {
        let file = std::fs::File::create(output)?;
        let mut writer = zip::ZipWriter::new(file);
        let zip_options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);

        for path in paths {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| {
                    EncodeError::Task(format!("frame has no file name: {}", path.display()))
                })?;
            writer.start_file(name, zip_options)?;
            let bytes = std::fs::read(path)?;
            std::io::Write::write_all(&mut writer, &bytes)?;
        }
        writer.finish()?;
        Ok(output.to_path_buf())
    }
}

impl VideoEncoder for ZipEncoder {
    async fn encode(
        &self,
        frames: FrameSequence,
        output: PathBuf,
        _options: EncodeOptions,
    ) -> Result<PathBuf, EncodeError> {
        if frames.is_empty() {
            return Err(EncodeError::NoFrames);
        }
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let paths = frames.paths.clone();
        tokio::task::spawn_blocking(move || Self::write_archive(&paths, &output))
            .await
            .map_err(|e| EncodeError::Task(e.to_string()))?
    }

    fn name(&self) -> &str {
        "zip"
    }
}
