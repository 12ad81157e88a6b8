// External media processing step: turns the assembled raw stream into the final output.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::ProcessingError;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Create a `tokio::process::Command` that does not open a console window on Windows.
fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    #[allow(unused_mut)]
    let mut cmd = tokio::process::Command::new(program);
    #[cfg(windows)]
    {
        cmd.creation_flags(CREATE_NO_WINDOW);
    }
    cmd
}

/// Input and output of one processing run.
#[derive(Debug, Clone)]
pub struct ProcessOptions {
    /// Assembled raw stream
    pub input: PathBuf,
    pub output: PathBuf,
    /// Move the index to the front of MP4-family outputs
    pub faststart: bool,
    /// Leave `input` in place when done
    pub keep_input: bool,
}

impl ProcessOptions {
    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            faststart: true,
            keep_input: false,
        }
    }

    pub fn keep_input(mut self, keep: bool) -> Self {
        self.keep_input = keep;
        self
    }
}

#[async_trait]
pub trait MediaProcessor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn process(&self, options: &ProcessOptions) -> Result<(), ProcessingError>;
}

/// Stream-copy remux through `ffmpeg`.
#[derive(Debug, Clone)]
pub struct FfmpegRemuxer {
    ffmpeg_path: String,
}

impl Default for FfmpegRemuxer {
    fn default() -> Self {
        Self::new(std::env::var("FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string()))
    }
}

impl FfmpegRemuxer {
    pub fn new(ffmpeg_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
        }
    }

    pub fn ffmpeg_path(&self) -> &str {
        &self.ffmpeg_path
    }

    fn build_args(&self, options: &ProcessOptions) -> Vec<String> {
        let mut args = vec![
            "-y".to_string(),
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-i".to_string(),
            options.input.to_string_lossy().into_owned(),
            "-c".to_string(),
            "copy".to_string(),
        ];

        // `-movflags` only applies to MP4-family muxers; others reject it.
        let faststart_supported = matches!(
            extension(&options.output).as_deref(),
            Some("mp4" | "mov" | "m4v")
        );
        if options.faststart && faststart_supported {
            args.extend(["-movflags".to_string(), "+faststart".to_string()]);
        }

        args.push(options.output.to_string_lossy().into_owned());
        args
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(OsStr::to_str)
        .map(str::to_ascii_lowercase)
}

#[async_trait]
impl MediaProcessor for FfmpegRemuxer {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    async fn process(&self, options: &ProcessOptions) -> Result<(), ProcessingError> {
        let args = self.build_args(options);
        debug!("FFmpeg args: {:?}", args);

        let mut cmd = tokio_command(&self.ffmpeg_path);
        cmd.args(&args)
            .env("LC_ALL", "C")
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let output = cmd.output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ProcessingError::ToolMissing {
                    program: self.ffmpeg_path.clone(),
                }
            } else {
                ProcessingError::Spawn {
                    program: self.ffmpeg_path.clone(),
                    source: e,
                }
            }
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = stderr
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("Unknown ffmpeg error")
                .to_string();
            let code = output.status.code().unwrap_or(-1);
            warn!(code, %message, "ffmpeg failed");
            return Err(ProcessingError::Failed { code, message });
        }

        info!(output = %options.output.display(), "Remux completed");
        Ok(())
    }
}

/// Moves the assembled stream to the output path unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughProcessor;

#[async_trait]
impl MediaProcessor for PassthroughProcessor {
    fn name(&self) -> &'static str {
        "passthrough"
    }

    async fn process(&self, options: &ProcessOptions) -> Result<(), ProcessingError> {
        if options.keep_input {
            tokio::fs::copy(&options.input, &options.output).await?;
            return Ok(());
        }
        if tokio::fs::rename(&options.input, &options.output).await.is_err() {
            // rename fails across filesystems
            tokio::fs::copy(&options.input, &options.output).await?;
            tokio::fs::remove_file(&options.input).await?;
        }
        Ok(())
    }
}
