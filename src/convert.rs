//! Optional WAV-to-MP3 conversion before upload.
//!
//! Shells out to ffmpeg/libmp3lame synchronously with a bounded wait. The
//! source file is never touched here; deleting it after a successful
//! conversion is the pipeline's job.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

const EXIT_POLL: Duration = Duration::from_millis(100);

/// A transcoder that exits cleanly but writes a truncated file is still a
/// failure; the output must clear the same floor as a valid recording.
const MIN_OUTPUT_BYTES: u64 = 1024;

#[derive(Debug)]
pub enum ConvertError {
    /// Input is not a `.wav` file. Rejected before any process is spawned.
    NotWav(PathBuf),
    SourceMissing(PathBuf),
    TranscodeFailed(String),
    /// Zero exit status but the target is missing or truncated.
    OutputMissingOrSmall(PathBuf),
}

impl std::fmt::Display for ConvertError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConvertError::NotWav(p) => write!(f, "input file is not a WAV file: {}", p.display()),
            ConvertError::SourceMissing(p) => write!(f, "source file not found: {}", p.display()),
            ConvertError::TranscodeFailed(e) => write!(f, "conversion failed: {}", e),
            ConvertError::OutputMissingOrSmall(p) => {
                write!(f, "converted file is missing or too small: {}", p.display())
            }
        }
    }
}

impl std::error::Error for ConvertError {}

/// Seam for the pipeline; mocked in tests.
pub trait Convert: Send + Sync {
    /// Transcode `source` and return the path of the new artifact.
    fn convert(&self, source: &Path) -> Result<PathBuf, ConvertError>;
}

pub struct FfmpegConverter {
    program: String,
    bitrate: String,
    /// A stuck transcoder is killed after this long and reported as failed.
    wait: Duration,
}

impl FfmpegConverter {
    pub fn new(bitrate: impl Into<String>) -> Self {
        Self {
            program: "ffmpeg".to_string(),
            bitrate: bitrate.into(),
            wait: Duration::from_secs(60),
        }
    }

    #[cfg(test)]
    fn with_program(program: impl Into<String>, bitrate: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            bitrate: bitrate.into(),
            wait: Duration::from_secs(5),
        }
    }
}

impl Convert for FfmpegConverter {
    fn convert(&self, source: &Path) -> Result<PathBuf, ConvertError> {
        let is_wav = source
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("wav"))
            .unwrap_or(false);
        if !is_wav {
            return Err(ConvertError::NotWav(source.to_path_buf()));
        }
        if !source.exists() {
            return Err(ConvertError::SourceMissing(source.to_path_buf()));
        }

        let target = source.with_extension("mp3");

        let mut child = Command::new(&self.program)
            .arg("-y")
            .arg("-i")
            .arg(source)
            .args(["-codec:a", "libmp3lame", "-b:a", &self.bitrate])
            .arg(&target)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                ConvertError::TranscodeFailed(format!("failed to spawn {}: {}", self.program, e))
            })?;

        let stderr_thread = child.stderr.take().map(|mut stderr| {
            std::thread::spawn(move || {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf);
                buf
            })
        });

        let deadline = Instant::now() + self.wait;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(ConvertError::TranscodeFailed(format!(
                            "transcoder did not finish within {:?}",
                            self.wait
                        )));
                    }
                    std::thread::sleep(EXIT_POLL);
                }
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(ConvertError::TranscodeFailed(format!(
                        "cannot check transcoder status: {}",
                        e
                    )));
                }
            }
        };

        let stderr_tail = stderr_thread
            .and_then(|t| t.join().ok())
            .unwrap_or_default();

        if !status.success() {
            let last_line = stderr_tail.lines().rev().find(|l| !l.trim().is_empty());
            return Err(ConvertError::TranscodeFailed(format!(
                "transcoder exited with {}{}",
                status,
                last_line
                    .map(|l| format!(": {}", l.trim()))
                    .unwrap_or_default()
            )));
        }

        match std::fs::metadata(&target) {
            Ok(meta) if meta.len() > MIN_OUTPUT_BYTES => Ok(target),
            _ => Err(ConvertError::OutputMissingOrSmall(target)),
        }
    }
}
