//! External capture process management.
//!
//! Recording is done by an ffmpeg child process mixing two fixed dshow
//! inputs (microphone + virtual-cable loopback) into one WAV file. This
//! module owns the launch/terminate contract; it never looks inside the
//! audio, only at the child process.

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

/// Device identifiers match the OS audio-device naming and are fixed,
/// not discovered at runtime.
pub const MIC_INPUT: &str = "audio=Microphone (USB PnP Sound Device)";
pub const SYSTEM_AUDIO_INPUT: &str = "audio=CABLE Output (VB-Audio Virtual Cable)";

/// How long to wait after spawn before declaring the launch good. ffmpeg
/// exits almost immediately on a bad device name, so a short probe catches
/// most configuration errors.
const SPAWN_PROBE: Duration = Duration::from_millis(250);

const EXIT_POLL: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub enum CaptureError {
    LaunchFailed(String),
}

impl std::fmt::Display for CaptureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureError::LaunchFailed(e) => write!(f, "failed to launch capture process: {}", e),
        }
    }
}

impl std::error::Error for CaptureError {}

/// How the capture process went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Exited on its own within the grace window.
    Exited,
    /// Had to be force-killed after the grace window elapsed.
    Killed,
}

/// A running capture child process and the file it is writing.
pub struct CaptureProcess {
    child: Child,
    output_path: PathBuf,
}

impl CaptureProcess {
    /// Launch ffmpeg mixing the two fixed inputs into `output_path`,
    /// overwriting any existing file there.
    pub fn launch(output_path: &Path) -> Result<Self, CaptureError> {
        let mut cmd = Command::new("ffmpeg");
        cmd.args([
            "-f",
            "dshow",
            "-i",
            MIC_INPUT,
            "-f",
            "dshow",
            "-i",
            SYSTEM_AUDIO_INPUT,
            "-filter_complex",
            "amix=inputs=2:duration=longest",
            "-y",
        ])
        .arg(output_path);

        Self::spawn(cmd, output_path)
    }

    pub(crate) fn spawn(mut cmd: Command, output_path: &Path) -> Result<Self, CaptureError> {
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| CaptureError::LaunchFailed(e.to_string()))?;

        // Drain stderr on its own thread so the pipe buffer never fills up
        // and blocks the encoder.
        if let Some(stderr) = child.stderr.take() {
            std::thread::Builder::new()
                .name("capture-stderr".into())
                .spawn(move || {
                    let reader = BufReader::new(stderr);
                    for line in reader.lines() {
                        match line {
                            Ok(l) if l.is_empty() => {}
                            Ok(l) => log::warn!("[capture] {}", l),
                            Err(_) => break,
                        }
                    }
                    log::debug!("capture stderr stream ended");
                })
                .ok();
        }

        // Give the encoder a moment to fail on a bad device before
        // declaring success.
        std::thread::sleep(SPAWN_PROBE);
        match child.try_wait() {
            Ok(Some(status)) => {
                return Err(CaptureError::LaunchFailed(format!(
                    "capture process exited immediately with {}",
                    status
                )));
            }
            Ok(None) => {} // still running - good
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(CaptureError::LaunchFailed(format!(
                    "cannot check capture process status: {}",
                    e
                )));
            }
        }

        log::info!(
            "Capture started (pid={}) -> {}",
            child.id(),
            output_path.display()
        );

        Ok(Self {
            child,
            output_path: output_path.to_path_buf(),
        })
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    /// Ask the process to stop and wait up to `grace` for it to exit, then
    /// force-kill. Always waits for the exit, so the output file is fully
    /// flushed (or abandoned) by the time this returns.
    pub fn terminate(mut self, grace: Duration) -> Termination {
        // ffmpeg finalizes the container when it reads 'q' on stdin.
        if let Some(stdin) = self.child.stdin.as_mut() {
            let _ = stdin.write_all(b"q\n");
            let _ = stdin.flush();
        }

        let deadline = Instant::now() + grace;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    log::info!("Capture process exited with {}", status);
                    return Termination::Exited;
                }
                Ok(None) => {
                    if Instant::now() >= deadline {
                        break;
                    }
                    std::thread::sleep(EXIT_POLL);
                }
                Err(e) => {
                    log::warn!("Cannot check capture process status: {}", e);
                    break;
                }
            }
        }

        log::warn!("Capture process did not exit within {:?}, killing", grace);
        let _ = self.child.kill();
        let _ = self.child.wait();
        Termination::Killed
    }
}
