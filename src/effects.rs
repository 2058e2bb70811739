//! Effect runner.
//!
//! Executes the effects produced by the state machine: launching and
//! terminating the capture process and spawning post-processing pipelines.
//! Completion events are sent back into the event loop via the channel.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::capture::CaptureProcess;
use crate::convert::Convert;
use crate::delete::ForcedDeleter;
use crate::paths::RecordingNamer;
use crate::pipeline::{self, Recording};
use crate::state_machine::{Effect, Event, StatusUpdate};
use crate::upload::WebhookUploader;

/// How long a stopped capture process gets to finalize its output file
/// before being killed.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Trait for running effects asynchronously.
/// Completion events go back via `tx`; phase notifications via `status_tx`.
pub trait EffectRunner: Send + Sync + 'static {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>, status_tx: mpsc::Sender<StatusUpdate>);
}

/// Live capture processes keyed by recording id, plus the ids whose stop
/// arrived before their launch completed. Both sides live under one lock so
/// a stop and a finishing launch cannot miss each other: whichever runs
/// second sees what the first left behind.
#[derive(Default)]
struct CaptureRegistry {
    active: HashMap<Uuid, CaptureProcess>,
    stopped_early: HashSet<Uuid>,
}

impl CaptureRegistry {
    /// Called on stop. `None` means the launch has not completed yet; the
    /// id is remembered so the process is terminated when it shows up.
    fn take(&mut self, id: Uuid) -> Option<CaptureProcess> {
        let process = self.active.remove(&id);
        if process.is_none() {
            self.stopped_early.insert(id);
        }
        process
    }

    /// Called when a launch completes. Hands the process back if its
    /// recording was already stopped; the caller must terminate it instead
    /// of letting it record forever.
    fn register(&mut self, id: Uuid, process: CaptureProcess) -> Option<CaptureProcess> {
        if self.stopped_early.remove(&id) {
            Some(process)
        } else {
            self.active.insert(id, process);
            None
        }
    }

    /// Called when a launch fails so a stop that raced it leaves no trace.
    fn forget(&mut self, id: Uuid) {
        self.stopped_early.remove(&id);
    }
}

/// Production effect runner: real ffmpeg capture, real webhook delivery.
pub struct RecorderEffectRunner {
    watch_folder: PathBuf,
    namer: Arc<Mutex<RecordingNamer>>,
    captures: Arc<Mutex<CaptureRegistry>>,
    converter: Option<Arc<dyn Convert>>,
    uploader: Arc<WebhookUploader>,
    deleter: Arc<ForcedDeleter>,
}

impl RecorderEffectRunner {
    pub fn new(
        watch_folder: PathBuf,
        converter: Option<Arc<dyn Convert>>,
        uploader: Arc<WebhookUploader>,
        deleter: Arc<ForcedDeleter>,
    ) -> Arc<Self> {
        Arc::new(Self {
            namer: Arc::new(Mutex::new(RecordingNamer::new(watch_folder.clone()))),
            watch_folder,
            captures: Arc::new(Mutex::new(CaptureRegistry::default())),
            converter,
            uploader,
            deleter,
        })
    }
}

impl EffectRunner for RecorderEffectRunner {
    fn spawn(
        &self,
        effect: Effect,
        tx: mpsc::Sender<Event>,
        status_tx: mpsc::Sender<StatusUpdate>,
    ) {
        match effect {
            Effect::LaunchCapture { id } => {
                let watch_folder = self.watch_folder.clone();
                let captures = self.captures.clone();
                let namer = self.namer.clone();

                tokio::spawn(async move {
                    // The machine allows at most one active capture, so the
                    // namer sees launches strictly in order.
                    let output_path = {
                        let mut namer = namer.lock().await;
                        namer.next()
                    };

                    if let Err(e) = tokio::fs::create_dir_all(&watch_folder).await {
                        let err = format!(
                            "cannot create recording folder {}: {}",
                            watch_folder.display(),
                            e
                        );
                        log::error!("{}", err);
                        captures.lock().await.forget(id);
                        let _ = tx.send(Event::CaptureStartFailed { id, err }).await;
                        return;
                    }

                    // Launch blocks on the spawn probe, so keep it off the
                    // async runtime.
                    let path_for_launch = output_path.clone();
                    let launched = tokio::task::spawn_blocking(move || {
                        CaptureProcess::launch(&path_for_launch)
                    })
                    .await;

                    match launched {
                        Ok(Ok(process)) => {
                            let stopped_early = {
                                let mut registry = captures.lock().await;
                                registry.register(id, process)
                            };
                            if let Some(process) = stopped_early {
                                log::warn!(
                                    "Capture {} was stopped while launching, terminating",
                                    id
                                );
                                let _ = tokio::task::spawn_blocking(move || {
                                    process.terminate(STOP_GRACE)
                                })
                                .await;
                                return;
                            }
                            let _ = tx
                                .send(Event::CaptureStarted {
                                    id,
                                    path: output_path,
                                })
                                .await;
                        }
                        Ok(Err(e)) => {
                            log::error!("Capture launch failed: {}", e);
                            captures.lock().await.forget(id);
                            let _ = tx
                                .send(Event::CaptureStartFailed {
                                    id,
                                    err: e.to_string(),
                                })
                                .await;
                        }
                        Err(e) => {
                            log::error!("Capture launch task failed: {}", e);
                            captures.lock().await.forget(id);
                            let _ = tx
                                .send(Event::CaptureStartFailed {
                                    id,
                                    err: e.to_string(),
                                })
                                .await;
                        }
                    }
                });
            }

            Effect::TerminateCapture { id } => {
                let captures = self.captures.clone();

                tokio::spawn(async move {
                    let process = {
                        let mut registry = captures.lock().await;
                        registry.take(id)
                    };

                    let Some(process) = process else {
                        log::warn!(
                            "TerminateCapture: capture {} still launching, will terminate on arrival",
                            id
                        );
                        let _ = tx.send(Event::CaptureStopped { id, size_bytes: 0 }).await;
                        return;
                    };

                    // terminate() blocks until the child exits, so the
                    // file is fully flushed before we measure it.
                    let path = process.output_path().to_path_buf();
                    let termination =
                        tokio::task::spawn_blocking(move || process.terminate(STOP_GRACE)).await;

                    match termination {
                        Ok(t) => log::info!("Capture {} stopped ({:?})", id, t),
                        Err(e) => log::error!("Capture stop task failed: {}", e),
                    }

                    let size_bytes = match tokio::fs::metadata(&path).await {
                        Ok(m) => m.len(),
                        Err(e) => {
                            log::warn!("No output file at {}: {}", path.display(), e);
                            0
                        }
                    };

                    let _ = tx.send(Event::CaptureStopped { id, size_bytes }).await;
                });
            }

            Effect::SpawnPipeline {
                id,
                path,
                size_bytes,
            } => {
                let converter = self.converter.clone();
                let uploader = self.uploader.clone();
                let deleter = self.deleter.clone();

                tokio::spawn(async move {
                    let recording = Recording::new(id, path, size_bytes);
                    let recording =
                        pipeline::run(recording, converter, uploader, deleter, status_tx).await;
                    let _ = tx
                        .send(Event::PipelineFinished {
                            id,
                            outcome: recording.outcome(),
                        })
                        .await;
                });
            }

            Effect::EmitStatus(_) => {
                // Handled in the event loop, not here
                unreachable!("EmitStatus should be handled in run_event_loop");
            }
        }
    }
}

/// Stub effect runner for exercising the event loop without ffmpeg or a
/// webhook endpoint.
#[allow(dead_code)]
pub struct StubEffectRunner {
    /// Size reported for every stopped capture.
    pub stop_size: u64,
}

#[allow(dead_code)]
impl StubEffectRunner {
    pub fn new(stop_size: u64) -> Arc<Self> {
        Arc::new(Self { stop_size })
    }
}

impl EffectRunner for StubEffectRunner {
    fn spawn(
        &self,
        effect: Effect,
        tx: mpsc::Sender<Event>,
        status_tx: mpsc::Sender<StatusUpdate>,
    ) {
        match effect {
            Effect::LaunchCapture { id } => {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    let path = PathBuf::from(format!("/tmp/recording_stub_{}.wav", id));
                    let _ = tx.send(Event::CaptureStarted { id, path }).await;
                });
            }

            Effect::TerminateCapture { id } => {
                let size_bytes = self.stop_size;
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    let _ = tx.send(Event::CaptureStopped { id, size_bytes }).await;
                });
            }

            Effect::SpawnPipeline { id, path, .. } => {
                tokio::spawn(async move {
                    let _ = status_tx
                        .send(StatusUpdate::Uploading { file: path.clone() })
                        .await;
                    let _ = status_tx.send(StatusUpdate::Ready { file: path }).await;
                    let _ = tx
                        .send(Event::PipelineFinished {
                            id,
                            outcome: crate::state_machine::PipelineOutcome::Delivered,
                        })
                        .await;
                });
            }

            Effect::EmitStatus(_) => {
                unreachable!("EmitStatus should be handled in run_event_loop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::Termination;
    use std::path::Path;
    use std::process::Command;

    #[cfg(unix)]
    fn long_running_capture(dir: &Path) -> CaptureProcess {
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        CaptureProcess::spawn(cmd, &dir.join("out.wav")).unwrap()
    }

    #[cfg(unix)]
    #[test]
    fn stop_during_launch_hands_the_late_process_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = CaptureRegistry::default();
        let id = Uuid::new_v4();

        // The stop lands while the launch is still in flight.
        assert!(registry.take(id).is_none());

        // When the launch completes, the process must come back for
        // termination rather than be parked in the active map.
        let process = long_running_capture(dir.path());
        let late = registry
            .register(id, process)
            .expect("late process must be handed back");
        assert_eq!(late.terminate(Duration::from_millis(200)), Termination::Killed);

        assert!(registry.active.is_empty());
        assert!(registry.stopped_early.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn normal_order_keeps_the_process_until_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = CaptureRegistry::default();
        let id = Uuid::new_v4();

        let process = long_running_capture(dir.path());
        assert!(registry.register(id, process).is_none());

        let process = registry.take(id).expect("capture is active");
        assert_eq!(
            process.terminate(Duration::from_millis(200)),
            Termination::Killed
        );
        assert!(registry.stopped_early.is_empty());
    }

    #[test]
    fn failed_launch_clears_the_early_stop_marker() {
        let mut registry = CaptureRegistry::default();
        let id = Uuid::new_v4();

        assert!(registry.take(id).is_none());
        registry.forget(id);
        assert!(registry.stopped_early.is_empty());
    }
}
