//! Recording lifecycle state machine.
//!
//! Single-writer pattern: all transitions go through `reduce()`, which
//! returns a new state and a list of effects to execute. The machine only
//! tracks the capture phase (Idle/Capturing/Stopping); once a stopped file
//! is accepted, the post-processing pipeline runs as its own effect and the
//! machine returns to Idle, so a new recording can start while the previous
//! one is still being converted or uploaded.

use serde::Serialize;
use std::path::PathBuf;
use uuid::Uuid;

/// Files at or below this size are discarded as invalid, not processed.
/// A WAV header alone is 44 bytes; anything this small has no audio.
pub const MIN_RECORDING_BYTES: u64 = 1024;

/// Lifecycle phase of one recording, as reported to observers. The machine
/// itself only occupies the first three; the rest advance inside the
/// post-processing pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingState {
    Idle,
    Capturing,
    Stopping,
    Converting,
    Uploading,
    Deleting,
    Done,
    Failed,
}

/// Authoritative state of the recorder. All transitions go through the
/// reducer.
#[derive(Debug, Clone)]
pub enum State {
    Idle,
    Capturing {
        recording_id: Uuid,
        /// Known once the capture process reports its output path.
        path: Option<PathBuf>,
    },
    Stopping {
        recording_id: Uuid,
        path: Option<PathBuf>,
    },
}

impl Default for State {
    fn default() -> Self {
        State::Idle
    }
}

/// How a recording's pipeline ended, carried back for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOutcome {
    Delivered,
    Failed,
}

/// Events that drive transitions: user commands, capture-process
/// completions and pipeline completions.
#[derive(Debug, Clone)]
pub enum Event {
    /// User asked to start recording.
    StartRequested,
    /// User asked to stop recording.
    StopRequested,

    // Capture events (include id to drop stale completions)
    CaptureStarted {
        id: Uuid,
        path: PathBuf,
    },
    CaptureStartFailed {
        id: Uuid,
        err: String,
    },
    CaptureStopped {
        id: Uuid,
        size_bytes: u64,
    },

    /// A post-processing pipeline finished (possibly for an old recording).
    PipelineFinished {
        id: Uuid,
        outcome: PipelineOutcome,
    },

    /// Application exit requested.
    Shutdown,
}

/// Status notifications sent to observers (CLI output, logs). Serialized
/// with a tag so a frontend can match on the variant.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StatusUpdate {
    Idle,
    Starting,
    AlreadyRecording,
    NotRecording,
    Recording { file: PathBuf },
    Stopping,
    DiscardedTooSmall { file: PathBuf, size_bytes: u64 },
    Converting { file: PathBuf },
    Uploading { file: PathBuf },
    Deleting { file: PathBuf },
    Ready { file: PathBuf },
    Failed { message: String },
}

/// Effects to be executed after a transition. The effect runner handles
/// these asynchronously.
#[derive(Debug, Clone)]
pub enum Effect {
    LaunchCapture {
        id: Uuid,
    },
    TerminateCapture {
        id: Uuid,
    },
    /// Hand a stopped, valid recording to the conversion/upload/delete
    /// pipeline. The machine is back to Idle once this is issued.
    SpawnPipeline {
        id: Uuid,
        path: PathBuf,
        size_bytes: u64,
    },
    EmitStatus(StatusUpdate),
}

/// Reducer function: (state, event) -> (next_state, effects)
///
/// Key rules:
/// - Never mutate state directly
/// - Ignore events with stale recording IDs
/// - Start/stop requests that don't apply report a status, never an error
pub fn reduce(state: &State, event: Event) -> (State, Vec<Effect>) {
    use Effect::*;
    use Event::*;
    use State::*;

    let current_id: Option<Uuid> = match state {
        Idle => None,
        Capturing { recording_id, .. } => Some(*recording_id),
        Stopping { recording_id, .. } => Some(*recording_id),
    };

    let is_stale = |eid: Uuid| Some(eid) != current_id;

    match (state, event) {
        // -----------------
        // Idle
        // -----------------
        (Idle, StartRequested) => {
            let id = Uuid::new_v4();
            (
                Capturing {
                    recording_id: id,
                    path: None,
                },
                vec![
                    LaunchCapture { id },
                    EmitStatus(StatusUpdate::Starting),
                ],
            )
        }
        (Idle, StopRequested) => (Idle, vec![EmitStatus(StatusUpdate::NotRecording)]),

        // -----------------
        // Capturing
        // -----------------
        (Capturing { recording_id, .. }, CaptureStarted { id, path }) if *recording_id == id => (
            Capturing {
                recording_id: *recording_id,
                path: Some(path.clone()),
            },
            vec![EmitStatus(StatusUpdate::Recording { file: path })],
        ),
        (Capturing { recording_id, .. }, CaptureStartFailed { id, err })
            if *recording_id == id =>
        {
            (Idle, vec![EmitStatus(StatusUpdate::Failed { message: err })])
        }
        (Capturing { .. }, StartRequested) => (
            state.clone(),
            vec![EmitStatus(StatusUpdate::AlreadyRecording)],
        ),
        (
            Capturing {
                recording_id, path, ..
            },
            StopRequested,
        ) => (
            Stopping {
                recording_id: *recording_id,
                path: path.clone(),
            },
            vec![
                TerminateCapture { id: *recording_id },
                EmitStatus(StatusUpdate::Stopping),
            ],
        ),
        // Capture died on its own (device unplugged, encoder crash). Treat
        // it like a stop: the file may still be worth delivering.
        (
            Capturing {
                recording_id, path, ..
            },
            CaptureStopped { id, size_bytes },
        ) if *recording_id == id => accept_stopped(*recording_id, path.clone(), size_bytes),

        // -----------------
        // Stopping
        // -----------------
        (
            Stopping {
                recording_id, path, ..
            },
            CaptureStopped { id, size_bytes },
        ) if *recording_id == id => accept_stopped(*recording_id, path.clone(), size_bytes),
        (Stopping { .. }, StartRequested) => (
            state.clone(),
            vec![EmitStatus(StatusUpdate::AlreadyRecording)],
        ),
        (Stopping { .. }, StopRequested) => {
            (state.clone(), vec![EmitStatus(StatusUpdate::Stopping)])
        }

        // -----------------
        // Pipeline completions: the machine already moved on, only log.
        // -----------------
        (_, PipelineFinished { id, outcome }) => {
            match outcome {
                PipelineOutcome::Delivered => {
                    log::info!("Recording {} delivered", id);
                }
                PipelineOutcome::Failed => {
                    log::warn!("Recording {} pipeline failed", id);
                }
            }
            (state.clone(), vec![])
        }

        // -----------------
        // Stale events (drop silently)
        // -----------------
        (_, CaptureStarted { id, .. }) if is_stale(id) => (state.clone(), vec![]),
        (_, CaptureStartFailed { id, .. }) if is_stale(id) => (state.clone(), vec![]),
        (_, CaptureStopped { id, .. }) if is_stale(id) => (state.clone(), vec![]),

        // -----------------
        // Unhandled: no transition
        // -----------------
        _ => (state.clone(), vec![]),
    }
}

/// A capture has stopped and its final size is known. Either discard a
/// too-small file or hand it to the pipeline; the machine returns to Idle
/// in both cases.
fn accept_stopped(id: Uuid, path: Option<PathBuf>, size_bytes: u64) -> (State, Vec<Effect>) {
    let Some(path) = path else {
        // Stopped before the capture process ever reported a path; there is
        // no file to process.
        log::warn!("Recording {} stopped without an output path", id);
        return (
            State::Idle,
            vec![Effect::EmitStatus(StatusUpdate::Failed {
                message: "recording stopped before capture started".to_string(),
            })],
        );
    };

    if size_bytes <= MIN_RECORDING_BYTES {
        log::warn!(
            "Discarding {}: {} bytes is below the validity floor",
            path.display(),
            size_bytes
        );
        return (
            State::Idle,
            vec![Effect::EmitStatus(StatusUpdate::DiscardedTooSmall {
                file: path,
                size_bytes,
            })],
        );
    }

    (
        State::Idle,
        vec![Effect::SpawnPipeline {
            id,
            path,
            size_bytes,
        }],
    )
}
