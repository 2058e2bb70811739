//! Post-capture processing pipeline.
//!
//! One pipeline run owns one stopped recording and walks it through
//! convert (optional), upload and delete. The state machine has already
//! returned to Idle by the time this runs, so a new capture can start
//! while an older recording is still in flight here.

use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::convert::Convert;
use crate::delete::ForcedDeleter;
use crate::state_machine::{PipelineOutcome, RecordingState, StatusUpdate};
use crate::upload::{UploadMetadata, WebhookUploader};

/// One recording moving through the pipeline. Owned by value: no other
/// task can observe or mutate it mid-flight.
#[derive(Debug)]
pub struct Recording {
    pub id: Uuid,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub state: RecordingState,
}

impl Recording {
    pub fn new(id: Uuid, path: PathBuf, size_bytes: u64) -> Self {
        Self {
            id,
            path,
            size_bytes,
            state: RecordingState::Stopping,
        }
    }

    /// What the run ended as, for the event loop. Only `Done` counts as
    /// delivered.
    pub fn outcome(&self) -> PipelineOutcome {
        if self.state == RecordingState::Done {
            PipelineOutcome::Delivered
        } else {
            PipelineOutcome::Failed
        }
    }
}

/// Run a stopped recording to completion. Status updates are emitted on
/// every phase change; the recording comes back with its final state and
/// path for the caller to inspect.
pub async fn run(
    mut recording: Recording,
    converter: Option<Arc<dyn Convert>>,
    uploader: Arc<WebhookUploader>,
    deleter: Arc<ForcedDeleter>,
    status_tx: mpsc::Sender<StatusUpdate>,
) -> Recording {
    // Conversion is best-effort: a failed transcode falls back to
    // delivering the original WAV rather than losing the recording.
    if let Some(converter) = converter {
        recording.state = RecordingState::Converting;
        let _ = status_tx
            .send(StatusUpdate::Converting {
                file: recording.path.clone(),
            })
            .await;

        let source = recording.path.clone();
        let converted = tokio::task::spawn_blocking(move || converter.convert(&source)).await;

        match converted {
            Ok(Ok(mp3_path)) => {
                log::info!(
                    "Converted {} -> {}",
                    recording.path.display(),
                    mp3_path.display()
                );
                // The WAV is redundant once the MP3 exists.
                if !deleter.delete(&recording.path).await.is_deleted() {
                    log::warn!(
                        "Could not remove source after conversion: {}",
                        recording.path.display()
                    );
                }
                recording.path = mp3_path;
            }
            Ok(Err(e)) => {
                log::warn!("Conversion failed, uploading original: {}", e);
            }
            Err(e) => {
                log::warn!("Conversion task panicked, uploading original: {}", e);
            }
        }
    }

    recording.state = RecordingState::Uploading;
    let _ = status_tx
        .send(StatusUpdate::Uploading {
            file: recording.path.clone(),
        })
        .await;

    // Metadata is built fresh from the file at delivery time, never cached:
    // conversion may have changed the name and size.
    let metadata = match UploadMetadata::for_file(&recording.path) {
        Ok(metadata) => metadata,
        Err(e) => {
            recording.state = RecordingState::Failed;
            let message = format!(
                "cannot read recording {}: {}",
                recording.path.display(),
                e
            );
            log::error!("{}", message);
            let _ = status_tx.send(StatusUpdate::Failed { message }).await;
            return recording;
        }
    };

    if let Err(e) = uploader.upload(&recording.path, &metadata).await {
        // The file is retained for a later manual batch send.
        recording.state = RecordingState::Failed;
        let message = format!("upload failed, file retained: {}", e);
        log::error!("{}", message);
        let _ = status_tx.send(StatusUpdate::Failed { message }).await;
        return recording;
    }

    recording.state = RecordingState::Deleting;
    let _ = status_tx
        .send(StatusUpdate::Deleting {
            file: recording.path.clone(),
        })
        .await;

    if !deleter.delete(&recording.path).await.is_deleted() {
        // Delivery already succeeded; a leftover local file is a warning,
        // not a failed recording.
        log::warn!(
            "Delivered but could not delete local file: {}",
            recording.path.display()
        );
    }

    recording.state = RecordingState::Done;
    let _ = status_tx
        .send(StatusUpdate::Ready {
            file: recording.path.clone(),
        })
        .await;
    recording
}
