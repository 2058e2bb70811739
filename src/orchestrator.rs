//! Event loop wiring.
//!
//! Owns the state machine and dispatches effects to the runner. Callers
//! hold an `Orchestrator` handle to send commands and a status receiver
//! to observe lifecycle progress.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::effects::EffectRunner;
use crate::state_machine::{reduce, Effect, Event, State, StatusUpdate};

const EVENT_CHANNEL_CAPACITY: usize = 64;
const STATUS_CHANNEL_CAPACITY: usize = 64;

/// Handle to the running event loop.
#[derive(Clone)]
pub struct Orchestrator {
    tx: mpsc::Sender<Event>,
}

impl Orchestrator {
    /// Spawn the event loop. Returns the command handle, the status stream
    /// and the loop's join handle (resolves after `shutdown()`).
    pub fn spawn(
        effect_runner: Arc<dyn EffectRunner>,
    ) -> (Self, mpsc::Receiver<StatusUpdate>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel::<Event>(EVENT_CHANNEL_CAPACITY);
        let (status_tx, status_rx) = mpsc::channel::<StatusUpdate>(STATUS_CHANNEL_CAPACITY);

        let loop_tx = tx.clone();
        let handle =
            tokio::spawn(async move { run_event_loop(rx, loop_tx, status_tx, effect_runner).await });

        (Self { tx }, status_rx, handle)
    }

    pub async fn send(&self, event: Event) -> Result<(), mpsc::error::SendError<Event>> {
        self.tx.send(event).await
    }

    pub async fn start(&self) {
        if self.send(Event::StartRequested).await.is_err() {
            log::warn!("Event loop is gone, start request dropped");
        }
    }

    pub async fn stop(&self) {
        if self.send(Event::StopRequested).await.is_err() {
            log::warn!("Event loop is gone, stop request dropped");
        }
    }

    pub async fn shutdown(&self) {
        let _ = self.send(Event::Shutdown).await;
    }
}

/// Run the main event loop
async fn run_event_loop(
    mut rx: mpsc::Receiver<Event>,
    tx: mpsc::Sender<Event>,
    status_tx: mpsc::Sender<StatusUpdate>,
    effect_runner: Arc<dyn EffectRunner>,
) {
    let mut state = State::default();

    let _ = status_tx.send(StatusUpdate::Idle).await;
    log::info!("Event loop started");

    while let Some(event) = rx.recv().await {
        log::debug!("Received event: {:?}", event);

        // Handle Shutdown at the edge
        if matches!(event, Event::Shutdown) {
            log::info!("Shutdown requested, stopping event loop");
            break;
        }

        let old_discriminant = std::mem::discriminant(&state);
        let (next, effects) = reduce(&state, event);
        let new_discriminant = std::mem::discriminant(&next);

        if old_discriminant != new_discriminant {
            log::info!("State transition: {:?} -> {:?}", state, next);
        }

        state = next;

        for eff in effects {
            match eff {
                Effect::EmitStatus(update) => {
                    let _ = status_tx.send(update).await;
                }
                other => effect_runner.spawn(other, tx.clone(), status_tx.clone()),
            }
        }
    }

    log::info!("Event loop ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::StubEffectRunner;
    use std::time::Duration;

    async fn next_status(rx: &mut mpsc::Receiver<StatusUpdate>) -> StatusUpdate {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for status")
            .expect("status channel closed")
    }

    #[tokio::test]
    async fn full_cycle_through_stub_runner() {
        let runner = StubEffectRunner::new(5 * 1024 * 1024);
        let (orchestrator, mut status_rx, handle) = Orchestrator::spawn(runner);

        assert!(matches!(next_status(&mut status_rx).await, StatusUpdate::Idle));

        orchestrator.start().await;
        assert!(matches!(
            next_status(&mut status_rx).await,
            StatusUpdate::Starting
        ));
        assert!(matches!(
            next_status(&mut status_rx).await,
            StatusUpdate::Recording { .. }
        ));

        orchestrator.stop().await;
        assert!(matches!(
            next_status(&mut status_rx).await,
            StatusUpdate::Stopping
        ));
        assert!(matches!(
            next_status(&mut status_rx).await,
            StatusUpdate::Uploading { .. }
        ));
        assert!(matches!(
            next_status(&mut status_rx).await,
            StatusUpdate::Ready { .. }
        ));

        orchestrator.shutdown().await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn tiny_recording_is_discarded_not_processed() {
        // Stub reports a stop size right at the validity floor.
        let runner = StubEffectRunner::new(1024);
        let (orchestrator, mut status_rx, handle) = Orchestrator::spawn(runner);

        assert!(matches!(next_status(&mut status_rx).await, StatusUpdate::Idle));

        orchestrator.start().await;
        assert!(matches!(
            next_status(&mut status_rx).await,
            StatusUpdate::Starting
        ));
        assert!(matches!(
            next_status(&mut status_rx).await,
            StatusUpdate::Recording { .. }
        ));

        orchestrator.stop().await;
        assert!(matches!(
            next_status(&mut status_rx).await,
            StatusUpdate::Stopping
        ));
        assert!(matches!(
            next_status(&mut status_rx).await,
            StatusUpdate::DiscardedTooSmall {
                size_bytes: 1024,
                ..
            }
        ));

        orchestrator.shutdown().await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn second_start_while_recording_is_reported() {
        let runner = StubEffectRunner::new(2048);
        let (orchestrator, mut status_rx, handle) = Orchestrator::spawn(runner);

        assert!(matches!(next_status(&mut status_rx).await, StatusUpdate::Idle));

        orchestrator.start().await;
        assert!(matches!(
            next_status(&mut status_rx).await,
            StatusUpdate::Starting
        ));
        assert!(matches!(
            next_status(&mut status_rx).await,
            StatusUpdate::Recording { .. }
        ));

        orchestrator.start().await;
        assert!(matches!(
            next_status(&mut status_rx).await,
            StatusUpdate::AlreadyRecording
        ));

        orchestrator.shutdown().await;
        handle.await.unwrap();
    }
}
