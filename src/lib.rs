//! Meeting recorder library.
//!
//! Captures meeting audio with an external ffmpeg process and delivers the
//! finished file to a webhook: record, optionally convert to MP3, upload
//! with JSON metadata, then force-delete the local copy. The lifecycle is
//! driven by a reducer-style state machine; side effects run through an
//! `EffectRunner` so the whole flow is testable without audio hardware.

pub mod capture;
pub mod config;
pub mod convert;
pub mod delete;
pub mod effects;
pub mod orchestrator;
pub mod paths;
pub mod pipeline;
pub mod sender;
pub mod state_machine;
pub mod upload;

pub use config::Config;
pub use orchestrator::Orchestrator;
pub use state_machine::{Event, RecordingState, StatusUpdate};
