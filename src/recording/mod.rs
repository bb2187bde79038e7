// Recording control: sessions, the event log and the controller

pub mod controller;
pub mod events;
pub mod session;
pub mod stats;

pub use controller::{Collaborators, FrameDecoders, RecordError, Recorder, StartRequest, StopSummary};
pub use events::{EventLog, EventSink, LoggedEvent, SessionEvent};
pub use session::{RecordingSession, SessionKind, SessionPaths, StopPoint};
pub use stats::{GeneralStats, RecordStats};

use serde::{Deserialize, Serialize};

/// Current recording state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RecordingStatus {
    /// Ready to record
    Idle,
    /// Creating the session outputs
    Starting,
    /// Archiving frames
    Recording,
    /// Waiting for the archive path to reach the stop point
    Stopping,
    /// Tearing down a session without finalising it
    Aborting,
}

impl RecordingStatus {
    pub fn is_active(&self) -> bool {
        !matches!(self, RecordingStatus::Idle)
    }
}

impl Default for RecordingStatus {
    fn default() -> Self {
        Self::Idle
    }
}
