// Session event log
//
// Every notable pipeline event during a session is logged through `log`,
// kept in memory for stats, and appended to the session's event file when
// one was requested. The capture thread records events too, so the file is
// written by a separate writer thread and `record` never touches the disk.

use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Local};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::Serialize;

/// How long `sync` waits for the writer thread
const SYNC_TIMEOUT: Duration = Duration::from_secs(5);

/// Something that happened during a recording session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionEvent {
    Started { first_frame: u64, multi_item: bool },
    StopRequested { end_frame: u64 },
    Ended { frames: u64 },
    Aborted { frames: u64 },
    ArchiveOverflow { frame: u64 },
    BrowseOverflow { frame: u64, substituted: u64 },
    DroppedFrame { frame: u64 },
    SignalLost { frame: u64 },
    SignalRecovered { frame: u64 },
    PullFailed { frame: u64, reason: String },
    WriteFailed { frame: u64 },
    StopTimedOut { frame: u64 },
    BrowseFailed { reason: String },
    BrowseBeyondArchive { frames: u64 },
    FinalizeFailed { reason: String },
}

impl SessionEvent {
    /// Errors as opposed to normal lifecycle events
    pub fn is_error(&self) -> bool {
        !matches!(
            self,
            SessionEvent::Started { .. }
                | SessionEvent::StopRequested { .. }
                | SessionEvent::Ended { .. }
                | SessionEvent::SignalRecovered { .. }
        )
    }
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEvent::Started { first_frame, multi_item } => write!(
                f,
                "session started at frame {}{}",
                first_frame,
                if *multi_item { " (multi-item)" } else { "" }
            ),
            SessionEvent::StopRequested { end_frame } => {
                write!(f, "stop requested, last frame {}", end_frame.saturating_sub(1))
            }
            SessionEvent::Ended { frames } => write!(f, "session ended after {} frames", frames),
            SessionEvent::Aborted { frames } => write!(f, "session aborted after {} frames", frames),
            SessionEvent::ArchiveOverflow { frame } => {
                write!(f, "archive overflow at frame {}, recording truncated", frame)
            }
            SessionEvent::BrowseOverflow { frame, substituted } => write!(
                f,
                "browse overflow at frame {}, substituting {} black frames",
                frame, substituted
            ),
            SessionEvent::DroppedFrame { frame } => write!(f, "dropped frame after frame {}", frame),
            SessionEvent::SignalLost { frame } => write!(f, "signal lost after frame {}", frame),
            SessionEvent::SignalRecovered { frame } => {
                write!(f, "signal recovered, resuming at frame {}", frame)
            }
            SessionEvent::PullFailed { frame, reason } => {
                write!(f, "frame pull failed after frame {}: {}", frame, reason)
            }
            SessionEvent::WriteFailed { frame } => write!(f, "archive write failed at frame {}", frame),
            SessionEvent::StopTimedOut { frame } => {
                write!(f, "stop timed out waiting for capture, stopping at frame {}", frame)
            }
            SessionEvent::BrowseFailed { reason } => write!(f, "browse copy failed: {}", reason),
            SessionEvent::BrowseBeyondArchive { frames } => write!(
                f,
                "browse copy holds {} frames beyond the truncated archive",
                frames
            ),
            SessionEvent::FinalizeFailed { reason } => write!(f, "finalisation failed: {}", reason),
        }
    }
}

/// Receives events from pipeline threads that don't own the session
pub trait EventSink: Send + Sync {
    fn report(&self, event: SessionEvent);
}

/// A timestamped event
#[derive(Debug, Clone, Serialize)]
pub struct LoggedEvent {
    pub at: DateTime<Local>,
    #[serde(flatten)]
    pub event: SessionEvent,
}

enum FileCommand {
    Line(String),
    /// Reply once every earlier line is on disk
    Sync(Sender<()>),
}

/// In-memory event history plus an optional event file
pub struct EventLog {
    events: Mutex<Vec<LoggedEvent>>,
    /// Feeds the writer thread. The thread exits when the log is dropped.
    file: Option<Sender<FileCommand>>,
}

impl EventLog {
    /// Log kept in memory only
    pub fn in_memory() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            file: None,
        }
    }

    /// Log that also appends to `path`
    pub fn create(path: &Path) -> anyhow::Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create event log {}", path.display()))?;
        let (tx, rx) = unbounded();
        std::thread::Builder::new()
            .name("ingest-events".into())
            .spawn(move || write_lines(BufWriter::new(file), rx))
            .context("Failed to spawn event log writer")?;
        Ok(Self {
            events: Mutex::new(Vec::new()),
            file: Some(tx),
        })
    }

    /// Block until everything recorded so far has been written
    pub fn sync(&self) {
        let Some(tx) = &self.file else {
            return;
        };
        let (reply, done) = bounded(1);
        if tx.send(FileCommand::Sync(reply)).is_ok() && done.recv_timeout(SYNC_TIMEOUT).is_err() {
            log::warn!("Event log writer did not sync within {:?}", SYNC_TIMEOUT);
        }
    }

    pub fn record(&self, event: SessionEvent) {
        if event.is_error() {
            log::warn!("[session] {}", event);
        } else {
            log::info!("[session] {}", event);
        }

        let logged = LoggedEvent { at: Local::now(), event };

        if let Some(tx) = &self.file {
            let line = format!("{} {}", logged.at.format("%Y-%m-%d %H:%M:%S%.3f"), logged.event);
            if tx.send(FileCommand::Line(line)).is_err() {
                log::warn!("Event log writer has stopped");
            }
        }

        self.events.lock().push(logged);
    }

    pub fn events(&self) -> Vec<LoggedEvent> {
        self.events.lock().clone()
    }

    pub fn error_count(&self) -> usize {
        self.events.lock().iter().filter(|e| e.event.is_error()).count()
    }

    pub fn count_matching(&self, predicate: impl Fn(&SessionEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| predicate(&e.event)).count()
    }
}

impl EventSink for EventLog {
    fn report(&self, event: SessionEvent) {
        self.record(event);
    }
}

fn write_lines(mut writer: BufWriter<File>, rx: Receiver<FileCommand>) {
    for command in rx {
        match command {
            FileCommand::Line(line) => {
                // A failing event file must not disturb the pipeline
                if let Err(e) = writeln!(writer, "{}", line).and_then(|_| writer.flush()) {
                    log::warn!("Failed to write event log: {}", e);
                }
            }
            FileCommand::Sync(reply) => {
                let _ = reply.send(());
            }
        }
    }
}
