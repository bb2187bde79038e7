// Recording session state shared by the controller and pipeline threads

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use super::events::{EventLog, EventSink, SessionEvent};
use crate::archive::report::TimecodePair;
use crate::archive::{ArchiveWriter, DropoutDetector, HazardAnalyzer};
use crate::capture::CancelToken;

/// Where the archive path stops. Frame numbers are ring frame numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "frame", rename_all = "snake_case")]
pub enum StopPoint {
    /// Recording until told otherwise
    Unset,
    /// Stop before the next frame
    Immediately,
    /// Frames before this one are recorded, this one is not
    Until(u64),
}

impl StopPoint {
    /// True once `next` should not be processed
    pub fn reached(&self, next: u64) -> bool {
        match self {
            StopPoint::Unset => false,
            StopPoint::Immediately => true,
            StopPoint::Until(end) => next >= *end,
        }
    }

    /// Move the stop point earlier, never later
    pub fn truncate_to(&mut self, end: u64) {
        *self = match *self {
            StopPoint::Immediately => StopPoint::Immediately,
            StopPoint::Until(current) => StopPoint::Until(current.min(end)),
            StopPoint::Unset => StopPoint::Until(end),
        };
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    /// One archive file plus browse copy and hazard analysis
    Single,
    /// Page-segmented archive only
    MultiItem,
}

/// Output locations for one session
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionPaths {
    pub archive: PathBuf,
    pub browse: Option<PathBuf>,
    pub browse_timecode: Option<PathBuf>,
    pub hazard_report: Option<PathBuf>,
    pub event: Option<PathBuf>,
}

/// Per-session collaborators driven by the archive store thread
#[derive(Default)]
pub struct SessionSinks {
    pub writer: Option<Box<dyn ArchiveWriter>>,
    pub hazard: Option<Box<dyn HazardAnalyzer>>,
    pub dropout: Option<Box<dyn DropoutDetector>>,
}

pub struct RecordingSession {
    pub id: Uuid,
    pub started_at: DateTime<Local>,
    pub kind: SessionKind,
    pub paths: SessionPaths,
    first_frame: u64,
    stop: Mutex<StopPoint>,
    ended_at: Mutex<Option<u64>>,
    abort: CancelToken,
    written: AtomicU64,
    browse_written: AtomicU64,
    archive_overflows: AtomicU64,
    browse_overflows: AtomicU64,
    write_failures: AtomicU64,
    timecodes: Mutex<Vec<TimecodePair>>,
    sinks: Mutex<SessionSinks>,
    pub events: EventLog,
}

impl RecordingSession {
    pub fn new(kind: SessionKind, paths: SessionPaths, first_frame: u64, sinks: SessionSinks, events: EventLog) -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Local::now(),
            kind,
            paths,
            first_frame,
            stop: Mutex::new(StopPoint::Unset),
            ended_at: Mutex::new(None),
            abort: CancelToken::new(),
            written: AtomicU64::new(0),
            browse_written: AtomicU64::new(0),
            archive_overflows: AtomicU64::new(0),
            browse_overflows: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
            timecodes: Mutex::new(Vec::new()),
            sinks: Mutex::new(sinks),
            events,
        }
    }

    pub fn first_frame(&self) -> u64 {
        self.first_frame
    }

    pub fn stop_point(&self) -> StopPoint {
        *self.stop.lock()
    }

    /// Set the stop point requested by a stop call. An earlier truncation
    /// (overflow, abort) stays in force.
    pub fn request_stop(&self, end: u64) -> StopPoint {
        let mut stop = self.stop.lock();
        stop.truncate_to(end);
        *stop
    }

    pub fn truncate_to(&self, end: u64) {
        self.stop.lock().truncate_to(end);
    }

    pub fn stop_immediately(&self) {
        *self.stop.lock() = StopPoint::Immediately;
    }

    /// Mark the archive path finished at `frame`. Only the first call counts.
    pub fn end(&self, frame: u64) {
        let mut ended = self.ended_at.lock();
        if ended.is_none() {
            *ended = Some(frame);
        }
    }

    pub fn ended_at(&self) -> Option<u64> {
        *self.ended_at.lock()
    }

    pub fn is_ended(&self) -> bool {
        self.ended_at.lock().is_some()
    }

    pub fn abort_token(&self) -> &CancelToken {
        &self.abort
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }

    pub fn sinks(&self) -> &Mutex<SessionSinks> {
        &self.sinks
    }

    pub fn take_sinks(&self) -> SessionSinks {
        std::mem::take(&mut *self.sinks.lock())
    }

    pub fn record_timecodes(&self, pair: TimecodePair) {
        self.timecodes.lock().push(pair);
    }

    pub fn timecodes(&self) -> Vec<TimecodePair> {
        self.timecodes.lock().clone()
    }

    pub fn frames_written(&self) -> u64 {
        self.written.load(Ordering::SeqCst)
    }

    pub(crate) fn add_written(&self) {
        self.written.fetch_add(1, Ordering::SeqCst);
    }

    pub fn browse_frames_written(&self) -> u64 {
        self.browse_written.load(Ordering::SeqCst)
    }

    pub(crate) fn add_browse_written(&self) {
        self.browse_written.fetch_add(1, Ordering::SeqCst);
    }

    pub fn archive_overflows(&self) -> u64 {
        self.archive_overflows.load(Ordering::SeqCst)
    }

    pub(crate) fn add_archive_overflow(&self) {
        self.archive_overflows.fetch_add(1, Ordering::SeqCst);
    }

    pub fn browse_overflows(&self) -> u64 {
        self.browse_overflows.load(Ordering::SeqCst)
    }

    pub(crate) fn add_browse_overflow(&self) {
        self.browse_overflows.fetch_add(1, Ordering::SeqCst);
    }

    pub fn write_failures(&self) -> u64 {
        self.write_failures.load(Ordering::SeqCst)
    }

    pub(crate) fn add_write_failure(&self) {
        self.write_failures.fetch_add(1, Ordering::SeqCst);
    }
}

/// Holder for the active session, if any
#[derive(Default)]
pub struct SessionSlot {
    current: Mutex<Option<Arc<RecordingSession>>>,
}

impl SessionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, session: Arc<RecordingSession>) {
        *self.current.lock() = Some(session);
    }

    pub fn current(&self) -> Option<Arc<RecordingSession>> {
        self.current.lock().clone()
    }

    pub fn clear(&self) -> Option<Arc<RecordingSession>> {
        self.current.lock().take()
    }
}

impl EventSink for SessionSlot {
    fn report(&self, event: SessionEvent) {
        match self.current() {
            Some(session) if !session.is_ended() => session.events.record(event),
            _ => log::info!("[capture] {} (no active session)", event),
        }
    }
}
