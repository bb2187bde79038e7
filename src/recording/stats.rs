// Monitoring snapshots

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::Serialize;
use uuid::Uuid;

use super::session::{RecordingSession, SessionKind, StopPoint};
use super::RecordingStatus;
use crate::capture::CaptureStatus;

/// Recorder-wide state, available whether or not a session is running
#[derive(Debug, Clone, Serialize)]
pub struct GeneralStats {
    pub status: RecordingStatus,
    pub capture_initialised: bool,
    pub capture: CaptureStatus,
    pub captured: u64,
    pub archived: u64,
    pub browse_processed: u64,
    pub ring_capacity: usize,
    /// Frames between the archive path and capture while a session runs
    pub ring_fill: u64,
    /// A browse encode from this or an earlier session is still running
    pub browse_active: bool,
    /// Frames encoded by the latest browse run
    pub browse_frames_encoded: u64,
    /// Of those, black substitutes
    pub browse_black_frames: u64,
    /// The latest browse encoder failed and stopped encoding
    pub browse_failed: bool,
    /// Free space on the volume holding the last archive, when known
    pub disk_free_bytes: Option<u64>,
    pub process_memory_bytes: Option<u64>,
}

/// Counters for the active session, or the last one once it has finished
#[derive(Debug, Clone, Serialize)]
pub struct RecordStats {
    pub session_id: Uuid,
    pub kind: SessionKind,
    pub started_at: DateTime<Local>,
    pub archive_path: PathBuf,
    pub first_frame: u64,
    pub current_framecount: u64,
    pub browse_frames: u64,
    pub archive_overflows: u64,
    pub browse_overflows: u64,
    pub write_failures: u64,
    pub error_events: usize,
    pub stop_point: StopPoint,
    pub ended: bool,
}

impl RecordStats {
    pub fn from_session(session: &RecordingSession) -> Self {
        Self {
            session_id: session.id,
            kind: session.kind,
            started_at: session.started_at,
            archive_path: session.paths.archive.clone(),
            first_frame: session.first_frame(),
            current_framecount: session.frames_written(),
            browse_frames: session.browse_frames_written(),
            archive_overflows: session.archive_overflows(),
            browse_overflows: session.browse_overflows(),
            write_failures: session.write_failures(),
            error_events: session.events.error_count(),
            stop_point: session.stop_point(),
            ended: session.is_ended(),
        }
    }
}

/// Free space on the disk whose mount point is the longest prefix of `path`
pub fn disk_free_bytes(path: &Path) -> Option<u64> {
    let target = existing_ancestor(path)?;
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| target.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

/// Resident memory of this process
pub fn process_memory_bytes() -> Option<u64> {
    let pid = sysinfo::get_current_pid().ok()?;
    let mut sys = sysinfo::System::new();
    sys.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
    sys.process(pid).map(|p| p.memory())
}

/// The path itself or its nearest existing parent, made absolute
fn existing_ancestor(path: &Path) -> Option<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().ok()?.join(path)
    };
    absolute
        .ancestors()
        .find(|p| p.exists())
        .and_then(|p| p.canonicalize().ok())
}
