// Archive store thread: drains the ring into the session's archive writer
//
// The `archived` counter doubles as this thread's read position. It is a
// count, so the next frame to archive is `archived` itself.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::ContentPackage;
use crate::capture::{CaptureShared, CancelToken, FrameRing, PipelinePositions};
use crate::recording::events::SessionEvent;
use crate::recording::session::{RecordingSession, SessionSlot};

pub(crate) struct StoreContext {
    pub ring: Arc<FrameRing>,
    pub positions: Arc<PipelinePositions>,
    pub shared: Arc<CaptureShared>,
    pub sessions: Arc<SessionSlot>,
    pub shutdown: CancelToken,
    pub wait_timeout: Duration,
    pub progress_log_interval: u64,
}

pub(crate) fn spawn(ctx: StoreContext) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("ingest-archive".into())
        .spawn(move || run(ctx))
}

/// What one pass of the store loop did
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum StoreStep {
    /// No session, or the session has already ended
    NoSession,
    /// The stop point was reached and the session ended here
    Ended(u64),
    /// Nothing new has been captured
    Waiting(u64),
    /// The ring overflowed and the session was truncated
    Overflow,
    /// A frame was handed to the writer
    Stored(u64),
}

fn run(ctx: StoreContext) {
    log::info!("Archive store thread started");
    let mut seen = ctx.positions.captured.get();

    while !ctx.shutdown.is_cancelled() {
        match step(&ctx) {
            StoreStep::Stored(_) | StoreStep::Overflow => {}
            StoreStep::Ended(frame) => {
                log::info!("Archive path reached session end at frame {}", frame);
                ctx.positions.archived.notify();
            }
            StoreStep::Waiting(captured) => {
                seen = ctx.positions.captured.wait_for_progress(captured, ctx.wait_timeout);
            }
            StoreStep::NoSession => {
                seen = ctx.positions.captured.wait_for_progress(seen, ctx.wait_timeout);
            }
        }
    }
    log::info!("Archive store thread finished");
}

/// One pass of the store loop
pub(crate) fn step(ctx: &StoreContext) -> StoreStep {
    let Some(session) = ctx.sessions.current() else {
        return StoreStep::NoSession;
    };
    if session.is_ended() {
        return StoreStep::NoSession;
    }

    let next = ctx.positions.archived.get();
    if session.stop_point().reached(next) {
        session.end(next);
        return StoreStep::Ended(next);
    }

    let captured = ctx.positions.captured.get();
    if next >= captured {
        return StoreStep::Waiting(captured);
    }

    if ctx.ring.is_overflowed(captured, next) {
        handle_overflow(ctx, &session, next, captured);
        return StoreStep::Overflow;
    }

    store_frame(ctx, &session, next, captured);
    ctx.positions.archived.advance(next + 1);

    // The producer may have lapped the slot while the writer held it
    let captured_now = ctx.positions.captured.get();
    if ctx.ring.is_overflowed(captured_now, next) {
        handle_overflow(ctx, &session, next + 1, captured_now);
        return StoreStep::Overflow;
    }

    let position = next - session.first_frame();
    if ctx.progress_log_interval > 0 && (position + 1) % ctx.progress_log_interval == 0 {
        log::debug!("Archived {} frames, {} behind capture", position + 1, captured_now - next - 1);
    }
    StoreStep::Stored(next)
}

fn store_frame(ctx: &StoreContext, session: &RecordingSession, next: u64, captured: u64) {
    let position = next - session.first_frame();

    // SAFETY: next < captured, and the overflow check above guarantees the
    // producer is at least one slot away. The post-write check catches a lap
    // that happens while we read.
    let slot = unsafe { ctx.ring.slot(next, captured) };
    // SAFETY: same frame, same contract
    let analysis = unsafe { ctx.ring.analysis_video(next, captured) };

    let package = ContentPackage {
        position,
        video: &slot.video,
        audio: &slot.audio,
        vitc: slot.vitc,
        ltc: slot.ltc,
    };

    let mut sinks = session.sinks().lock();
    if let Some(writer) = sinks.writer.as_mut() {
        if let Err(e) = writer.write_frame(&package) {
            log::error!("Archive write failed at frame {}: {}", position, e);
            if session.write_failures() == 0 {
                session.events.record(SessionEvent::WriteFailed { frame: position });
            }
            session.add_write_failure();
            ctx.shared.mark_recording_bad();
        }
    }
    if let Some(dropout) = sinks.dropout.as_mut() {
        dropout.process_frame(analysis, position);
    }
    if let Some(hazard) = sinks.hazard.as_mut() {
        if !hazard.analyse_frame(analysis) {
            log::warn!("Hazard analyser rejected frame {}", position);
        }
    }
    drop(sinks);

    session.record_timecodes((slot.vitc, slot.ltc));
    session.add_written();
}

/// Truncate the session at `archived` rather than archive frames the
/// producer may already be overwriting.
fn handle_overflow(ctx: &StoreContext, session: &RecordingSession, archived: u64, captured: u64) {
    log::error!(
        "Archive ring overflow: captured {} archived {} capacity {}",
        captured,
        archived,
        ctx.ring.capacity()
    );
    session.truncate_to(archived);
    session.add_archive_overflow();
    session.events.record(SessionEvent::ArchiveOverflow {
        frame: archived.saturating_sub(session.first_frame()),
    });
    ctx.shared.mark_recording_bad();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{ArchiveWriter, Completion};
    use crate::capture::{PixelFormat, VideoFormat};
    use crate::recording::events::EventLog;
    use crate::recording::session::{SessionKind, SessionPaths, SessionSinks, StopPoint};
    use crate::testing::MemoryArchive;

    fn context(capacity: usize) -> StoreContext {
        let format = VideoFormat {
            width: 4,
            height: 2,
            pixel_format: PixelFormat::Uyvy8,
            frame_rate: 25,
            audio_pairs: 1,
            samples_per_frame: 2,
        };
        StoreContext {
            ring: Arc::new(FrameRing::new(format, capacity)),
            positions: Arc::new(PipelinePositions::new()),
            shared: Arc::new(CaptureShared::new()),
            sessions: Arc::new(SessionSlot::new()),
            shutdown: CancelToken::new(),
            wait_timeout: Duration::from_millis(5),
            progress_log_interval: 0,
        }
    }

    fn produce(ctx: &StoreContext, frames: std::ops::Range<u64>) {
        for frame in frames {
            let captured = ctx.positions.captured.get();
            // SAFETY: the test is the only producer and the frame is unpublished
            let slot = unsafe { ctx.ring.slot_mut(frame, captured) };
            slot.video[0] = frame as u8;
            ctx.positions.captured.advance(frame);
        }
    }

    fn install(ctx: &StoreContext, archive: &MemoryArchive) -> Arc<RecordingSession> {
        let first = ctx.positions.captured.get();
        ctx.positions.archived.advance(first);
        let sinks = SessionSinks {
            writer: Some(archive.writer()),
            ..Default::default()
        };
        let session = Arc::new(RecordingSession::new(
            SessionKind::Single,
            SessionPaths::default(),
            first,
            sinks,
            EventLog::in_memory(),
        ));
        ctx.sessions.install(session.clone());
        session
    }

    #[test]
    fn test_stores_in_order_until_stop_point() {
        let ctx = context(10);
        let archive = MemoryArchive::new();
        produce(&ctx, 0..4);
        let session = install(&ctx, &archive);
        assert_eq!(session.first_frame(), 3);

        produce(&ctx, 4..9);
        session.request_stop(6);

        assert_eq!(step(&ctx), StoreStep::Stored(3));
        assert_eq!(step(&ctx), StoreStep::Stored(4));
        assert_eq!(step(&ctx), StoreStep::Stored(5));
        assert_eq!(step(&ctx), StoreStep::Ended(6));
        assert_eq!(step(&ctx), StoreStep::NoSession);

        assert_eq!(archive.frames_written(), 3);
        assert_eq!(archive.first_video_bytes(), vec![3, 4, 5]);
        assert_eq!(session.frames_written(), 3);
        assert_eq!(session.timecodes().len(), 3);
        assert_eq!(ctx.positions.archived.get(), 6);
    }

    #[test]
    fn test_waits_for_capture() {
        let ctx = context(10);
        let archive = MemoryArchive::new();
        produce(&ctx, 0..2);
        install(&ctx, &archive);
        // Frame 1 is written but not yet published
        assert_eq!(step(&ctx), StoreStep::Waiting(1));
    }

    #[test]
    fn test_overflow_truncates_session() {
        let ctx = context(10);
        let archive = MemoryArchive::new();
        produce(&ctx, 0..1);
        let session = install(&ctx, &archive);

        // Archive at 0, captured 9: one frame short of a full ring
        produce(&ctx, 1..10);
        assert_eq!(step(&ctx), StoreStep::Overflow);
        assert_eq!(session.stop_point(), StopPoint::Until(0));
        assert_eq!(session.archive_overflows(), 1);
        assert!(!ctx.shared.snapshot().recording_ok);

        assert_eq!(step(&ctx), StoreStep::Ended(0));
        assert_eq!(archive.frames_written(), 0);

        // Lag never reached capacity while the check was in force
        let lag = ctx.positions.captured.get() - ctx.positions.archived.get();
        assert!(lag < ctx.ring.capacity() as u64);
    }

    /// Publishes frames while the write is in progress, as a capture thread
    /// running on during a slow write would
    struct LappingWriter {
        positions: Arc<PipelinePositions>,
        lap_to: u64,
    }

    impl ArchiveWriter for LappingWriter {
        fn write_frame(&mut self, _package: &ContentPackage<'_>) -> crate::archive::Result<()> {
            self.positions.captured.advance(self.lap_to);
            Ok(())
        }

        fn complete(self: Box<Self>, _completion: &Completion<'_>) -> crate::archive::Result<()> {
            Ok(())
        }

        fn abort(self: Box<Self>) -> crate::archive::Result<()> {
            Ok(())
        }

        fn bytes_written(&self) -> u64 {
            0
        }
    }

    #[test]
    fn test_overflow_during_write_truncates_after_the_frame() {
        let ctx = context(10);
        produce(&ctx, 0..1);
        let sinks = SessionSinks {
            writer: Some(Box::new(LappingWriter {
                positions: ctx.positions.clone(),
                lap_to: 11,
            })),
            ..Default::default()
        };
        let session = Arc::new(RecordingSession::new(
            SessionKind::Single,
            SessionPaths::default(),
            0,
            sinks,
            EventLog::in_memory(),
        ));
        ctx.sessions.install(session.clone());
        ctx.shared.status.lock().recording_ok = true;

        produce(&ctx, 1..3);
        assert_eq!(step(&ctx), StoreStep::Overflow);

        // Frame 0 reached the writer before the lap was seen, so it counts
        assert_eq!(session.frames_written(), 1);
        assert_eq!(ctx.positions.archived.get(), 1);
        assert_eq!(session.stop_point(), StopPoint::Until(1));
        assert_eq!(session.archive_overflows(), 1);
        assert_eq!(
            session.events.count_matching(|e| *e == SessionEvent::ArchiveOverflow { frame: 1 }),
            1
        );
        assert!(!ctx.shared.snapshot().recording_ok);

        assert_eq!(step(&ctx), StoreStep::Ended(1));
        assert_eq!(session.ended_at(), Some(1));
    }

    #[test]
    fn test_thread_drains_and_ends() {
        let ctx = context(16);
        let archive = MemoryArchive::new();
        let positions = ctx.positions.clone();
        let sessions = ctx.sessions.clone();
        let shutdown = ctx.shutdown.clone();

        produce(&ctx, 0..1);
        let session = install(&ctx, &archive);
        session.request_stop(30);
        let ring = ctx.ring.clone();
        let handle = spawn(ctx).unwrap();

        for frame in 1..=40u64 {
            let captured = positions.captured.get();
            // SAFETY: this thread is the only producer
            unsafe { ring.slot_mut(frame, captured) }.video[0] = frame as u8;
            positions.captured.advance(frame);
            std::thread::sleep(Duration::from_millis(1));
        }
        positions.captured.notify();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !session.is_ended() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        shutdown.cancel();
        handle.join().unwrap();

        assert_eq!(session.ended_at(), Some(30));
        assert_eq!(archive.frames_written(), 30);
        assert!(sessions.current().is_some());
    }
}
