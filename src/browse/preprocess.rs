// Browse preprocess thread
//
// Reads the ring independently of the archive path and converts each frame
// for the browse encoder. When it falls a full ring behind it does not
// truncate anything. It enters recovery skip instead, substituting black
// frames for a stretch so it can catch up without reading slots the
// producer may be overwriting. The browse frame count stays aligned with
// the archive because every ring frame yields exactly one browse frame.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::convert::{black_yuv420, downmix_pair, silent_pair, uyvy_to_yuv420};
use super::handoff::{BrowseFrame, Handoff, HandoffSender};
use super::tclog::TimecodeLog;
use crate::capture::{CancelToken, FrameRing, PipelinePositions, Timecode};
use crate::recording::events::SessionEvent;
use crate::recording::session::{RecordingSession, StopPoint};

#[derive(Debug, Clone)]
pub(crate) struct PreprocessSettings {
    /// Black frames substituted after an overflow, capped at ring capacity
    pub overflow_frames: u64,
    pub wait_timeout: Duration,
}

pub(crate) struct Preprocessor {
    ring: Arc<FrameRing>,
    positions: Arc<PipelinePositions>,
    session: Arc<RecordingSession>,
    tclog: Option<TimecodeLog>,
    skip_frames: u64,
    wait_timeout: Duration,
    next: u64,
    skip_remaining: u64,
    produced: u64,
    control_start: Timecode,
}

#[derive(Debug)]
pub(crate) enum Step {
    Frame(BrowseFrame),
    /// Nothing new captured yet, the value is the captured count seen
    Idle(u64),
    Finished,
}

impl Preprocessor {
    pub fn new(
        ring: Arc<FrameRing>,
        positions: Arc<PipelinePositions>,
        session: Arc<RecordingSession>,
        tclog: Option<TimecodeLog>,
        settings: &PreprocessSettings,
    ) -> Self {
        let skip_frames = settings.overflow_frames.min(ring.capacity() as u64);
        let rate = ring.format().frame_rate;
        let next = session.first_frame();
        Self {
            ring,
            positions,
            session,
            tclog,
            skip_frames,
            wait_timeout: settings.wait_timeout,
            next,
            skip_remaining: 0,
            produced: 0,
            control_start: Timecode::from_frames(0, rate),
        }
    }

    pub fn step(&mut self) -> Step {
        if self.session.is_aborted() {
            return Step::Finished;
        }
        let stop = self.session.stop_point();
        if stop.reached(self.next) {
            // An archive overflow can pull the stop point behind frames
            // already sent to the encoder
            if let StopPoint::Until(end) = stop {
                if self.next > end && self.session.archive_overflows() > 0 {
                    self.session.events.record(SessionEvent::BrowseBeyondArchive {
                        frames: self.next - end,
                    });
                }
            }
            return Step::Finished;
        }

        let captured = self.positions.captured.get();
        if self.next >= captured {
            return Step::Idle(captured);
        }

        if self.skip_remaining == 0 && self.ring.is_overflowed(captured, self.next) {
            self.skip_remaining = self.skip_frames;
            let position = self.next - self.session.first_frame();
            log::warn!(
                "Browse fell {} frames behind capture at frame {}, substituting {} black frames",
                captured - self.next,
                position,
                self.skip_frames
            );
            self.session.add_browse_overflow();
            self.session.events.record(SessionEvent::BrowseOverflow {
                frame: position,
                substituted: self.skip_frames,
            });
        }

        let frame = if self.skip_remaining > 0 {
            self.skip_remaining -= 1;
            self.black_frame(None, None)
        } else {
            self.read_frame(captured)
        };

        let frame = BrowseFrame {
            control: self.control_start.offset(self.produced),
            ..frame
        };
        if let Some(log) = self.tclog.as_mut() {
            if let Err(e) = log.write(frame.control, frame.vitc, frame.ltc) {
                log::error!("Browse timecode log write failed, disabling it: {}", e);
                self.tclog = None;
            }
        }

        self.produced += 1;
        self.next += 1;
        self.positions.browse_processed.advance(self.next);
        self.session.add_browse_written();
        Step::Frame(frame)
    }

    fn read_frame(&self, captured: u64) -> BrowseFrame {
        let format = *self.ring.format();
        let mut video = Vec::new();
        let mut audio = Vec::new();

        // SAFETY: next < captured and not overflowed (checked by the caller).
        // The lag is re-checked below before the result is used.
        let slot = unsafe { self.ring.slot(self.next, captured) };
        // SAFETY: same frame, same contract
        let picture = unsafe { self.ring.analysis_video(self.next, captured) };
        uyvy_to_yuv420(picture, format.width, format.height, &mut video);
        match slot.audio.first() {
            Some(pair) => downmix_pair(pair, &mut audio),
            None => silent_pair(format.samples_per_frame, &mut audio),
        }
        let (vitc, ltc) = (slot.vitc, slot.ltc);

        if self.ring.is_overflowed(self.positions.captured.get(), self.next) {
            log::debug!("Browse frame {} overwritten during conversion, using black", self.next);
            return self.black_frame(vitc, ltc);
        }

        BrowseFrame {
            video,
            audio,
            vitc,
            ltc,
            control: self.control_start,
            black: false,
        }
    }

    fn black_frame(&self, vitc: Option<Timecode>, ltc: Option<Timecode>) -> BrowseFrame {
        let format = self.ring.format();
        let mut video = Vec::new();
        let mut audio = Vec::new();
        black_yuv420(format.width, format.height, &mut video);
        silent_pair(format.samples_per_frame, &mut audio);
        BrowseFrame {
            video,
            audio,
            vitc,
            ltc,
            control: self.control_start,
            black: true,
        }
    }

    fn finish(self) {
        if let Some(log) = self.tclog {
            match log.finish() {
                Ok(lines) => log::info!("Browse timecode log closed after {} lines", lines),
                Err(e) => log::error!("Failed to flush browse timecode log: {}", e),
            }
        }
    }
}

pub(crate) fn spawn(
    mut pre: Preprocessor,
    sender: HandoffSender,
    shutdown: CancelToken,
) -> std::io::Result<JoinHandle<()>> {
    let wait_timeout = pre.wait_timeout;
    std::thread::Builder::new()
        .name("ingest-browse-pre".into())
        .spawn(move || {
            log::info!("Browse preprocess thread started at frame {}", pre.next);
            let abort = pre.session.abort_token().clone();
            loop {
                if shutdown.is_cancelled() {
                    break;
                }
                match pre.step() {
                    Step::Frame(frame) => {
                        if !sender.send(Handoff::Frame(frame), wait_timeout, &[&shutdown, &abort]) {
                            log::warn!("Browse encoder stopped accepting frames");
                            break;
                        }
                    }
                    Step::Idle(captured) => {
                        pre.positions.captured.wait_for_progress(captured, wait_timeout);
                    }
                    Step::Finished => {
                        sender.send(Handoff::EndOfSequence, wait_timeout, &[&shutdown]);
                        break;
                    }
                }
            }
            log::info!("Browse preprocess thread finished after {} frames", pre.produced);
            pre.finish();
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{PixelFormat, VideoFormat};
    use crate::recording::events::EventLog;
    use crate::recording::session::{SessionKind, SessionPaths, SessionSinks};

    fn setup(capacity: usize, overflow_frames: u64) -> (Arc<FrameRing>, Arc<PipelinePositions>, Arc<RecordingSession>, Preprocessor) {
        let format = VideoFormat {
            width: 4,
            height: 2,
            pixel_format: PixelFormat::Uyvy8,
            frame_rate: 25,
            audio_pairs: 1,
            samples_per_frame: 2,
        };
        let ring = Arc::new(FrameRing::new(format, capacity));
        let positions = Arc::new(PipelinePositions::new());
        let session = Arc::new(RecordingSession::new(
            SessionKind::Single,
            SessionPaths::default(),
            0,
            SessionSinks::default(),
            EventLog::in_memory(),
        ));
        let settings = PreprocessSettings {
            overflow_frames,
            wait_timeout: Duration::from_millis(5),
        };
        let pre = Preprocessor::new(ring.clone(), positions.clone(), session.clone(), None, &settings);
        (ring, positions, session, pre)
    }

    /// Write frame `frame` with its number in the first luma sample and
    /// publish everything before it
    fn produce(ring: &FrameRing, positions: &PipelinePositions, frame: u64) {
        let captured = positions.captured.get();
        // SAFETY: the test is the only producer and the frame is unpublished
        let slot = unsafe { ring.slot_mut(frame, captured) };
        slot.video.fill(0x80);
        slot.video[1] = frame as u8;
        slot.vitc = Some(Timecode::from_frames(frame as u32, 25));
        positions.captured.advance(frame);
    }

    fn expect_frame(step: Step) -> BrowseFrame {
        match step {
            Step::Frame(f) => f,
            other => panic!("expected a frame, got {:?}", other),
        }
    }

    #[test]
    fn test_recovery_skip_after_overflow() {
        let (ring, positions, session, mut pre) = setup(10, 50);

        // Browse at 0 while capture has published 0..9: lag of capacity - 1
        for frame in 0..=9 {
            produce(&ring, &positions, frame);
        }
        assert_eq!(positions.captured.get(), 9);

        let mut controls = Vec::new();
        let mut blacks = 0;
        for _ in 0..9 {
            let f = expect_frame(pre.step());
            assert!(f.black);
            assert!(f.vitc.is_none());
            blacks += 1;
            controls.push(f.control.frames());
        }
        // Skip count is capped at capacity (10), but frame 9 isn't published
        assert!(matches!(pre.step(), Step::Idle(9)));

        produce(&ring, &positions, 10);
        let f = expect_frame(pre.step());
        assert!(f.black, "tenth substitution");
        blacks += 1;
        controls.push(f.control.frames());
        assert!(matches!(pre.step(), Step::Idle(10)));

        produce(&ring, &positions, 11);
        let f = expect_frame(pre.step());
        assert!(!f.black);
        assert_eq!(f.video[0], 10);
        assert_eq!(f.vitc, Some(Timecode::from_frames(10, 25)));
        controls.push(f.control.frames());

        // One control timecode per browse frame, no gaps across the skip
        assert_eq!(controls, (0..11).collect::<Vec<u32>>());
        assert_eq!(blacks, 50u64.min(ring.capacity() as u64));
        assert_eq!(session.browse_overflows(), 1);
        assert_eq!(
            session.events.count_matching(|e| matches!(e, SessionEvent::BrowseOverflow { .. })),
            1
        );
        assert_eq!(positions.browse_processed.get(), 11);
        assert_eq!(session.browse_frames_written(), 11);
    }

    #[test]
    fn test_default_skip_shorter_than_ring() {
        let (ring, positions, session, mut pre) = setup(125, 50);
        for frame in 0..=124 {
            produce(&ring, &positions, frame);
        }

        let blacks = (0..50).filter(|_| expect_frame(pre.step()).black).count();
        assert_eq!(blacks, 50);
        // Frame 50 is 74 behind, well inside the ring
        let f = expect_frame(pre.step());
        assert!(!f.black);
        assert_eq!(f.video[0], 50);
        assert_eq!(f.control.frames(), 50);
        assert_eq!(session.browse_overflows(), 1);
    }

    #[test]
    fn test_finishes_at_stop_point() {
        let (ring, positions, session, mut pre) = setup(10, 50);
        for frame in 0..5 {
            produce(&ring, &positions, frame);
        }
        session.request_stop(2);
        assert!(!expect_frame(pre.step()).black);
        assert!(!expect_frame(pre.step()).black);
        assert!(matches!(pre.step(), Step::Finished));
    }

    #[test]
    fn test_reports_frames_past_truncated_archive() {
        let (ring, positions, session, mut pre) = setup(10, 50);
        for frame in 0..6 {
            produce(&ring, &positions, frame);
        }
        for _ in 0..5 {
            assert!(!expect_frame(pre.step()).black);
        }

        // Archive overflowed with only 3 frames stored
        session.truncate_to(3);
        session.add_archive_overflow();
        assert!(matches!(pre.step(), Step::Finished));
        assert_eq!(session.browse_frames_written(), 5);

        let events = session.events.events();
        let last = &events.last().unwrap().event;
        assert_eq!(*last, SessionEvent::BrowseBeyondArchive { frames: 2 });
        assert!(last.is_error());
    }

    #[test]
    fn test_no_report_when_stop_lands_behind_browse() {
        let (ring, positions, session, mut pre) = setup(10, 50);
        for frame in 0..4 {
            produce(&ring, &positions, frame);
        }
        for _ in 0..3 {
            expect_frame(pre.step());
        }

        // A late stop request, not an archive truncation
        session.request_stop(2);
        assert!(matches!(pre.step(), Step::Finished));
        assert!(session.events.events().is_empty());
    }

    #[test]
    fn test_thread_sends_end_of_sequence() {
        let (ring, positions, session, pre) = setup(10, 50);
        for frame in 0..4 {
            produce(&ring, &positions, frame);
        }
        session.request_stop(3);

        let (tx, rx) = crate::browse::handoff::channel();
        let handle = spawn(pre, tx, CancelToken::new()).unwrap();

        let mut frames = 0;
        loop {
            match rx.recv(Duration::from_secs(5)) {
                Some(Handoff::Frame(_)) => frames += 1,
                Some(Handoff::EndOfSequence) => break,
                None => panic!("timed out"),
            }
        }
        handle.join().unwrap();
        assert_eq!(frames, 3);
    }
}
