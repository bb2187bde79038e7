// Capture thread: pulls frames from the source into the ring
//
// The thread owns the source for the recorder's lifetime. It is either
// delivering, writing one frame per tick and publishing the one before it,
// or suspended, waiting for the signal to come back and for enough good
// frames in a row before delivering again.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::counters::{CancelToken, PipelinePositions};
use super::ring::FrameRing;
use super::timecode::{Extracted, Timecode, TimecodeExtractor};
use super::{CaptureError, CaptureShared, CaptureSource, DepthReducer, HardwareFrame, SignalStatus, VideoFormat};
use crate::recording::events::{EventSink, SessionEvent};

/// Tunables for the capture loop
#[derive(Debug, Clone)]
pub(crate) struct CaptureSettings {
    pub initial_good_frames: u32,
    pub post_error_good_frames: u32,
    pub signal_poll_interval: Duration,
    pub realtime_priority: bool,
    pub progress_log_interval: u64,
}

/// Everything the capture thread shares with the rest of the recorder
pub(crate) struct CaptureContext {
    pub ring: Arc<FrameRing>,
    pub positions: Arc<PipelinePositions>,
    pub shared: Arc<CaptureShared>,
    pub events: Arc<dyn EventSink>,
    pub shutdown: CancelToken,
    pub settings: CaptureSettings,
}

/// Per-frame collaborators owned by the capture thread
pub(crate) struct FrameProcessors {
    pub extractor: TimecodeExtractor,
    pub reducer: Option<Box<dyn DepthReducer>>,
}

enum TickOutcome {
    Stored { vitc: Option<Timecode>, ltc: Option<Timecode> },
    Dropped,
    Failed(CaptureError),
}

/// Why the loop stopped delivering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SuspendReason {
    Startup,
    SignalLost,
    Dropped,
    PullFailed,
    Forced,
}

pub(crate) fn spawn(
    source: Box<dyn CaptureSource>,
    processors: FrameProcessors,
    ctx: CaptureContext,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("ingest-capture".into())
        .spawn(move || CaptureLoop::new(source, processors, ctx).run())
}

struct CaptureLoop {
    source: Box<dyn CaptureSource>,
    processors: FrameProcessors,
    ctx: CaptureContext,
    format: VideoFormat,
    /// Frame number the next good frame is written as
    next: u64,
    /// The previous tick stored frame `next - 1`, so it may still be stamped
    previous_stored: bool,
    had_error: bool,
}

impl CaptureLoop {
    fn new(source: Box<dyn CaptureSource>, processors: FrameProcessors, ctx: CaptureContext) -> Self {
        let format = *ctx.ring.format();
        let next = ctx.positions.captured.get();
        Self {
            source,
            processors,
            ctx,
            format,
            next,
            previous_stored: false,
            had_error: false,
        }
    }

    fn run(mut self) {
        if self.ctx.settings.realtime_priority {
            super::priority::promote_current_thread();
        }
        log::info!("Capture thread started");

        let mut suspended = Some(SuspendReason::Startup);

        while !self.ctx.shutdown.is_cancelled() {
            if let Some(reason) = suspended {
                if self.recover(reason) {
                    suspended = None;
                }
                continue;
            }

            if self.ctx.shared.force_suspend.load(Ordering::SeqCst) {
                log::info!("Capture suspended on request at frame {}", self.next);
                suspended = Some(self.suspend(SuspendReason::Forced));
                continue;
            }

            let signal = self.source.signal_status();
            if !signal.video_ok {
                suspended = Some(self.suspend(SuspendReason::SignalLost));
                continue;
            }

            let outcome = match self.source.pull_next_frame() {
                Ok(frame) if frame.dropped => TickOutcome::Dropped,
                Ok(frame) => store_frame(
                    &self.ctx,
                    &mut self.processors,
                    &self.format,
                    self.next,
                    self.previous_stored,
                    &frame,
                ),
                Err(e) => TickOutcome::Failed(e),
            };

            match outcome {
                TickOutcome::Stored { vitc, ltc } => {
                    self.ctx.positions.captured.advance(self.next);
                    self.update_status(signal, vitc, ltc);
                    self.previous_stored = true;
                    self.next += 1;

                    let interval = self.ctx.settings.progress_log_interval;
                    if interval > 0 && self.next % interval == 0 {
                        log::debug!("Captured {} frames, VITC {:?}", self.next, vitc.map(|t| t.to_string()));
                    }
                }
                TickOutcome::Dropped => {
                    suspended = Some(self.suspend(SuspendReason::Dropped));
                }
                TickOutcome::Failed(e) => {
                    log::error!("Frame pull failed: {}", e);
                    self.ctx.events.report(SessionEvent::PullFailed {
                        frame: self.last_published(),
                        reason: e.to_string(),
                    });
                    suspended = Some(self.suspend(SuspendReason::PullFailed));
                }
            }
        }

        if let Err(e) = self.source.stop_input() {
            log::warn!("Failed to stop capture input: {}", e);
        }
        // Let consumers re-check their stop conditions
        self.ctx.positions.captured.notify();
        log::info!("Capture thread finished after {} frames", self.next);
    }

    fn last_published(&self) -> u64 {
        self.ctx.positions.captured.get()
    }

    /// Record why capture stopped delivering and update status
    fn suspend(&mut self, reason: SuspendReason) -> SuspendReason {
        let frame = self.last_published();
        {
            let mut status = self.ctx.shared.status.lock();
            status.suspended = true;
            match reason {
                SuspendReason::SignalLost => {
                    status.video_ok = false;
                    status.signal_losses += 1;
                }
                SuspendReason::Dropped => {
                    status.dropped_frames += 1;
                    status.recording_ok = false;
                }
                SuspendReason::PullFailed => {
                    status.video_ok = false;
                    status.pull_failures += 1;
                    status.recording_ok = false;
                }
                SuspendReason::Startup | SuspendReason::Forced => {}
            }
        }

        match reason {
            SuspendReason::SignalLost => {
                log::warn!("Video signal lost after frame {}, suspending capture", frame);
                self.ctx.events.report(SessionEvent::SignalLost { frame });
            }
            SuspendReason::Dropped => {
                log::warn!("Hardware dropped a frame after frame {}, suspending capture", frame);
                self.ctx.events.report(SessionEvent::DroppedFrame { frame });
                self.had_error = true;
            }
            SuspendReason::PullFailed => self.had_error = true,
            SuspendReason::Startup | SuspendReason::Forced => {}
        }

        self.previous_stored = false;
        reason
    }

    /// One recovery attempt. Returns true once capture may deliver again.
    fn recover(&mut self, reason: SuspendReason) -> bool {
        if !self.wait_for_signal() {
            return false;
        }

        self.restart_input();

        let required = if self.had_error {
            self.ctx.settings.post_error_good_frames
        } else {
            self.ctx.settings.initial_good_frames
        };
        if !self.wait_good_frames(required) {
            return false;
        }

        self.processors.extractor.reset();
        self.ctx.shared.status.lock().suspended = false;

        if reason == SuspendReason::Startup {
            log::info!("Capture delivering after {} good frames", required);
        } else {
            let frame = self.next;
            log::info!("Capture recovered from {:?} after {} good frames", reason, required);
            self.ctx.events.report(SessionEvent::SignalRecovered { frame });
        }
        true
    }

    /// Poll signal status until video is present and no forced suspend is
    /// pending. Returns false on shutdown.
    fn wait_for_signal(&mut self) -> bool {
        loop {
            if self.ctx.shutdown.is_cancelled() {
                return false;
            }
            let signal = self.source.signal_status();
            {
                let mut status = self.ctx.shared.status.lock();
                status.video_ok = signal.video_ok;
                status.audio_ok = signal.audio_ok;
                status.vitc_ok = signal.vitc_valid;
                status.ltc_ok = signal.ltc_valid;
            }
            if signal.video_ok && !self.ctx.shared.force_suspend.load(Ordering::SeqCst) {
                return true;
            }
            std::thread::sleep(self.ctx.settings.signal_poll_interval);
        }
    }

    /// Flush the hardware queue by stopping and restarting it
    fn restart_input(&mut self) {
        if let Err(e) = self.source.stop_input() {
            log::debug!("stop_input before restart: {}", e);
        }
        if let Err(e) = self.source.start_input() {
            log::error!("Failed to restart capture input: {}", e);
        }
    }

    /// Pull and discard frames until `required` good ones arrive in a row.
    /// Any bad frame restarts the count. Returns false when interrupted by
    /// shutdown, a forced suspend, or loss of signal.
    fn wait_good_frames(&mut self, required: u32) -> bool {
        let mut good = 0;
        while good < required {
            if self.ctx.shutdown.is_cancelled()
                || self.ctx.shared.force_suspend.load(Ordering::SeqCst)
            {
                return false;
            }
            if !self.source.signal_status().video_ok {
                return false;
            }
            match self.source.pull_next_frame() {
                Ok(frame) if !frame.dropped => good += 1,
                Ok(_) => {
                    log::debug!("Dropped frame during recovery after {} good frames", good);
                    good = 0;
                }
                Err(e) => {
                    log::warn!("Pull failed during recovery: {}", e);
                    self.had_error = true;
                    self.restart_input();
                    return false;
                }
            }
        }
        true
    }

    fn update_status(&self, signal: SignalStatus, vitc: Option<Timecode>, ltc: Option<Timecode>) {
        let mut status = self.ctx.shared.status.lock();
        status.video_ok = signal.video_ok;
        status.audio_ok = signal.audio_ok;
        status.vitc_ok = vitc.is_some();
        status.ltc_ok = ltc.is_some();
        if vitc.is_some() {
            status.last_vitc = vitc;
        }
        if ltc.is_some() {
            status.last_ltc = ltc;
        }
    }
}

/// Copy one hardware frame into the ring and stamp its timecodes.
///
/// Frame `next` is written; `captured` is expected to be `next - 1` or less
/// so neither the new slot nor the one before it is visible to consumers.
fn store_frame(
    ctx: &CaptureContext,
    processors: &mut FrameProcessors,
    format: &VideoFormat,
    next: u64,
    previous_stored: bool,
    frame: &HardwareFrame<'_>,
) -> TickOutcome {
    let captured = ctx.positions.captured.get();
    let ring = &ctx.ring;

    // SAFETY: only the capture thread writes slots, and frame `next` is not
    // published until the tick after this one.
    let slot = unsafe { ring.slot_mut(next, captured) };
    copy_prefix(&mut slot.video, frame.video);
    for (dst, src) in slot.audio.iter_mut().zip(frame.audio) {
        copy_prefix(dst, src);
    }

    // SAFETY: same slot, same contract
    if let Some(reduced) = unsafe { ring.reduced_mut(next, captured) } {
        if let Some(reducer) = processors.reducer.as_mut() {
            reducer.reduce(frame.video, format, reduced);
        }
    }

    let vitc = processors.extractor.extract_vitc(frame, format);
    let ltc = processors.extractor.extract_ltc(frame, format);
    slot.vitc = vitc.current;
    slot.ltc = ltc.current;

    if previous_stored && next > 0 {
        stamp_previous(ring, next - 1, captured, vitc, ltc);
    }

    TickOutcome::Stored {
        vitc: vitc.current,
        ltc: ltc.current,
    }
}

/// Back-stamp timecodes that a decoder attributed to the previous frame.
/// Only legal while that frame is still unpublished.
fn stamp_previous(ring: &FrameRing, previous: u64, captured: u64, vitc: Extracted, ltc: Extracted) {
    if vitc.previous.is_none() && ltc.previous.is_none() {
        return;
    }
    debug_assert!(captured <= previous, "frame {} already published", previous);
    if captured > previous {
        log::warn!("Late timecode for frame {} dropped, frame already published", previous);
        return;
    }
    // SAFETY: `previous` is unpublished (checked above) and only the capture
    // thread writes slots.
    let slot = unsafe { ring.slot_mut(previous, captured) };
    if vitc.previous.is_some() {
        slot.vitc = vitc.previous;
    }
    if ltc.previous.is_some() {
        slot.ltc = ltc.previous;
    }
}

fn copy_prefix(dst: &mut [u8], src: &[u8]) {
    let n = dst.len().min(src.len());
    dst[..n].copy_from_slice(&src[..n]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::counters::PositionCounter;
    use crate::capture::synthetic::{FaultScript, SyntheticSource};
    use crate::capture::timecode::{AudioTimecode, AudioTimecodeDecoder, TimecodePolicy, TimecodeSource};
    use crate::capture::PixelFormat;
    use crate::recording::events::EventLog;
    use std::time::Instant;

    fn tiny_format() -> VideoFormat {
        VideoFormat {
            width: 16,
            height: 4,
            pixel_format: PixelFormat::Uyvy8,
            frame_rate: 25,
            audio_pairs: 2,
            samples_per_frame: 8,
        }
    }

    fn settings() -> CaptureSettings {
        CaptureSettings {
            initial_good_frames: 10,
            post_error_good_frames: 32,
            signal_poll_interval: Duration::from_millis(1),
            realtime_priority: false,
            progress_log_interval: 0,
        }
    }

    struct Harness {
        ring: Arc<FrameRing>,
        positions: Arc<PipelinePositions>,
        shared: Arc<CaptureShared>,
        events: Arc<EventLog>,
        shutdown: CancelToken,
        handle: JoinHandle<()>,
    }

    fn start(source: SyntheticSource, ltc_audio: Option<Box<dyn AudioTimecodeDecoder>>, policy: TimecodePolicy) -> Harness {
        let mut source = source;
        let format = source.open().unwrap();
        let ring = Arc::new(FrameRing::new(format, 256));
        let positions = Arc::new(PipelinePositions::new());
        let shared = Arc::new(CaptureShared::new());
        let events = Arc::new(EventLog::in_memory());
        let shutdown = CancelToken::new();

        let ctx = CaptureContext {
            ring: ring.clone(),
            positions: positions.clone(),
            shared: shared.clone(),
            events: events.clone(),
            shutdown: shutdown.clone(),
            settings: settings(),
        };
        let processors = FrameProcessors {
            extractor: TimecodeExtractor::new(policy, 25, None, None, ltc_audio),
            reducer: None,
        };
        let handle = spawn(Box::new(source), processors, ctx).unwrap();
        Harness { ring, positions, shared, events, shutdown, handle }
    }

    fn wait_until(counter: &PositionCounter, target: u64) -> u64 {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut seen = counter.get();
        while seen < target && Instant::now() < deadline {
            seen = counter.wait_for_progress(seen, Duration::from_millis(50));
        }
        seen
    }

    #[test]
    fn test_publishes_with_vitc_after_initial_good_frames() {
        let start_tc = Timecode::from_hmsf(1, 0, 0, 0, 25).unwrap();
        let source = SyntheticSource::new(tiny_format(), start_tc).with_frame_period(Duration::from_millis(1));
        let h = start(source, None, TimecodePolicy::default());

        assert!(wait_until(&h.positions.captured, 20) >= 20);
        h.shutdown.cancel();
        h.handle.join().unwrap();

        let captured = h.positions.captured.get();
        // First ten pulls were spent on the good-frame count
        // SAFETY: capture thread has exited
        let first = unsafe { h.ring.slot(0, captured) };
        assert_eq!(first.vitc, Some(start_tc.offset(10)));
        for frame in 1..captured.min(20) {
            // SAFETY: as above
            let slot = unsafe { h.ring.slot(frame, captured) };
            assert_eq!(slot.vitc, Some(start_tc.offset(10 + frame)));
        }
        assert_eq!(h.shared.snapshot().dropped_frames, 0);
    }

    #[test]
    fn test_dropped_frame_suspends_and_recovers_with_post_error_count() {
        let faults = FaultScript {
            drop_at: vec![15],
            ..Default::default()
        };
        let source = SyntheticSource::new(tiny_format(), Timecode::from_frames(0, 25))
            .with_frame_period(Duration::from_millis(1))
            .with_faults(faults);
        let h = start(source, None, TimecodePolicy::default());

        // 10 startup pulls, frames 0..5 stored, drop on pull 15, 32 recovery
        // pulls, then frames resume with VITC from pull 48
        assert!(wait_until(&h.positions.captured, 10) >= 10);
        h.shutdown.cancel();
        h.handle.join().unwrap();

        let status = h.shared.snapshot();
        assert_eq!(status.dropped_frames, 1);
        assert!(!status.recording_ok);
        assert_eq!(
            h.events.count_matching(|e| matches!(e, SessionEvent::DroppedFrame { .. })),
            1
        );

        let captured = h.positions.captured.get();
        // SAFETY: capture thread has exited
        let resumed = unsafe { h.ring.slot(5, captured) };
        assert_eq!(resumed.vitc, Some(Timecode::from_frames(48, 25)));
    }

    #[test]
    fn test_pull_failure_recovers_with_post_error_count() {
        let faults = FaultScript {
            fail_at: vec![15, 20],
            ..Default::default()
        };
        let source = SyntheticSource::new(tiny_format(), Timecode::from_frames(0, 25))
            .with_frame_period(Duration::from_millis(1))
            .with_faults(faults);
        let h = start(source, None, TimecodePolicy::default());

        assert!(wait_until(&h.positions.captured, 8) >= 8);
        h.shutdown.cancel();
        h.handle.join().unwrap();

        let status = h.shared.snapshot();
        assert_eq!(status.pull_failures, 1);
        assert_eq!(status.dropped_frames, 0);
        assert!(!status.recording_ok);
        assert_eq!(
            h.events.count_matching(|e| matches!(e, SessionEvent::PullFailed { .. })),
            1
        );
        assert_eq!(
            h.events.count_matching(|e| matches!(e, SessionEvent::SignalRecovered { frame: 5 })),
            1
        );

        // Frames 0..5 came from pulls 10..15. Pull 15 fails and the recovery
        // count restarts after the second failure at pull 20, so 32 good
        // pulls run 21..53 and frame 5 is pull 53.
        let captured = h.positions.captured.get();
        // SAFETY: capture thread has exited
        let before = unsafe { h.ring.slot(4, captured) };
        assert_eq!(before.vitc, Some(Timecode::from_frames(14, 25)));
        // SAFETY: as above
        let resumed = unsafe { h.ring.slot(5, captured) };
        assert_eq!(resumed.vitc, Some(Timecode::from_frames(53, 25)));
    }

    #[test]
    fn test_signal_loss_suspends_without_error_count() {
        let faults = FaultScript {
            signal_loss_at: Some(12),
            signal_loss_polls: 3,
            ..Default::default()
        };
        let source = SyntheticSource::new(tiny_format(), Timecode::from_frames(0, 25))
            .with_frame_period(Duration::from_millis(1))
            .with_faults(faults);
        let h = start(source, None, TimecodePolicy::default());

        assert!(wait_until(&h.positions.captured, 8) >= 8);
        h.shutdown.cancel();
        h.handle.join().unwrap();

        let status = h.shared.snapshot();
        assert_eq!(status.signal_losses, 1);
        assert_eq!(status.dropped_frames, 0);

        // Frames 0 and 1 came from pulls 10 and 11. Recovery after signal
        // loss needs only the initial count: pulls 12..22, then frame 2.
        let captured = h.positions.captured.get();
        // SAFETY: capture thread has exited
        let resumed = unsafe { h.ring.slot(2, captured) };
        assert_eq!(resumed.vitc, Some(Timecode::from_frames(22, 25)));
        assert_eq!(
            h.events.count_matching(|e| matches!(e, SessionEvent::SignalRecovered { .. })),
            1
        );
    }

    #[test]
    fn test_forced_suspend_holds_capture() {
        let source = SyntheticSource::new(tiny_format(), Timecode::from_frames(0, 25))
            .with_frame_period(Duration::from_millis(1));
        let h = start(source, None, TimecodePolicy::default());

        assert!(wait_until(&h.positions.captured, 5) >= 5);
        h.shared.force_suspend.store(true, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(30));
        let held = h.positions.captured.get();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(h.positions.captured.get(), held);
        assert!(h.shared.snapshot().suspended);

        h.shared.force_suspend.store(false, Ordering::SeqCst);
        assert!(wait_until(&h.positions.captured, held + 3) >= held + 3);

        h.shutdown.cancel();
        h.handle.join().unwrap();
    }

    /// Reports every reading as belonging to the previous frame
    struct LateLtc {
        word: u32,
    }

    impl AudioTimecodeDecoder for LateLtc {
        fn decode(&mut self, _samples: &[i32]) -> Option<AudioTimecode> {
            self.word += 1;
            Some(AudioTimecode { word: self.word, previous_frame: true })
        }
    }

    #[test]
    fn test_audio_ltc_back_stamps_previous_slot() {
        let source = SyntheticSource::new(tiny_format(), Timecode::from_frames(0, 25))
            .with_frame_period(Duration::from_millis(1));
        let policy = TimecodePolicy {
            vitc: TimecodeSource::Hardware,
            ltc: TimecodeSource::AudioTrack { channel: 0 },
        };
        let h = start(source, Some(Box::new(LateLtc { word: 0 })), policy);

        assert!(wait_until(&h.positions.captured, 6) >= 6);
        h.shutdown.cancel();
        h.handle.join().unwrap();

        let captured = h.positions.captured.get();
        // SAFETY: capture thread has exited
        let first = unsafe { h.ring.slot(0, captured) };
        // Frame 0's value arrives while writing frame 1 (second decode)
        assert_eq!(first.ltc, Timecode::from_bcd(2, 25));
        for frame in 1..captured.min(6) {
            // SAFETY: as above
            let slot = unsafe { h.ring.slot(frame, captured) };
            assert_eq!(slot.ltc, Timecode::from_bcd(frame as u32 + 2, 25));
        }
    }
}
