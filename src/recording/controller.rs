// Recording controller
//
// Owns the capture and archive store threads from `init_capture` until the
// recorder is dropped, and at most one recording session at a time. Control
// calls block until the pipeline has reacted:
//
//   Idle -> Starting -> Recording -> Stopping -> Idle
//
// Aborting can be entered from Recording or Stopping, and an abort that
// arrives during Starting waits for the start to settle first. Browse threads
// belong to one session and are left running after stop until they have
// drained the ring up to the stop point.

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use super::events::{EventLog, EventSink, SessionEvent};
use super::session::{RecordingSession, SessionKind, SessionPaths, SessionSinks, SessionSlot};
use super::stats::{self, GeneralStats, RecordStats};
use super::RecordingStatus;
use crate::archive::report::write_hazard_report;
use crate::archive::store::{self, StoreContext};
use crate::archive::{
    ArchiveError, ArchiveFormat, ArchiveWriterFactory, Completion, DropoutDetectorFactory,
    HazardAnalyzer, HazardAnalyzerFactory, HazardVerdict, SourceMetadata, VtrError,
};
use crate::browse::encode::{self, BrowseProgress};
use crate::browse::preprocess::{self, PreprocessSettings, Preprocessor};
use crate::browse::tclog::TimecodeLog;
use crate::browse::{handoff, AspectRatio, BrowseEncoder, BrowseEncoderFactory, BrowseFormat};
use crate::capture::timecode::TimecodeExtractor;
use crate::capture::worker::{self, CaptureContext, CaptureSettings, FrameProcessors};
use crate::capture::{
    AudioTimecodeDecoder, CancelToken, CaptureError, CaptureShared, CaptureSource, CaptureStatus,
    DepthReducer, FrameRing, PipelinePositions, VbiTimecodeReader, VideoFormat,
};
use crate::config::{ConfigError, RecorderConfig};

/// Error type for control calls
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("Capture is not initialised")]
    NotInitialised,

    #[error("Capture is already initialised")]
    AlreadyInitialised,

    #[error("Recorder is busy ({0:?})")]
    Busy(RecordingStatus),

    #[error("No recording in progress")]
    NotRecording,

    #[error("The active session is {0:?}")]
    WrongKind(SessionKind),

    #[error("The previous browse copy is still being encoded")]
    BrowseBusy,

    #[error("Only {free} bytes free on the archive volume, {required} required")]
    InsufficientSpace { free: u64, required: u64 },

    #[error("The recording was aborted")]
    Aborted,

    #[error("Failed to create event log: {0}")]
    EventLog(String),

    #[error("Failed to spawn {name} thread: {source}")]
    Thread {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, RecordError>;

/// Factories for the per-session collaborators
#[derive(Clone)]
pub struct Collaborators {
    pub archive: Arc<dyn ArchiveWriterFactory>,
    pub browse: Option<Arc<dyn BrowseEncoderFactory>>,
    pub hazard: Option<Arc<dyn HazardAnalyzerFactory>>,
    pub dropout: Option<Arc<dyn DropoutDetectorFactory>>,
}

impl Collaborators {
    pub fn new(archive: Arc<dyn ArchiveWriterFactory>) -> Self {
        Self {
            archive,
            browse: None,
            hazard: None,
            dropout: None,
        }
    }

    pub fn with_browse(mut self, browse: Arc<dyn BrowseEncoderFactory>) -> Self {
        self.browse = Some(browse);
        self
    }

    pub fn with_hazard(mut self, hazard: Arc<dyn HazardAnalyzerFactory>) -> Self {
        self.hazard = Some(hazard);
        self
    }

    pub fn with_dropout(mut self, dropout: Arc<dyn DropoutDetectorFactory>) -> Self {
        self.dropout = Some(dropout);
        self
    }
}

/// Per-frame decoders handed to the capture thread
#[derive(Default)]
pub struct FrameDecoders {
    pub vbi: Option<Box<dyn VbiTimecodeReader>>,
    pub vitc_audio: Option<Box<dyn AudioTimecodeDecoder>>,
    pub ltc_audio: Option<Box<dyn AudioTimecodeDecoder>>,
    /// Required for 10-bit sources
    pub reducer: Option<Box<dyn DepthReducer>>,
}

/// Output locations for a new session
#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    pub archive_path: PathBuf,
    pub browse_path: Option<PathBuf>,
    pub browse_timecode_path: Option<PathBuf>,
    pub hazard_report_path: Option<PathBuf>,
    pub event_path: Option<PathBuf>,
    pub aspect: AspectRatio,
}

impl StartRequest {
    pub fn new(archive_path: impl Into<PathBuf>) -> Self {
        Self {
            archive_path: archive_path.into(),
            ..Default::default()
        }
    }

    pub fn with_browse(mut self, path: impl Into<PathBuf>, timecode_log: Option<PathBuf>) -> Self {
        self.browse_path = Some(path.into());
        self.browse_timecode_path = timecode_log;
        self
    }

    pub fn with_hazard_report(mut self, path: impl Into<PathBuf>) -> Self {
        self.hazard_report_path = Some(path.into());
        self
    }

    pub fn with_event_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.event_path = Some(path.into());
        self
    }

    pub fn with_aspect(mut self, aspect: AspectRatio) -> Self {
        self.aspect = aspect;
        self
    }
}

/// Outcome of a stop call
#[derive(Debug, Clone, Serialize)]
pub struct StopSummary {
    pub session_id: Uuid,
    /// The archive writer finalised the file
    pub completed: bool,
    pub first_frame: u64,
    pub frames: u64,
    pub hazard_verdict: HazardVerdict,
    pub hazard_failures: usize,
    pub dropout_count: usize,
    pub archive_overflows: u64,
    /// The stop point was pulled in because capture stopped delivering
    pub timed_out: bool,
    pub error_events: usize,
}

struct Pipeline {
    ring: Arc<FrameRing>,
    capture: Option<JoinHandle<()>>,
    store: Option<JoinHandle<()>>,
}

struct BrowseRun {
    progress: Arc<BrowseProgress>,
    threads: Vec<JoinHandle<()>>,
}

/// Browse outputs opened before the session is built
struct BrowseOutputs {
    encoder: Box<dyn BrowseEncoder>,
    tclog: Option<TimecodeLog>,
    path: PathBuf,
    tclog_path: Option<PathBuf>,
}

#[derive(Default)]
struct ControlState {
    status: RecordingStatus,
    /// A stop has claimed the ended session; abort can no longer interfere
    finalising: bool,
}

pub struct Recorder {
    config: RecorderConfig,
    services: Collaborators,
    positions: Arc<PipelinePositions>,
    shared: Arc<CaptureShared>,
    sessions: Arc<SessionSlot>,
    shutdown: CancelToken,
    state: Mutex<ControlState>,
    pipeline: Mutex<Option<Pipeline>>,
    browse: Mutex<Option<BrowseRun>>,
    last_session: Mutex<Option<Arc<RecordingSession>>>,
    last_archive: Mutex<Option<PathBuf>>,
}

impl Recorder {
    pub fn new(config: RecorderConfig, services: Collaborators) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            services,
            positions: Arc::new(PipelinePositions::new()),
            shared: Arc::new(CaptureShared::new()),
            sessions: Arc::new(SessionSlot::new()),
            shutdown: CancelToken::new(),
            state: Mutex::new(ControlState::default()),
            pipeline: Mutex::new(None),
            browse: Mutex::new(None),
            last_session: Mutex::new(None),
            last_archive: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    pub fn status(&self) -> RecordingStatus {
        self.state.lock().status
    }

    pub fn capture_status(&self) -> CaptureStatus {
        self.shared.snapshot()
    }

    /// The active session, or the last one to finish
    pub fn last_session(&self) -> Option<Arc<RecordingSession>> {
        self.sessions.current().or_else(|| self.last_session.lock().clone())
    }

    /// Open the source, allocate the ring and start the capture and archive
    /// store threads. Capture runs continuously from here on.
    pub fn init_capture(
        &self,
        mut source: Box<dyn CaptureSource>,
        decoders: FrameDecoders,
        ring_capacity: usize,
    ) -> Result<()> {
        let mut pipeline = self.pipeline.lock();
        if pipeline.is_some() {
            return Err(RecordError::AlreadyInitialised);
        }
        if ring_capacity < 3 {
            return Err(ConfigError::RingTooSmall(ring_capacity).into());
        }

        let format = source.open()?;
        if format.frame_rate != self.config.frame_rate {
            return Err(CaptureError::ModeSet(format!(
                "source delivers {}fps, recorder is configured for {}fps",
                format.frame_rate, self.config.frame_rate
            ))
            .into());
        }
        if format.pixel_format.is_full_depth() && decoders.reducer.is_none() {
            return Err(CaptureError::NoDepthReducer(format.pixel_format).into());
        }

        let ring = Arc::new(FrameRing::new(format, ring_capacity));

        let store = store::spawn(StoreContext {
            ring: ring.clone(),
            positions: self.positions.clone(),
            shared: self.shared.clone(),
            sessions: self.sessions.clone(),
            shutdown: self.shutdown.clone(),
            wait_timeout: self.config.consumer_wait_timeout(),
            progress_log_interval: self.config.progress_log_interval,
        })
        .map_err(|source| RecordError::Thread { name: "archive store", source })?;

        let processors = FrameProcessors {
            extractor: TimecodeExtractor::new(
                self.config.timecode_policy.clone(),
                format.frame_rate,
                decoders.vbi,
                decoders.vitc_audio,
                decoders.ltc_audio,
            ),
            reducer: decoders.reducer,
        };
        let capture_ctx = CaptureContext {
            ring: ring.clone(),
            positions: self.positions.clone(),
            shared: self.shared.clone(),
            events: self.sessions.clone() as Arc<dyn EventSink>,
            shutdown: self.shutdown.clone(),
            settings: CaptureSettings {
                initial_good_frames: self.config.initial_good_frames,
                post_error_good_frames: self.config.post_error_good_frames,
                signal_poll_interval: self.config.signal_poll_interval(),
                realtime_priority: self.config.realtime_priority,
                progress_log_interval: self.config.progress_log_interval,
            },
        };
        let capture = match worker::spawn(source, processors, capture_ctx) {
            Ok(handle) => handle,
            Err(source) => {
                // The store thread cannot outlive a failed init
                self.shutdown.cancel();
                self.positions.captured.notify();
                if store.join().is_err() {
                    log::error!("Archive store thread panicked");
                }
                return Err(RecordError::Thread { name: "capture", source });
            }
        };

        log::info!(
            "Capture initialised: {}x{} {:?} @ {}fps, ring of {} frames",
            format.width,
            format.height,
            format.pixel_format,
            format.frame_rate,
            ring_capacity
        );

        *pipeline = Some(Pipeline {
            ring,
            capture: Some(capture),
            store: Some(store),
        });
        Ok(())
    }

    /// Start a single-item session with archive, browse and hazard analysis
    pub fn start_record(&self, request: StartRequest) -> Result<()> {
        self.start_session(SessionKind::Single, request)
    }

    /// Start a page-segmented archive-only session
    pub fn start_multi_item_record(&self, request: StartRequest) -> Result<()> {
        self.start_session(SessionKind::MultiItem, request)
    }

    /// Stop a single-item session `duration` frames after its first frame,
    /// or at the last captured frame when `duration` is 0
    pub fn stop_record(&self, duration: u64, metadata: &SourceMetadata, vtr_errors: &[VtrError]) -> Result<StopSummary> {
        self.stop_session(SessionKind::Single, duration, metadata, vtr_errors)
    }

    pub fn stop_multi_item_record(
        &self,
        duration: u64,
        metadata: &SourceMetadata,
        vtr_errors: &[VtrError],
    ) -> Result<StopSummary> {
        self.stop_session(SessionKind::MultiItem, duration, metadata, vtr_errors)
    }

    /// Discard the active session. The archive, browse file and timecode
    /// log are removed. The event log is kept.
    pub fn abort_record(&self) -> Result<()> {
        let poll = self.config.stop_poll_interval();
        loop {
            let mut state = self.state.lock();
            let status = state.status;
            match status {
                RecordingStatus::Idle => return Err(RecordError::NotRecording),
                RecordingStatus::Aborting => return Err(RecordError::Busy(status)),
                RecordingStatus::Starting => {
                    drop(state);
                    std::thread::sleep(poll);
                }
                RecordingStatus::Recording | RecordingStatus::Stopping => {
                    if state.finalising {
                        return Err(RecordError::Busy(status));
                    }
                    state.status = RecordingStatus::Aborting;
                    break;
                }
            }
        }

        let Some(session) = self.sessions.current() else {
            self.state.lock().status = RecordingStatus::Idle;
            return Err(RecordError::NotRecording);
        };
        log::warn!("Aborting session {}", session.id);

        self.shared.force_suspend.store(true, Ordering::SeqCst);
        session.abort_token().cancel();
        session.stop_immediately();
        self.positions.captured.notify();
        self.wait_for_abort(&session);

        let frames = session.frames_written();
        let sinks = session.take_sinks();
        if let Some(writer) = sinks.writer {
            if let Err(e) = writer.abort() {
                log::error!("Failed to discard archive: {}", e);
            }
        }
        if let Some(mut hazard) = sinks.hazard {
            hazard.close();
        }

        // The browse threads see the abort token and wind down
        self.join_browse();
        for path in [&session.paths.browse, &session.paths.browse_timecode].into_iter().flatten() {
            remove_output(path);
        }

        session.events.record(SessionEvent::Aborted { frames });
        session.events.sync();
        self.sessions.clear();
        *self.last_session.lock() = Some(session);

        self.shared.force_suspend.store(false, Ordering::SeqCst);
        self.state.lock().status = RecordingStatus::Idle;
        Ok(())
    }

    /// Wait for a detached browse encode to finish. Returns false on timeout.
    pub fn wait_browse_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let finished = self
                .browse
                .lock()
                .as_ref()
                .map_or(true, |run| run.progress.is_finished());
            if finished {
                self.join_browse();
                // Browse may have recorded events after the session stopped
                if let Some(session) = self.last_session() {
                    session.events.sync();
                }
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(self.config.stop_poll_interval());
        }
    }

    pub fn general_stats(&self) -> GeneralStats {
        let status = self.status();
        let (capture_initialised, ring_capacity) = self
            .pipeline
            .lock()
            .as_ref()
            .map_or((false, 0), |p| (true, p.ring.capacity()));

        let captured = self.positions.captured.get();
        let archived = self.positions.archived.get();
        let recording = self.sessions.current().is_some_and(|s| !s.is_ended());
        let browse = self.browse.lock().as_ref().map(|run| run.progress.clone());
        let last_archive = self.last_archive.lock().clone();

        GeneralStats {
            status,
            capture_initialised,
            capture: self.shared.snapshot(),
            captured,
            archived,
            browse_processed: self.positions.browse_processed.get(),
            ring_capacity,
            ring_fill: if recording { captured.saturating_sub(archived) } else { 0 },
            browse_active: browse.as_ref().is_some_and(|p| !p.is_finished()),
            browse_frames_encoded: browse.as_ref().map_or(0, |p| p.frames_encoded()),
            browse_black_frames: browse.as_ref().map_or(0, |p| p.black_frames()),
            browse_failed: browse.as_ref().is_some_and(|p| p.failed()),
            disk_free_bytes: last_archive.as_deref().and_then(stats::disk_free_bytes),
            process_memory_bytes: stats::process_memory_bytes(),
        }
    }

    /// Stats for the active session, or the last one to finish
    pub fn record_stats(&self) -> Option<RecordStats> {
        self.last_session().map(|s| RecordStats::from_session(&s))
    }

    // ------------------------------------------------------------------
    // Start
    // ------------------------------------------------------------------

    fn start_session(&self, kind: SessionKind, request: StartRequest) -> Result<()> {
        let ring = self
            .pipeline
            .lock()
            .as_ref()
            .map(|p| p.ring.clone())
            .ok_or(RecordError::NotInitialised)?;

        {
            let mut state = self.state.lock();
            if state.status != RecordingStatus::Idle {
                return Err(RecordError::Busy(state.status));
            }
            state.status = RecordingStatus::Starting;
        }

        match self.begin_session(kind, &request, &ring) {
            Ok(()) => {
                self.state.lock().status = RecordingStatus::Recording;
                self.positions.captured.notify();
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to start recording to {}: {}", request.archive_path.display(), e);
                self.state.lock().status = RecordingStatus::Idle;
                Err(e)
            }
        }
    }

    fn begin_session(&self, kind: SessionKind, request: &StartRequest, ring: &Arc<FrameRing>) -> Result<()> {
        self.reap_browse()?;
        self.check_free_space(&request.archive_path)?;

        let format = *ring.format();
        let single = kind == SessionKind::Single;
        let page_size = match kind {
            SessionKind::MultiItem => Some(self.config.multi_item_page_size_bytes),
            SessionKind::Single => None,
        };

        let writer = self
            .services
            .archive
            .create(&request.archive_path, &ArchiveFormat { video: format, page_size })?;

        let events = match &request.event_path {
            Some(path) => match EventLog::create(path) {
                Ok(log) => log,
                Err(e) => {
                    if let Err(abort_err) = writer.abort() {
                        log::warn!("Failed to discard archive after event log error: {}", abort_err);
                    }
                    return Err(RecordError::EventLog(format!("{:#}", e)));
                }
            },
            None => EventLog::in_memory(),
        };

        let hazard = if single && self.config.hazard_analysis_enabled {
            self.open_hazard(&format)
        } else {
            None
        };
        let dropout = self
            .services
            .dropout
            .as_ref()
            .map(|factory| factory.create(&format, &self.config.dropout_thresholds));

        let browse = if single && self.config.browse_enabled {
            self.open_browse(request, &format, &events)
        } else {
            None
        };

        let paths = SessionPaths {
            archive: request.archive_path.clone(),
            browse: browse.as_ref().map(|b| b.path.clone()),
            browse_timecode: browse.as_ref().and_then(|b| b.tclog_path.clone()),
            hazard_report: if single { request.hazard_report_path.clone() } else { None },
            event: request.event_path.clone(),
        };

        let first = self.positions.captured.get();
        self.positions.archived.advance(first);
        self.positions.browse_processed.advance(first);
        self.shared.status.lock().recording_ok = true;

        let sinks = SessionSinks {
            writer: Some(writer),
            hazard,
            dropout,
        };
        let session = Arc::new(RecordingSession::new(kind, paths, first, sinks, events));
        self.sessions.install(session.clone());
        session.events.record(SessionEvent::Started {
            first_frame: first,
            multi_item: !single,
        });

        if let Some(outputs) = browse {
            self.spawn_browse(outputs, ring, &session);
        }

        *self.last_archive.lock() = Some(request.archive_path.clone());
        log::info!(
            "Recording session {} started at frame {} to {}",
            session.id,
            first,
            request.archive_path.display()
        );
        Ok(())
    }

    fn check_free_space(&self, archive_path: &Path) -> Result<()> {
        let required = self.config.min_free_space_bytes;
        if required == 0 {
            return Ok(());
        }
        match stats::disk_free_bytes(archive_path) {
            Some(free) if free < required => Err(RecordError::InsufficientSpace { free, required }),
            Some(_) => Ok(()),
            None => {
                log::warn!("Could not determine free space for {}", archive_path.display());
                Ok(())
            }
        }
    }

    fn open_hazard(&self, format: &VideoFormat) -> Option<Box<dyn HazardAnalyzer>> {
        let factory = self.services.hazard.as_ref()?;
        let mut analyzer = factory.create();
        match analyzer.open(format) {
            Ok(()) => Some(analyzer),
            Err(e) => {
                log::warn!("Hazard analysis unavailable for this session: {}", e);
                None
            }
        }
    }

    /// Browse failures never stop the archive. The session records the
    /// failure and runs without a browse copy.
    fn open_browse(&self, request: &StartRequest, format: &VideoFormat, events: &EventLog) -> Option<BrowseOutputs> {
        let path = request.browse_path.as_ref()?;
        let Some(factory) = self.services.browse.as_ref() else {
            events.record(SessionEvent::BrowseFailed {
                reason: "no browse encoder available".into(),
            });
            return None;
        };

        let browse_format = BrowseFormat {
            width: format.width,
            height: format.height,
            frame_rate: format.frame_rate,
            audio_samples_per_frame: format.samples_per_frame,
        };
        let encoder = match factory.create(
            path,
            &browse_format,
            request.aspect,
            self.config.browse_bitrate_kbps,
            self.config.browse_thread_count,
        ) {
            Ok(encoder) => encoder,
            Err(e) => {
                events.record(SessionEvent::BrowseFailed { reason: e.to_string() });
                return None;
            }
        };

        let (tclog, tclog_path) = match &request.browse_timecode_path {
            Some(tc_path) => match TimecodeLog::create(tc_path) {
                Ok(log) => (Some(log), Some(tc_path.clone())),
                Err(e) => {
                    log::warn!("Failed to create browse timecode log {}: {}", tc_path.display(), e);
                    (None, None)
                }
            },
            None => (None, None),
        };

        Some(BrowseOutputs {
            encoder,
            tclog,
            path: path.clone(),
            tclog_path,
        })
    }

    fn spawn_browse(&self, outputs: BrowseOutputs, ring: &Arc<FrameRing>, session: &Arc<RecordingSession>) {
        let wait = self.config.consumer_wait_timeout();
        let settings = PreprocessSettings {
            overflow_frames: self.config.browse_overflow_frames,
            wait_timeout: wait,
        };
        let pre = Preprocessor::new(
            ring.clone(),
            self.positions.clone(),
            session.clone(),
            outputs.tclog,
            &settings,
        );
        let (sender, receiver) = handoff::channel();
        let progress = Arc::new(BrowseProgress::default());

        let encode = match encode::spawn(outputs.encoder, receiver, progress.clone(), self.shutdown.clone(), wait) {
            Ok(handle) => handle,
            Err(e) => {
                session.events.record(SessionEvent::BrowseFailed {
                    reason: format!("encode thread: {}", e),
                });
                return;
            }
        };
        let mut threads = vec![encode];

        // A failed spawn drops the sender, which ends the encode thread
        match preprocess::spawn(pre, sender, self.shutdown.clone()) {
            Ok(handle) => threads.push(handle),
            Err(e) => session.events.record(SessionEvent::BrowseFailed {
                reason: format!("preprocess thread: {}", e),
            }),
        }

        *self.browse.lock() = Some(BrowseRun { progress, threads });
    }

    /// Join the previous session's browse threads if they are done
    fn reap_browse(&self) -> Result<()> {
        let busy = self
            .browse
            .lock()
            .as_ref()
            .is_some_and(|run| !run.progress.is_finished());
        if busy {
            return Err(RecordError::BrowseBusy);
        }
        self.join_browse();
        Ok(())
    }

    /// Join the browse threads. Their progress stays readable for stats.
    fn join_browse(&self) {
        let threads = self
            .browse
            .lock()
            .as_mut()
            .map(|run| std::mem::take(&mut run.threads))
            .unwrap_or_default();
        for handle in threads {
            if handle.join().is_err() {
                log::error!("Browse thread panicked");
            }
        }
    }

    // ------------------------------------------------------------------
    // Stop
    // ------------------------------------------------------------------

    fn stop_session(
        &self,
        kind: SessionKind,
        duration: u64,
        metadata: &SourceMetadata,
        vtr_errors: &[VtrError],
    ) -> Result<StopSummary> {
        let session = {
            let mut state = self.state.lock();
            match state.status {
                RecordingStatus::Recording => {}
                RecordingStatus::Idle => return Err(RecordError::NotRecording),
                other => return Err(RecordError::Busy(other)),
            }
            let session = self.sessions.current().ok_or(RecordError::NotRecording)?;
            if session.kind != kind {
                return Err(RecordError::WrongKind(session.kind));
            }
            state.status = RecordingStatus::Stopping;
            session
        };

        let first = session.first_frame();
        let end = if duration == 0 {
            self.positions.captured.get()
        } else {
            first.saturating_add(duration)
        };
        let stop = session.request_stop(end);
        log::info!("Stop requested for session {}: {:?}", session.id, stop);
        session.events.record(SessionEvent::StopRequested {
            end_frame: end.saturating_sub(first),
        });
        self.positions.captured.notify();

        let timed_out = self.wait_for_end(&session)?;
        Ok(self.finalise(session, metadata, vtr_errors, timed_out))
    }

    /// Busy-wait for the archive path to reach the stop point. Returns
    /// whether the stop timed out, or `Aborted` if an abort took over.
    fn wait_for_end(&self, session: &RecordingSession) -> Result<bool> {
        let poll = self.config.stop_poll_interval();
        let stop_timeout = self.config.stop_timeout();
        let mut last_captured = self.positions.captured.get();
        let mut last_progress = Instant::now();
        let mut timed_out = false;

        loop {
            {
                let mut state = self.state.lock();
                if state.status == RecordingStatus::Aborting {
                    return Err(RecordError::Aborted);
                }
                if session.is_ended() {
                    state.finalising = true;
                    return Ok(timed_out);
                }
            }

            // Consumers may be parked on `captured`; make them re-check
            self.positions.captured.notify();
            let archived = self.positions.archived.get();
            self.positions.archived.wait_for_progress(archived, poll);

            let captured = self.positions.captured.get();
            if captured != last_captured {
                last_captured = captured;
                last_progress = Instant::now();
            } else if !timed_out && last_progress.elapsed() >= stop_timeout {
                log::warn!(
                    "No frames captured for {:?} while stopping, stopping at frame {}",
                    stop_timeout,
                    captured
                );
                session.truncate_to(captured);
                session.events.record(SessionEvent::StopTimedOut {
                    frame: captured.saturating_sub(session.first_frame()),
                });
                timed_out = true;
            }
        }
    }

    fn finalise(
        &self,
        session: Arc<RecordingSession>,
        metadata: &SourceMetadata,
        vtr_errors: &[VtrError],
        timed_out: bool,
    ) -> StopSummary {
        let frames = session.frames_written();
        let sinks = session.take_sinks();

        let (hazard_verdict, hazard_results) = match sinks.hazard {
            Some(mut hazard) => {
                let results = hazard.drain_results();
                hazard.close();
                (HazardVerdict::from_results(&results), results)
            }
            None => (HazardVerdict::NotChecked, Vec::new()),
        };
        let (dropout_count, dropouts) = sinks
            .dropout
            .as_ref()
            .map_or((0, Vec::new()), |d| (d.dropout_count(), d.dropouts()));

        let completed = match sinks.writer {
            Some(writer) => {
                let completion = Completion {
                    frames,
                    metadata,
                    hazard_verdict,
                    hazard_results: &hazard_results,
                    dropouts: &dropouts,
                    vtr_errors,
                };
                match writer.complete(&completion) {
                    Ok(()) => true,
                    Err(e) => {
                        log::error!("Failed to complete archive {}: {}", session.paths.archive.display(), e);
                        session.events.record(SessionEvent::FinalizeFailed { reason: e.to_string() });
                        false
                    }
                }
            }
            None => {
                session.events.record(SessionEvent::FinalizeFailed {
                    reason: "archive writer already closed".into(),
                });
                false
            }
        };

        if let Some(report) = &session.paths.hazard_report {
            if hazard_verdict != HazardVerdict::NotChecked {
                if let Err(e) = write_hazard_report(
                    report,
                    &session.paths.archive,
                    hazard_verdict,
                    &hazard_results,
                    &session.timecodes(),
                ) {
                    log::error!("{:#}", e);
                    session.events.record(SessionEvent::FinalizeFailed {
                        reason: format!("{:#}", e),
                    });
                }
            }
        }

        session.events.record(SessionEvent::Ended { frames });
        session.events.sync();

        let summary = StopSummary {
            session_id: session.id,
            completed,
            first_frame: session.first_frame(),
            frames,
            hazard_verdict,
            hazard_failures: hazard_results.iter().filter(|r| r.is_failure()).count(),
            dropout_count,
            archive_overflows: session.archive_overflows(),
            timed_out,
            error_events: session.events.error_count(),
        };

        self.sessions.clear();
        *self.last_session.lock() = Some(session);
        {
            let mut state = self.state.lock();
            state.status = RecordingStatus::Idle;
            state.finalising = false;
        }
        summary
    }

    /// Wait for the store thread to acknowledge an immediate stop. A writer
    /// stuck past the stop timeout is cut off at the archived count.
    fn wait_for_abort(&self, session: &RecordingSession) {
        let poll = self.config.stop_poll_interval();
        let deadline = Instant::now() + self.config.stop_timeout();
        while !session.is_ended() {
            if Instant::now() >= deadline {
                let archived = self.positions.archived.get();
                log::warn!("Archive store did not acknowledge abort, ending session at frame {}", archived);
                session.end(archived);
                break;
            }
            self.positions.captured.notify();
            let archived = self.positions.archived.get();
            self.positions.archived.wait_for_progress(archived, poll);
        }
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if self.status().is_active() {
            if let Err(e) = self.abort_record() {
                log::warn!("Failed to abort session on shutdown: {}", e);
            }
        }

        self.shutdown.cancel();
        self.shared.force_suspend.store(false, Ordering::SeqCst);
        self.positions.captured.notify();

        if let Some(mut pipeline) = self.pipeline.lock().take() {
            for (name, handle) in [("capture", pipeline.capture.take()), ("archive store", pipeline.store.take())] {
                if let Some(handle) = handle {
                    if handle.join().is_err() {
                        log::error!("{} thread panicked", name);
                    }
                }
            }
        }
        self.join_browse();
        log::info!("Recorder shut down");
    }
}

fn remove_output(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => log::info!("Removed {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("Failed to remove {}: {}", path.display(), e),
    }
}
