// In-memory collaborators for pipeline tests

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::archive::{
    self, ArchiveFormat, ArchiveWriter, ArchiveWriterFactory, Completion, ContentPackage, Dropout,
    DropoutDetector, DropoutDetectorFactory, DropoutThresholds, HazardAnalyzer, HazardAnalyzerFactory,
    HazardResult, HazardVerdict,
};
use crate::browse::{self, AspectRatio, BrowseEncoder, BrowseEncoderFactory, BrowseError, BrowseFormat};
use crate::capture::{PixelFormat, VideoFormat};

/// A raster small enough to push thousands of frames through quickly
pub fn tiny_format() -> VideoFormat {
    VideoFormat {
        width: 16,
        height: 4,
        pixel_format: PixelFormat::Uyvy8,
        frame_rate: 25,
        audio_pairs: 1,
        samples_per_frame: 8,
    }
}

// ============================================================================
// Archive
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRecord {
    pub frames: u64,
    pub item_id: String,
    pub hazard_verdict: HazardVerdict,
    pub dropouts: usize,
    pub vtr_errors: usize,
}

#[derive(Default)]
struct ArchiveState {
    created: Vec<PathBuf>,
    first_bytes: Vec<u8>,
    video_len: usize,
    positions: Vec<u64>,
    completed: Option<CompletionRecord>,
    fail_create: bool,
}

/// Archive writer that keeps the first video byte of each frame
#[derive(Clone, Default)]
pub struct MemoryArchive {
    state: Arc<Mutex<ArchiveState>>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    /// A factory whose `create` always fails
    pub fn failing_create() -> Self {
        let archive = Self::default();
        archive.state.lock().fail_create = true;
        archive
    }

    pub fn writer(&self) -> Box<dyn ArchiveWriter> {
        Box::new(MemoryArchiveWriter {
            state: self.state.clone(),
            bytes: 0,
        })
    }

    pub fn frames_written(&self) -> u64 {
        self.state.lock().positions.len() as u64
    }

    pub fn first_video_bytes(&self) -> Vec<u8> {
        self.state.lock().first_bytes.clone()
    }

    pub fn positions(&self) -> Vec<u64> {
        self.state.lock().positions.clone()
    }

    /// Video length of the last frame written
    pub fn video_len(&self) -> usize {
        self.state.lock().video_len
    }

    pub fn completion(&self) -> Option<CompletionRecord> {
        self.state.lock().completed.clone()
    }

    pub fn created(&self) -> Vec<PathBuf> {
        self.state.lock().created.clone()
    }
}

impl ArchiveWriterFactory for MemoryArchive {
    fn create(&self, path: &Path, _format: &ArchiveFormat) -> archive::Result<Box<dyn ArchiveWriter>> {
        let mut state = self.state.lock();
        if state.fail_create {
            return Err(archive::ArchiveError::Create {
                path: path.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "scripted failure"),
            });
        }
        state.created.push(path.to_path_buf());
        drop(state);
        Ok(self.writer())
    }
}

struct MemoryArchiveWriter {
    state: Arc<Mutex<ArchiveState>>,
    bytes: u64,
}

impl ArchiveWriter for MemoryArchiveWriter {
    fn write_frame(&mut self, package: &ContentPackage<'_>) -> archive::Result<()> {
        let mut state = self.state.lock();
        state.first_bytes.push(package.video.first().copied().unwrap_or(0));
        state.video_len = package.video.len();
        state.positions.push(package.position);
        self.bytes += package.video.len() as u64;
        Ok(())
    }

    fn complete(self: Box<Self>, completion: &Completion<'_>) -> archive::Result<()> {
        self.state.lock().completed = Some(CompletionRecord {
            frames: completion.frames,
            item_id: completion.metadata.item_id.clone(),
            hazard_verdict: completion.hazard_verdict,
            dropouts: completion.dropouts.len(),
            vtr_errors: completion.vtr_errors.len(),
        });
        Ok(())
    }

    fn abort(self: Box<Self>) -> archive::Result<()> {
        self.state.lock().positions.clear();
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.bytes
    }
}

// ============================================================================
// Browse
// ============================================================================

#[derive(Default)]
struct BrowseState {
    frame_numbers: Vec<u64>,
    finished: bool,
    fail_at: Option<u64>,
    held: bool,
}

/// Browse encoder that records frame numbers. As a factory it also creates
/// an empty file at the browse path so cleanup can be checked.
#[derive(Clone, Default)]
pub struct MemoryBrowse {
    state: Arc<Mutex<BrowseState>>,
    released: Arc<Condvar>,
}

impl MemoryBrowse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encoder that fails from frame `frame` on
    pub fn failing_at(frame: u64) -> Self {
        let browse = Self::default();
        browse.state.lock().fail_at = Some(frame);
        browse
    }

    /// Encoder that blocks in `encode` until `release` (or ten seconds)
    pub fn held() -> Self {
        let browse = Self::default();
        browse.state.lock().held = true;
        browse
    }

    pub fn release(&self) {
        self.state.lock().held = false;
        self.released.notify_all();
    }

    pub fn encoder(&self) -> Box<dyn BrowseEncoder> {
        Box::new(MemoryBrowseEncoder {
            state: self.state.clone(),
            released: self.released.clone(),
        })
    }

    pub fn frame_numbers(&self) -> Vec<u64> {
        self.state.lock().frame_numbers.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }
}

impl BrowseEncoderFactory for MemoryBrowse {
    fn create(
        &self,
        path: &Path,
        _format: &BrowseFormat,
        _aspect: AspectRatio,
        _bitrate_kbps: u32,
        _thread_count: u32,
    ) -> browse::Result<Box<dyn BrowseEncoder>> {
        std::fs::File::create(path)?;
        Ok(self.encoder())
    }
}

struct MemoryBrowseEncoder {
    state: Arc<Mutex<BrowseState>>,
    released: Arc<Condvar>,
}

impl BrowseEncoder for MemoryBrowseEncoder {
    fn encode(&mut self, _video: &[u8], _audio: &[i16], frame_number: u64) -> browse::Result<()> {
        let mut state = self.state.lock();
        let deadline = Instant::now() + Duration::from_secs(10);
        while state.held && Instant::now() < deadline {
            self.released.wait_until(&mut state, deadline);
        }
        if state.fail_at.is_some_and(|at| frame_number >= at) {
            return Err(BrowseError::Encode {
                frame: frame_number,
                reason: "scripted failure".into(),
            });
        }
        state.frame_numbers.push(frame_number);
        Ok(())
    }

    fn finish(self: Box<Self>) -> browse::Result<()> {
        self.state.lock().finished = true;
        Ok(())
    }
}

// ============================================================================
// Analysis
// ============================================================================

#[derive(Default)]
struct HazardState {
    opened: bool,
    closed: bool,
    analysed: u64,
    video_len: usize,
}

/// Hazard analyser that flags fixed session positions
#[derive(Clone, Default)]
pub struct FlaggingHazard {
    flag_at: Vec<u64>,
    fail_open: bool,
    state: Arc<Mutex<HazardState>>,
}

impl FlaggingHazard {
    pub fn new(flag_at: Vec<u64>) -> Self {
        Self { flag_at, ..Default::default() }
    }

    pub fn failing_open() -> Self {
        Self { fail_open: true, ..Default::default() }
    }

    pub fn analysed(&self) -> u64 {
        self.state.lock().analysed
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Video length of the last frame analysed
    pub fn video_len(&self) -> usize {
        self.state.lock().video_len
    }
}

impl HazardAnalyzerFactory for FlaggingHazard {
    fn create(&self) -> Box<dyn HazardAnalyzer> {
        Box::new(FlaggingAnalyzer {
            flag_at: self.flag_at.clone(),
            fail_open: self.fail_open,
            state: self.state.clone(),
            next: 0,
            pending: Vec::new(),
        })
    }
}

struct FlaggingAnalyzer {
    flag_at: Vec<u64>,
    fail_open: bool,
    state: Arc<Mutex<HazardState>>,
    next: u64,
    pending: Vec<HazardResult>,
}

impl HazardAnalyzer for FlaggingAnalyzer {
    fn open(&mut self, _format: &VideoFormat) -> archive::analysis::Result<()> {
        if self.fail_open {
            return Err(archive::analysis::AnalysisError::Open("scripted failure".into()));
        }
        self.state.lock().opened = true;
        Ok(())
    }

    fn analyse_frame(&mut self, video: &[u8]) -> bool {
        if self.flag_at.contains(&self.next) {
            self.pending.push(HazardResult {
                position: self.next,
                red_flash: 1.5,
                luminance_flash: 0.2,
                spatial_pattern: 0.0,
                extended_failure: false,
            });
        }
        self.next += 1;
        let mut state = self.state.lock();
        state.analysed += 1;
        state.video_len = video.len();
        true
    }

    fn drain_results(&mut self) -> Vec<HazardResult> {
        std::mem::take(&mut self.pending)
    }

    fn close(&mut self) {
        self.state.lock().closed = true;
    }
}

/// Dropout detector that reports every `every`th frame
#[derive(Clone, Copy)]
pub struct PeriodicDropouts {
    pub every: u64,
}

impl DropoutDetectorFactory for PeriodicDropouts {
    fn create(&self, _format: &VideoFormat, thresholds: &DropoutThresholds) -> Box<dyn DropoutDetector> {
        Box::new(PeriodicDetector {
            every: self.every.max(1),
            strength: thresholds.min_strength,
            found: Vec::new(),
        })
    }
}

struct PeriodicDetector {
    every: u64,
    strength: u32,
    found: Vec<Dropout>,
}

impl DropoutDetector for PeriodicDetector {
    fn process_frame(&mut self, _video: &[u8], position: u64) {
        if position % self.every == self.every - 1 {
            self.found.push(Dropout {
                position,
                strength: self.strength,
            });
        }
    }

    fn dropout_count(&self) -> usize {
        self.found.len()
    }

    fn dropouts(&self) -> Vec<Dropout> {
        self.found.clone()
    }
}
