// SDI capture: source abstraction, frame ring and the capture thread

pub mod counters;
pub mod priority;
pub mod ring;
pub mod synthetic;
pub mod timecode;
pub(crate) mod worker;

pub use counters::{CancelToken, PipelinePositions, PositionCounter};
pub use ring::{FrameRing, FrameSlot};
pub use synthetic::{FaultScript, SyntheticSource};
pub use timecode::{
    AudioTimecode, AudioTimecodeDecoder, Timecode, TimecodePolicy, TimecodeSource,
    VbiTimecodeReader,
};

use std::sync::atomic::AtomicBool;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Error type for capture operations
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("Failed to open capture device: {0}")]
    Open(String),

    #[error("Video mode not supported: {0}")]
    ModeSet(String),

    #[error("Input queue error: {0}")]
    Input(String),

    #[error("Frame pull failed: {0}")]
    Pull(String),

    #[error("Input is not running")]
    NotRunning,

    #[error("No depth reducer for {0:?} video")]
    NoDepthReducer(PixelFormat),
}

pub type Result<T> = std::result::Result<T, CaptureError>;

/// Pixel packing of the captured picture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    /// 8-bit 4:2:2, U Y V Y byte order
    Uyvy8,
    /// 10-bit 4:2:2, U Y V Y order, each sample in a little-endian u16
    Uyvy10,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Uyvy8 => 2,
            PixelFormat::Uyvy10 => 4,
        }
    }

    pub fn is_full_depth(&self) -> bool {
        matches!(self, PixelFormat::Uyvy10)
    }
}

/// Negotiated capture mode. Ring slot sizes are derived from this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoFormat {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub frame_rate: u8,
    /// Number of stereo channel pairs
    pub audio_pairs: u8,
    /// Audio samples per channel per frame
    pub samples_per_frame: u32,
}

impl VideoFormat {
    /// 625-line PAL SD with four audio pairs at 48kHz
    pub fn pal_625() -> Self {
        Self {
            width: 720,
            height: 576,
            pixel_format: PixelFormat::Uyvy8,
            frame_rate: 25,
            audio_pairs: 4,
            samples_per_frame: 1920,
        }
    }

    pub fn line_stride(&self) -> usize {
        self.width as usize * self.pixel_format.bytes_per_pixel()
    }

    pub fn video_size(&self) -> usize {
        self.line_stride() * self.height as usize
    }

    /// 8-bit UYVY size, used for the reduced-depth copy
    pub fn reduced_video_size(&self) -> usize {
        self.width as usize * self.height as usize * 2
    }

    /// Interleaved 32-bit stereo
    pub fn audio_pair_size(&self) -> usize {
        self.samples_per_frame as usize * 2 * 4
    }
}

/// One frame as delivered by the capture card. Borrows the card's buffers.
#[derive(Debug)]
pub struct HardwareFrame<'a> {
    pub video: &'a [u8],
    /// One buffer per audio pair, interleaved 32-bit little-endian stereo
    pub audio: &'a [Vec<u8>],
    /// Hardware VITC for field 1 and field 2, `None` when not flagged valid
    pub vitc: [Option<u32>; 2],
    /// Hardware LTC, `None` when not flagged valid
    pub ltc: Option<u32>,
    /// The card dropped at least one frame before this one
    pub dropped: bool,
}

/// Snapshot of the input signal as reported by the card
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SignalStatus {
    pub video_ok: bool,
    pub audio_ok: bool,
    pub vitc_valid: bool,
    pub ltc_valid: bool,
}

/// Capture device driver
pub trait CaptureSource: Send {
    /// Open the device and set the video mode
    fn open(&mut self) -> Result<VideoFormat>;

    fn start_input(&mut self) -> Result<()>;

    fn stop_input(&mut self) -> Result<()>;

    /// Block until the next frame is available
    fn pull_next_frame(&mut self) -> Result<HardwareFrame<'_>>;

    fn signal_status(&mut self) -> SignalStatus;
}

/// Converts full-depth video to the 8-bit copy used by browse and analysis
pub trait DepthReducer: Send {
    fn reduce(&mut self, video: &[u8], format: &VideoFormat, out: &mut [u8]);
}

/// Keeps the top 8 bits of each 10-bit sample
pub struct ShiftReducer;

impl DepthReducer for ShiftReducer {
    fn reduce(&mut self, video: &[u8], _format: &VideoFormat, out: &mut [u8]) {
        for (dst, src) in out.iter_mut().zip(video.chunks_exact(2)) {
            *dst = (u16::from_le_bytes([src[0], src[1]]) >> 2) as u8;
        }
    }
}

/// Signal and buffer state shown to monitoring
#[derive(Debug, Clone, Default, Serialize)]
pub struct CaptureStatus {
    pub video_ok: bool,
    pub audio_ok: bool,
    pub vitc_ok: bool,
    pub ltc_ok: bool,
    /// Cleared on dropped frames, pull failures and archive overflow.
    /// Set again when a session starts.
    pub recording_ok: bool,
    pub suspended: bool,
    pub dropped_frames: u64,
    pub signal_losses: u64,
    pub pull_failures: u64,
    pub last_vitc: Option<Timecode>,
    pub last_ltc: Option<Timecode>,
}

/// State shared between the capture thread and everything else
#[derive(Default)]
pub struct CaptureShared {
    pub status: Mutex<CaptureStatus>,
    /// Set by abort to park the capture thread until released
    pub force_suspend: AtomicBool,
}

impl CaptureShared {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> CaptureStatus {
        self.status.lock().clone()
    }

    pub fn mark_recording_bad(&self) {
        self.status.lock().recording_ok = false;
    }
}
