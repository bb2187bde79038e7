// Browse proxy path: preprocess thread, handoff, encode thread

pub mod convert;
pub(crate) mod encode;
#[cfg(feature = "gst")]
pub mod gst_encoder;
pub mod handoff;
pub(crate) mod preprocess;
pub mod tclog;

#[cfg(feature = "gst")]
pub use gst_encoder::GstBrowseEncoderFactory;
pub use handoff::{BrowseFrame, Handoff};

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Error type for the browse path
#[derive(Debug, thiserror::Error)]
pub enum BrowseError {
    #[error("Browse encoder not available: {0}")]
    NotAvailable(String),

    #[error("Browse encoder pipeline error: {0}")]
    Pipeline(String),

    #[error("Browse encode failed at frame {frame}: {reason}")]
    Encode { frame: u64, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BrowseError>;

/// Display aspect ratio of the source picture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AspectRatio {
    #[default]
    FourByThree,
    SixteenByNine,
}

impl AspectRatio {
    pub fn display_ratio(&self) -> (u32, u32) {
        match self {
            AspectRatio::FourByThree => (4, 3),
            AspectRatio::SixteenByNine => (16, 9),
        }
    }

    /// Pixel aspect ratio for a `width` x `height` raster, reduced
    pub fn pixel_aspect(&self, width: u32, height: u32) -> (u32, u32) {
        let (dw, dh) = self.display_ratio();
        let num = dw * height;
        let den = dh * width;
        let g = gcd(num, den).max(1);
        (num / g, den / g)
    }
}

fn gcd(a: u32, b: u32) -> u32 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

/// Picture and sound layout of the frames handed to a browse encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrowseFormat {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u8,
    /// Interleaved stereo 16-bit at 48kHz
    pub audio_samples_per_frame: u32,
}

/// Encoder for one browse file. Dropping it without `finish` discards
/// whatever the encoder had buffered.
pub trait BrowseEncoder: Send {
    /// Encode one planar 4:2:0 picture plus interleaved stereo samples
    fn encode(&mut self, video: &[u8], audio: &[i16], frame_number: u64) -> Result<()>;

    /// Flush and close the output file
    fn finish(self: Box<Self>) -> Result<()>;
}

pub trait BrowseEncoderFactory: Send + Sync {
    fn create(
        &self,
        path: &Path,
        format: &BrowseFormat,
        aspect: AspectRatio,
        bitrate_kbps: u32,
        thread_count: u32,
    ) -> Result<Box<dyn BrowseEncoder>>;
}
