// Timecode values and per-frame VITC/LTC extraction
//
// Hardware and VBI decoders hand us packed BCD words (HH:MM:SS:FF, with
// flag bits in the unused high bits). Everything past the capture thread
// works with `Timecode`, a frame count since midnight at the source rate.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::{HardwareFrame, PixelFormat, VideoFormat};

/// Bit 31 of a hardware VITC word. Set on one of the two field words when
/// the card latches the wrong field first.
pub const FIELD_MARK: u32 = 0x8000_0000;

/// Maximum luma spread (8-bit scale) for a line to count as flat black/grey
const FLAT_LINE_TOLERANCE: u16 = 8;

/// A timecode as a frame count since 00:00:00:00
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timecode {
    frames: u32,
    rate: u8,
}

impl Timecode {
    pub fn from_frames(frames: u32, rate: u8) -> Self {
        let rate = rate.max(1);
        Self {
            frames: frames % Self::frames_per_day(rate),
            rate,
        }
    }

    pub fn from_hmsf(hours: u32, minutes: u32, seconds: u32, frames: u32, rate: u8) -> Option<Self> {
        if hours > 23 || minutes > 59 || seconds > 59 || frames >= rate as u32 {
            return None;
        }
        let r = rate as u32;
        Some(Self {
            frames: ((hours * 60 + minutes) * 60 + seconds) * r + frames,
            rate,
        })
    }

    /// Decode a packed BCD word. Flag bits outside the digit fields are
    /// ignored. Returns `None` for digits that are not valid timecode.
    pub fn from_bcd(word: u32, rate: u8) -> Option<Self> {
        let digit = |shift: u32, mask: u32| (word >> shift) & mask;
        let tens_and_units = |tens: u32, units: u32| -> Option<u32> {
            if units > 9 {
                None
            } else {
                Some(tens * 10 + units)
            }
        };

        let hours = tens_and_units(digit(28, 0x3), digit(24, 0xF))?;
        let minutes = tens_and_units(digit(20, 0x7), digit(16, 0xF))?;
        let seconds = tens_and_units(digit(12, 0x7), digit(8, 0xF))?;
        let frames = tens_and_units(digit(4, 0x3), digit(0, 0xF))?;

        Self::from_hmsf(hours, minutes, seconds, frames, rate)
    }

    /// Encode as a packed BCD word (no flag bits)
    pub fn to_bcd(&self) -> u32 {
        let (h, m, s, f) = self.components();
        let pack = |v: u32| ((v / 10) << 4) | (v % 10);
        (pack(h) << 24) | (pack(m) << 16) | (pack(s) << 8) | pack(f)
    }

    pub fn components(&self) -> (u32, u32, u32, u32) {
        let r = self.rate as u32;
        let frames = self.frames % r;
        let total_secs = self.frames / r;
        (total_secs / 3600, (total_secs / 60) % 60, total_secs % 60, frames)
    }

    pub fn frames(&self) -> u32 {
        self.frames
    }

    pub fn rate(&self) -> u8 {
        self.rate
    }

    /// Timecode `n` frames later, wrapping at midnight
    pub fn offset(&self, n: u64) -> Self {
        let day = Self::frames_per_day(self.rate) as u64;
        Self {
            frames: ((self.frames as u64 + n % day) % day) as u32,
            rate: self.rate,
        }
    }

    fn frames_per_day(rate: u8) -> u32 {
        24 * 60 * 60 * rate.max(1) as u32
    }
}

impl fmt::Display for Timecode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (h, m, s, fr) = self.components();
        write!(f, "{:02}:{:02}:{:02}:{:02}", h, m, s, fr)
    }
}

/// Format an optional timecode, using `--:--:--:--` when unknown
pub fn display_or_unknown(tc: Option<Timecode>) -> String {
    match tc {
        Some(tc) => tc.to_string(),
        None => "--:--:--:--".to_string(),
    }
}

/// VITC from the card's two field words.
///
/// When both are valid and exactly one carries `FIELD_MARK`, the other one
/// wins. Otherwise field 1 is used as-is.
pub fn select_field_vitc(field1: Option<u32>, field2: Option<u32>) -> Option<u32> {
    match (field1, field2) {
        (Some(a), Some(b)) => {
            if a & FIELD_MARK != 0 && b & FIELD_MARK == 0 {
                Some(b)
            } else {
                Some(a)
            }
        }
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

// ============================================================================
// Source policy
// ============================================================================

/// Where one timecode stream comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum TimecodeSource {
    /// Decoded by the capture card
    Hardware,
    /// Decoded from picture lines, tried in order
    VbiLines { lines: Vec<u16> },
    /// Decoded from an audio channel (0-based across all pairs)
    AudioTrack { channel: u8 },
    /// Not captured
    #[serde(rename = "none")]
    Disabled,
}

/// Per-session timecode configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimecodePolicy {
    pub vitc: TimecodeSource,
    pub ltc: TimecodeSource,
}

impl Default for TimecodePolicy {
    fn default() -> Self {
        Self {
            vitc: TimecodeSource::Hardware,
            ltc: TimecodeSource::Hardware,
        }
    }
}

// ============================================================================
// Decoder collaborators
// ============================================================================

/// Reads a timecode word out of one picture line
pub trait VbiTimecodeReader: Send {
    /// Decode the BCD word carried on `line`, `None` when nothing parses.
    fn read_line(&mut self, video: &[u8], format: &VideoFormat, line: u16) -> Option<u32>;
}

/// One reading from an audio timecode decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioTimecode {
    pub word: u32,
    /// The decoder needed samples from this frame to confirm the sync word,
    /// so the value belongs to the frame before.
    pub previous_frame: bool,
}

/// Stateful LTC-style decoder fed one frame of samples at a time
pub trait AudioTimecodeDecoder: Send {
    fn decode(&mut self, samples: &[i32]) -> Option<AudioTimecode>;

    /// Forget partial state, e.g. after capture resumes from a gap
    fn reset(&mut self) {}
}

/// Result of extracting one timecode stream for the current frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Extracted {
    pub current: Option<Timecode>,
    /// Value that belongs to the previous (still unpublished) frame
    pub previous: Option<Timecode>,
}

/// Runs the configured policy against each captured frame
pub struct TimecodeExtractor {
    policy: TimecodePolicy,
    rate: u8,
    vbi_reader: Option<Box<dyn VbiTimecodeReader>>,
    vitc_audio: Option<Box<dyn AudioTimecodeDecoder>>,
    ltc_audio: Option<Box<dyn AudioTimecodeDecoder>>,
    scratch: Vec<i32>,
}

impl TimecodeExtractor {
    pub fn new(
        policy: TimecodePolicy,
        rate: u8,
        vbi_reader: Option<Box<dyn VbiTimecodeReader>>,
        vitc_audio: Option<Box<dyn AudioTimecodeDecoder>>,
        ltc_audio: Option<Box<dyn AudioTimecodeDecoder>>,
    ) -> Self {
        for (name, source) in [("VITC", &policy.vitc), ("LTC", &policy.ltc)] {
            let missing = match source {
                TimecodeSource::VbiLines { .. } => vbi_reader.is_none(),
                TimecodeSource::AudioTrack { .. } if name == "VITC" => vitc_audio.is_none(),
                TimecodeSource::AudioTrack { .. } => ltc_audio.is_none(),
                _ => false,
            };
            if missing {
                log::warn!("{} source {:?} has no decoder, {} will be unknown", name, source, name);
            }
        }

        Self {
            policy,
            rate,
            vbi_reader,
            vitc_audio,
            ltc_audio,
            scratch: Vec::new(),
        }
    }

    pub fn extract_vitc(&mut self, frame: &HardwareFrame<'_>, format: &VideoFormat) -> Extracted {
        let hardware = select_field_vitc(frame.vitc[0], frame.vitc[1]);
        Self::extract(
            &self.policy.vitc,
            hardware,
            self.rate,
            frame,
            format,
            &mut self.vbi_reader,
            &mut self.vitc_audio,
            &mut self.scratch,
        )
    }

    pub fn extract_ltc(&mut self, frame: &HardwareFrame<'_>, format: &VideoFormat) -> Extracted {
        Self::extract(
            &self.policy.ltc,
            frame.ltc,
            self.rate,
            frame,
            format,
            &mut self.vbi_reader,
            &mut self.ltc_audio,
            &mut self.scratch,
        )
    }

    /// Reset decoder state after a capture gap
    pub fn reset(&mut self) {
        if let Some(decoder) = self.vitc_audio.as_mut() {
            decoder.reset();
        }
        if let Some(decoder) = self.ltc_audio.as_mut() {
            decoder.reset();
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn extract(
        source: &TimecodeSource,
        hardware: Option<u32>,
        rate: u8,
        frame: &HardwareFrame<'_>,
        format: &VideoFormat,
        vbi_reader: &mut Option<Box<dyn VbiTimecodeReader>>,
        audio: &mut Option<Box<dyn AudioTimecodeDecoder>>,
        scratch: &mut Vec<i32>,
    ) -> Extracted {
        match source {
            TimecodeSource::Disabled => Extracted::default(),
            TimecodeSource::Hardware => Extracted {
                current: hardware.and_then(|w| Timecode::from_bcd(w, rate)),
                previous: None,
            },
            TimecodeSource::VbiLines { lines } => {
                let Some(reader) = vbi_reader.as_mut() else {
                    return Extracted::default();
                };
                let current = lines.iter().find_map(|&line| {
                    let word = reader.read_line(frame.video, format, line)?;
                    if line_is_flat(frame.video, format, line) {
                        return None;
                    }
                    Timecode::from_bcd(word, rate)
                });
                Extracted { current, previous: None }
            }
            TimecodeSource::AudioTrack { channel } => {
                let Some(decoder) = audio.as_mut() else {
                    return Extracted::default();
                };
                if !channel_samples(frame.audio, *channel, scratch) {
                    return Extracted::default();
                }
                match decoder.decode(scratch) {
                    Some(reading) => {
                        let tc = Timecode::from_bcd(reading.word, rate);
                        if reading.previous_frame {
                            Extracted { current: None, previous: tc }
                        } else {
                            Extracted { current: tc, previous: None }
                        }
                    }
                    None => Extracted::default(),
                }
            }
        }
    }
}

/// True when a picture line is uniformly black or grey.
///
/// Only the luma samples are considered. A flat line can't carry a VITC
/// waveform, so a decode from it is a false positive.
pub fn line_is_flat(video: &[u8], format: &VideoFormat, line: u16) -> bool {
    let stride = format.line_stride();
    let start = line as usize * stride;
    let Some(row) = video.get(start..start + stride) else {
        return true;
    };

    let (min, max) = match format.pixel_format {
        PixelFormat::Uyvy8 => row
            .iter()
            .skip(1)
            .step_by(2)
            .fold((u16::MAX, 0u16), |(lo, hi), &y| (lo.min(y as u16), hi.max(y as u16))),
        PixelFormat::Uyvy10 => row
            .chunks_exact(2)
            .skip(1)
            .step_by(2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]) >> 2)
            .fold((u16::MAX, 0u16), |(lo, hi), y| (lo.min(y), hi.max(y))),
    };

    max.saturating_sub(min) <= FLAT_LINE_TOLERANCE
}

/// Pull one channel out of the interleaved 32-bit stereo pair buffers.
/// Returns false if the channel doesn't exist.
pub fn channel_samples(audio: &[Vec<u8>], channel: u8, out: &mut Vec<i32>) -> bool {
    let pair = channel as usize / 2;
    let side = channel as usize % 2;
    let Some(buf) = audio.get(pair) else {
        return false;
    };

    out.clear();
    out.extend(
        buf.chunks_exact(8)
            .map(|s| {
                let o = side * 4;
                i32::from_le_bytes([s[o], s[o + 1], s[o + 2], s[o + 3]])
            }),
    );
    true
}
