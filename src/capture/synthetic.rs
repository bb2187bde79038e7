// Synthetic SDI source
//
// Generates colour bars with a moving stripe, silent audio and BCD VITC/LTC
// counting up from a start timecode. Frames are paced at the frame period
// unless told otherwise. A FaultScript injects dropped frames, pull failures
// and signal loss at given source frame indices.

use std::time::{Duration, Instant};

use super::timecode::{Timecode, FIELD_MARK};
use super::{CaptureError, CaptureSource, HardwareFrame, PixelFormat, Result, SignalStatus, VideoFormat};

/// 75% colour bars as (Y, Cb, Cr), left to right
const BARS: [(u8, u8, u8); 8] = [
    (180, 128, 128),
    (162, 44, 142),
    (131, 156, 44),
    (112, 72, 58),
    (84, 184, 198),
    (65, 100, 212),
    (35, 212, 114),
    (16, 128, 128),
];

const STRIPE_WIDTH: u32 = 8;

/// Faults to inject, keyed by the source's own pull index
#[derive(Debug, Clone, Default)]
pub struct FaultScript {
    /// Pulls that report a dropped frame
    pub drop_at: Vec<u64>,
    /// Pulls that fail outright
    pub fail_at: Vec<u64>,
    /// Pull index at which video goes away
    pub signal_loss_at: Option<u64>,
    /// Number of status polls that report the loss before video returns
    pub signal_loss_polls: u32,
}

pub struct SyntheticSource {
    format: VideoFormat,
    start: Timecode,
    period: Option<Duration>,
    faults: FaultScript,
    opened: bool,
    running: bool,
    pulled: u64,
    loss_polls_left: Option<u32>,
    next_deadline: Option<Instant>,
    bars: Vec<u8>,
    video: Vec<u8>,
    audio: Vec<Vec<u8>>,
}

impl SyntheticSource {
    pub fn new(format: VideoFormat, start: Timecode) -> Self {
        let period = Duration::from_secs(1) / format.frame_rate.max(1) as u32;
        Self {
            format,
            start,
            period: Some(period),
            faults: FaultScript::default(),
            opened: false,
            running: false,
            pulled: 0,
            loss_polls_left: None,
            next_deadline: None,
            bars: Vec::new(),
            video: Vec::new(),
            audio: Vec::new(),
        }
    }

    /// Deliver frames at `period` instead of the real frame period
    pub fn with_frame_period(mut self, period: Duration) -> Self {
        self.period = Some(period);
        self
    }

    /// Deliver frames as fast as they are pulled
    pub fn unpaced(mut self) -> Self {
        self.period = None;
        self
    }

    pub fn with_faults(mut self, faults: FaultScript) -> Self {
        self.faults = faults;
        self
    }

    fn render_bars(&mut self) {
        let f = &self.format;
        let mut line = Vec::with_capacity(f.line_stride());
        for x in (0..f.width).step_by(2) {
            let (y, cb, cr) = BARS[(x * BARS.len() as u32 / f.width.max(1)) as usize];
            push_pair(&mut line, f.pixel_format, [cb, y, cr, y]);
        }
        self.bars = line.repeat(f.height as usize);
    }

    fn render_frame(&mut self, index: u64) {
        self.video.copy_from_slice(&self.bars);

        let f = self.format;
        let stride = f.line_stride();
        let bpp = f.pixel_format.bytes_per_pixel();
        let x0 = ((index * STRIPE_WIDTH as u64) % f.width.max(1) as u64) as u32 & !1;
        let x1 = (x0 + STRIPE_WIDTH).min(f.width);

        let mut white = Vec::with_capacity(4);
        push_pair(&mut white, f.pixel_format, [128, 235, 128, 235]);
        for row in self.video.chunks_exact_mut(stride) {
            for x in (x0..x1).step_by(2) {
                let at = x as usize * bpp;
                row[at..at + white.len()].copy_from_slice(&white);
            }
        }
    }

    fn pace(&mut self) {
        let Some(period) = self.period else {
            return;
        };
        let now = Instant::now();
        let deadline = self.next_deadline.unwrap_or(now);
        if deadline > now {
            std::thread::sleep(deadline - now);
        }
        // Don't try to catch up after a long stall
        let next = deadline + period;
        self.next_deadline = Some(if next < now { now + period } else { next });
    }
}

fn push_pair(out: &mut Vec<u8>, pixel_format: PixelFormat, samples: [u8; 4]) {
    match pixel_format {
        PixelFormat::Uyvy8 => out.extend_from_slice(&samples),
        PixelFormat::Uyvy10 => {
            for s in samples {
                out.extend_from_slice(&((s as u16) << 2).to_le_bytes());
            }
        }
    }
}

impl CaptureSource for SyntheticSource {
    fn open(&mut self) -> Result<VideoFormat> {
        if self.format.width == 0 || self.format.height == 0 || self.format.width % 2 != 0 {
            return Err(CaptureError::ModeSet(format!(
                "{}x{} is not a valid 4:2:2 raster",
                self.format.width, self.format.height
            )));
        }
        self.render_bars();
        self.video = vec![0; self.format.video_size()];
        self.audio = vec![vec![0; self.format.audio_pair_size()]; self.format.audio_pairs as usize];
        self.opened = true;
        log::info!(
            "Synthetic source opened: {}x{} {:?} @ {}fps, VITC from {}",
            self.format.width,
            self.format.height,
            self.format.pixel_format,
            self.format.frame_rate,
            self.start
        );
        Ok(self.format)
    }

    fn start_input(&mut self) -> Result<()> {
        if !self.opened {
            return Err(CaptureError::Input("source not opened".into()));
        }
        self.running = true;
        self.next_deadline = None;
        Ok(())
    }

    fn stop_input(&mut self) -> Result<()> {
        self.running = false;
        Ok(())
    }

    fn pull_next_frame(&mut self) -> Result<HardwareFrame<'_>> {
        if !self.running {
            return Err(CaptureError::NotRunning);
        }
        self.pace();

        let index = self.pulled;
        self.pulled += 1;

        if self.faults.fail_at.contains(&index) {
            return Err(CaptureError::Pull(format!("scripted failure at pull {}", index)));
        }

        self.render_frame(index);
        let word = self.start.offset(index).to_bcd();

        Ok(HardwareFrame {
            video: &self.video,
            audio: &self.audio,
            // Field 1 latched with the field-order flag, as some cards do
            vitc: [Some(word | FIELD_MARK), Some(word)],
            ltc: Some(word),
            dropped: self.faults.drop_at.contains(&index),
        })
    }

    fn signal_status(&mut self) -> SignalStatus {
        if self.loss_polls_left.is_none() && self.faults.signal_loss_at == Some(self.pulled) {
            self.loss_polls_left = Some(self.faults.signal_loss_polls);
            self.faults.signal_loss_at = None;
        }

        let lost = match self.loss_polls_left.as_mut() {
            Some(0) => {
                self.loss_polls_left = None;
                false
            }
            Some(left) => {
                *left -= 1;
                true
            }
            None => false,
        };

        SignalStatus {
            video_ok: self.opened && !lost,
            audio_ok: self.opened && !lost,
            vitc_valid: self.opened && !lost,
            ltc_valid: self.opened && !lost,
        }
    }
}
