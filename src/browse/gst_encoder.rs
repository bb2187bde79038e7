//! GStreamer browse encoder
//!
//! Builds two appsrc branches into one Matroska file:
//! - video: I420 -> x264enc at the configured bitrate and thread count
//! - audio: S16LE stereo 48kHz -> avenc_aac
//!
//! Frames are timestamped from the frame number, so the output has no gaps
//! even when the recorder substitutes black frames.

use std::path::{Path, PathBuf};
use std::sync::Once;

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_audio as gst_audio;
use gstreamer_video as gst_video;

use super::{AspectRatio, BrowseEncoder, BrowseEncoderFactory, BrowseError, BrowseFormat, Result};

static GST_INIT: Once = Once::new();

const AUDIO_RATE: u32 = 48_000;

fn init_gstreamer() -> Result<()> {
    let mut result = Ok(());
    GST_INIT.call_once(|| {
        result = gst::init().map_err(|e| BrowseError::NotAvailable(format!("GStreamer init failed: {}", e)));
        if result.is_ok() {
            log::info!("GStreamer initialized ({})", gst::version_string());
        }
    });
    result
}

fn make(factory: &str) -> Result<gst::Element> {
    gst::ElementFactory::make(factory)
        .build()
        .map_err(|e| BrowseError::NotAvailable(format!("Failed to create {}: {}", factory, e)))
}

/// Creates H.264/AAC Matroska browse files
#[derive(Debug, Clone, Copy, Default)]
pub struct GstBrowseEncoderFactory;

impl BrowseEncoderFactory for GstBrowseEncoderFactory {
    fn create(
        &self,
        path: &Path,
        format: &BrowseFormat,
        aspect: AspectRatio,
        bitrate_kbps: u32,
        thread_count: u32,
    ) -> Result<Box<dyn BrowseEncoder>> {
        init_gstreamer()?;
        Ok(Box::new(GstBrowseEncoder::new(path, format, aspect, bitrate_kbps, thread_count)?))
    }
}

pub struct GstBrowseEncoder {
    path: PathBuf,
    pipeline: gst::Pipeline,
    video_src: gst_app::AppSrc,
    audio_src: gst_app::AppSrc,
    frame_nanos: u64,
}

impl GstBrowseEncoder {
    fn new(
        path: &Path,
        format: &BrowseFormat,
        aspect: AspectRatio,
        bitrate_kbps: u32,
        thread_count: u32,
    ) -> Result<Self> {
        let rate = format.frame_rate.max(1) as i32;
        let (par_n, par_d) = aspect.pixel_aspect(format.width, format.height);

        let video_caps = gst_video::VideoInfo::builder(gst_video::VideoFormat::I420, format.width, format.height)
            .fps(gst::Fraction::new(rate, 1))
            .par(gst::Fraction::new(par_n as i32, par_d as i32))
            .build()
            .and_then(|info| info.to_caps())
            .map_err(|e| BrowseError::Pipeline(format!("Invalid video caps: {}", e)))?;

        let audio_caps = gst_audio::AudioInfo::builder(gst_audio::AudioFormat::S16le, AUDIO_RATE, 2)
            .build()
            .and_then(|info| info.to_caps())
            .map_err(|e| BrowseError::Pipeline(format!("Invalid audio caps: {}", e)))?;

        let video_src = gst_app::AppSrc::builder()
            .name("video")
            .caps(&video_caps)
            .format(gst::Format::Time)
            .build();
        let audio_src = gst_app::AppSrc::builder()
            .name("audio")
            .caps(&audio_caps)
            .format(gst::Format::Time)
            .build();

        let video_queue = make("queue")?;
        let videoconvert = make("videoconvert")?;
        let x264 = make("x264enc")?;
        x264.set_property("bitrate", bitrate_kbps);
        x264.set_property("threads", thread_count);
        x264.set_property_from_str("speed-preset", "veryfast");
        let h264parse = make("h264parse")?;

        let audio_queue = make("queue")?;
        let audioconvert = make("audioconvert")?;
        let aac = make("avenc_aac")?;
        let aacparse = make("aacparse")?;

        let muxer = make("matroskamux")?;
        let filesink = gst::ElementFactory::make("filesink")
            .property("location", path.to_string_lossy().to_string())
            .property("sync", false)
            .build()
            .map_err(|e| BrowseError::Pipeline(format!("Failed to create filesink: {}", e)))?;

        let pipeline = gst::Pipeline::new();
        pipeline
            .add_many([
                video_src.upcast_ref(),
                &video_queue,
                &videoconvert,
                &x264,
                &h264parse,
                audio_src.upcast_ref(),
                &audio_queue,
                &audioconvert,
                &aac,
                &aacparse,
                &muxer,
                &filesink,
            ])
            .map_err(|e| BrowseError::Pipeline(format!("Failed to add elements: {}", e)))?;

        gst::Element::link_many([video_src.upcast_ref(), &video_queue, &videoconvert, &x264, &h264parse, &muxer])
            .map_err(|e| BrowseError::Pipeline(format!("Failed to link video branch: {}", e)))?;
        gst::Element::link_many([audio_src.upcast_ref(), &audio_queue, &audioconvert, &aac, &aacparse, &muxer])
            .map_err(|e| BrowseError::Pipeline(format!("Failed to link audio branch: {}", e)))?;
        muxer
            .link(&filesink)
            .map_err(|e| BrowseError::Pipeline(format!("Failed to link filesink: {}", e)))?;

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| BrowseError::Pipeline(format!("Failed to start pipeline: {:?}", e)))?;

        log::info!(
            "Browse encoder started: {} ({}x{} @ {}fps, {} kbit/s, {} threads)",
            path.display(),
            format.width,
            format.height,
            rate,
            bitrate_kbps,
            thread_count
        );

        Ok(Self {
            path: path.to_path_buf(),
            pipeline,
            video_src,
            audio_src,
            frame_nanos: 1_000_000_000 / rate as u64,
        })
    }

    fn timed_buffer(&self, data: Vec<u8>, frame_number: u64) -> gst::Buffer {
        let mut buffer = gst::Buffer::from_slice(data);
        if let Some(buffer_ref) = buffer.get_mut() {
            buffer_ref.set_pts(gst::ClockTime::from_nseconds(frame_number * self.frame_nanos));
            buffer_ref.set_duration(gst::ClockTime::from_nseconds(self.frame_nanos));
        }
        buffer
    }

    /// Check the bus for an error posted since the last call
    fn check_bus(&self) -> Result<()> {
        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };
        while let Some(msg) = bus.pop_filtered(&[gst::MessageType::Error]) {
            if let gst::MessageView::Error(err) = msg.view() {
                return Err(BrowseError::Pipeline(format!("{} ({:?})", err.error(), err.debug())));
            }
        }
        Ok(())
    }
}

impl BrowseEncoder for GstBrowseEncoder {
    fn encode(&mut self, video: &[u8], audio: &[i16], frame_number: u64) -> Result<()> {
        self.check_bus()?;

        let video_buffer = self.timed_buffer(video.to_vec(), frame_number);
        self.video_src.push_buffer(video_buffer).map_err(|e| BrowseError::Encode {
            frame: frame_number,
            reason: format!("video push: {:?}", e),
        })?;

        let bytes: Vec<u8> = audio.iter().flat_map(|s| s.to_le_bytes()).collect();
        let audio_buffer = self.timed_buffer(bytes, frame_number);
        self.audio_src.push_buffer(audio_buffer).map_err(|e| BrowseError::Encode {
            frame: frame_number,
            reason: format!("audio push: {:?}", e),
        })?;

        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<()> {
        if let Err(e) = self.video_src.end_of_stream() {
            log::warn!("Browse video EOS failed: {:?}", e);
        }
        if let Err(e) = self.audio_src.end_of_stream() {
            log::warn!("Browse audio EOS failed: {:?}", e);
        }

        let mut result = Err(BrowseError::Pipeline("no EOS from browse pipeline".into()));
        if let Some(bus) = self.pipeline.bus() {
            for msg in bus.iter_timed(gst::ClockTime::from_seconds(30)) {
                match msg.view() {
                    gst::MessageView::Eos(..) => {
                        result = Ok(());
                        break;
                    }
                    gst::MessageView::Error(err) => {
                        result = Err(BrowseError::Pipeline(format!("{} ({:?})", err.error(), err.debug())));
                        break;
                    }
                    _ => {}
                }
            }
        }

        self.pipeline.set_state(gst::State::Null).ok();
        match &result {
            Ok(()) => log::info!("Browse file finalised: {}", self.path.display()),
            Err(e) => log::error!("Browse file {} not finalised cleanly: {}", self.path.display(), e),
        }
        result
    }
}

impl Drop for GstBrowseEncoder {
    fn drop(&mut self) {
        self.pipeline.set_state(gst::State::Null).ok();
    }
}
