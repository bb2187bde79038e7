//! Ingest Recorder demo
//!
//! Records from the synthetic colour-bar source through the full pipeline:
//! capture ring, lossless archive and (with the `gst` feature) an H.264
//! browse copy.
//!
//! Usage:
//!   ingest-recorder [OPTIONS]
//!
//! Options:
//!   --out <dir>         Output directory (default: current directory)
//!   --frames <n>        Session length in frames (default: 250)
//!   --multi-item        Record a page-segmented archive without browse
//!   --config <path>     Config file (default: user config directory)

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use ingest_lib::config::default_config_path;
use ingest_lib::{
    Collaborators, FrameDecoders, RawArchiveWriterFactory, Recorder, RecorderConfig, SourceMetadata,
    StartRequest, SyntheticSource, Timecode, VideoFormat,
};

const DEFAULT_FRAMES: u64 = 250;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    let value_of = |flag: &str| {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .cloned()
    };

    let out_dir = value_of("--out").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
    let frames = match value_of("--frames") {
        Some(s) => s.parse::<u64>().with_context(|| format!("Invalid frame count: {}", s))?,
        None => DEFAULT_FRAMES,
    };
    let multi_item = args.iter().any(|a| a == "--multi-item");
    let config_path = value_of("--config").map(PathBuf::from).unwrap_or_else(default_config_path);

    std::fs::create_dir_all(&out_dir)
        .with_context(|| format!("Failed to create output directory {}", out_dir.display()))?;

    let config = RecorderConfig::load_or_default(&config_path);
    log::info!("Using config {}", config_path.display());
    let ring_capacity = config.ring_capacity;

    let services = Collaborators::new(Arc::new(RawArchiveWriterFactory));
    #[cfg(feature = "gst")]
    let services = services.with_browse(Arc::new(ingest_lib::browse::GstBrowseEncoderFactory));

    let recorder = Recorder::new(config, services)?;

    let start = Timecode::from_hmsf(10, 0, 0, 0, 25).context("Invalid start timecode")?;
    let source = SyntheticSource::new(VideoFormat::pal_625(), start);
    recorder.init_capture(Box::new(source), FrameDecoders::default(), ring_capacity)?;

    let stem = chrono::Local::now().format("ingest_%Y%m%d_%H%M%S").to_string();
    let request = StartRequest::new(out_dir.join(format!("{}.raw", stem)))
        .with_event_log(out_dir.join(format!("{}.log", stem)))
        .with_hazard_report(out_dir.join(format!("{}.pse.txt", stem)))
        .with_browse(
            out_dir.join(format!("{}.mkv", stem)),
            Some(out_dir.join(format!("{}.tc.txt", stem))),
        );

    if multi_item {
        recorder.start_multi_item_record(request)?;
    } else {
        recorder.start_record(request)?;
    }
    println!("Recording {} frames to {}", frames, out_dir.display());

    let metadata = SourceMetadata {
        item_id: stem.clone(),
        title: "Synthetic colour bars".into(),
        ..Default::default()
    };
    let summary = if multi_item {
        recorder.stop_multi_item_record(frames, &metadata, &[])?
    } else {
        recorder.stop_record(frames, &metadata, &[])?
    };

    if !recorder.wait_browse_idle(Duration::from_secs(60)) {
        log::warn!("Browse encode still running after 60s");
    }

    println!("{}", serde_json::to_string_pretty(&summary)?);
    println!("{}", serde_json::to_string_pretty(&recorder.general_stats())?);
    if let Some(stats) = recorder.record_stats() {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    }

    Ok(())
}
