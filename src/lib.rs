// Ingest Recorder - SDI capture to lossless archive and browse proxy
// Main library entry point

pub mod archive;
pub mod browse;
pub mod capture;
pub mod config;
pub mod recording;

#[cfg(test)]
mod testing;

pub use archive::{RawArchiveWriterFactory, SourceMetadata, VtrError};
pub use capture::{CaptureSource, SyntheticSource, Timecode, VideoFormat};
pub use config::RecorderConfig;
pub use recording::{
    Collaborators, FrameDecoders, GeneralStats, RecordError, RecordStats, Recorder, RecordingStatus,
    StartRequest, StopSummary,
};
