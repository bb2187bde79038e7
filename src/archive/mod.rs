// Lossless archive path: writer interface, the store thread, reports

pub mod analysis;
pub mod raw;
pub mod report;
pub(crate) mod store;

pub use analysis::{
    Dropout, DropoutDetector, DropoutDetectorFactory, DropoutThresholds, HazardAnalyzer,
    HazardAnalyzerFactory, HazardResult, HazardVerdict,
};
pub use raw::RawArchiveWriterFactory;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::capture::{Timecode, VideoFormat};

/// Error type for archive writers
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("Failed to create archive {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Archive write failed: {0}")]
    Write(String),

    #[error("Archive completion failed: {0}")]
    Complete(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Metadata serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ArchiveError>;

/// Parameters the writer needs to lay out its container
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArchiveFormat {
    pub video: VideoFormat,
    /// Split output into pages of at most this many bytes (multi-item mode)
    pub page_size: Option<u64>,
}

/// One frame's worth of essence handed to the writer
#[derive(Debug)]
pub struct ContentPackage<'a> {
    /// Frame offset from the start of the session
    pub position: u64,
    pub video: &'a [u8],
    pub audio: &'a [Vec<u8>],
    pub vitc: Option<Timecode>,
    pub ltc: Option<Timecode>,
}

/// Catalogue metadata for the source item, supplied at stop
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub item_id: String,
    pub title: String,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

/// An error reported by the source tape machine during playback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VtrError {
    /// Frame offset from the start of the session
    pub position: u64,
    pub code: u8,
    pub description: String,
}

/// Everything a writer records when a session completes
#[derive(Debug, Serialize)]
pub struct Completion<'a> {
    pub frames: u64,
    pub metadata: &'a SourceMetadata,
    pub hazard_verdict: HazardVerdict,
    pub hazard_results: &'a [HazardResult],
    pub dropouts: &'a [Dropout],
    pub vtr_errors: &'a [VtrError],
}

/// Archive container writer for one session
pub trait ArchiveWriter: Send {
    fn write_frame(&mut self, package: &ContentPackage<'_>) -> Result<()>;

    /// Finalise the container with session metadata
    fn complete(self: Box<Self>, completion: &Completion<'_>) -> Result<()>;

    /// Discard the output, removing any files written
    fn abort(self: Box<Self>) -> Result<()>;

    fn bytes_written(&self) -> u64;
}

pub trait ArchiveWriterFactory: Send + Sync {
    fn create(&self, path: &Path, format: &ArchiveFormat) -> Result<Box<dyn ArchiveWriter>>;
}
