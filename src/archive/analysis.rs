// Hazard (PSE) analysis and dropout detection collaborators

use serde::{Deserialize, Serialize};

use crate::capture::VideoFormat;

/// Error type for analysis collaborators
#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("Failed to open hazard analyser: {0}")]
    Open(String),

    #[error("Analyser failure: {0}")]
    Failed(String),
}

pub type Result<T> = std::result::Result<T, AnalysisError>;

// ============================================================================
// Hazard analysis
// ============================================================================

/// One flagged position from the hazard analyser
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HazardResult {
    /// Frame offset from the start of the session
    pub position: u64,
    pub red_flash: f32,
    pub luminance_flash: f32,
    pub spatial_pattern: f32,
    /// Failure accumulated over a window longer than one frame
    pub extended_failure: bool,
}

impl HazardResult {
    /// Scores are normalised so that 1.0 is the failure threshold
    pub fn is_failure(&self) -> bool {
        self.red_flash >= 1.0
            || self.luminance_flash >= 1.0
            || self.spatial_pattern >= 1.0
            || self.extended_failure
    }
}

/// Overall hazard outcome of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HazardVerdict {
    #[default]
    NotChecked,
    Passed,
    Failed,
}

impl HazardVerdict {
    pub fn from_results(results: &[HazardResult]) -> Self {
        if results.iter().any(HazardResult::is_failure) {
            HazardVerdict::Failed
        } else {
            HazardVerdict::Passed
        }
    }
}

/// Per-frame PSE analyser, fed 8-bit UYVY
pub trait HazardAnalyzer: Send {
    fn open(&mut self, format: &VideoFormat) -> Result<()>;

    /// Returns false if the analyser could not process the frame
    fn analyse_frame(&mut self, video: &[u8]) -> bool;

    /// Results accumulated since the last drain
    fn drain_results(&mut self) -> Vec<HazardResult>;

    fn close(&mut self);
}

pub trait HazardAnalyzerFactory: Send + Sync {
    fn create(&self) -> Box<dyn HazardAnalyzer>;
}

// ============================================================================
// Dropout detection
// ============================================================================

/// Sensitivity settings for the dropout detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropoutThresholds {
    /// Minimum strength for a frame to be reported
    #[serde(default = "default_min_strength")]
    pub min_strength: u32,
    /// Lines at the top and bottom of the picture to ignore
    #[serde(default = "default_edge_lines")]
    pub edge_lines: u32,
}

fn default_min_strength() -> u32 {
    50
}

fn default_edge_lines() -> u32 {
    16
}

impl Default for DropoutThresholds {
    fn default() -> Self {
        Self {
            min_strength: default_min_strength(),
            edge_lines: default_edge_lines(),
        }
    }
}

/// A detected tape dropout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dropout {
    /// Frame offset from the start of the session
    pub position: u64,
    pub strength: u32,
}

pub trait DropoutDetector: Send {
    fn process_frame(&mut self, video: &[u8], position: u64);

    fn dropout_count(&self) -> usize;

    fn dropouts(&self) -> Vec<Dropout>;
}

pub trait DropoutDetectorFactory: Send + Sync {
    fn create(&self, format: &VideoFormat, thresholds: &DropoutThresholds) -> Box<dyn DropoutDetector>;
}
