// Configuration management for the ingest recorder

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::archive::DropoutThresholds;
use crate::capture::TimecodePolicy;

/// Rejected configuration values
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("ring_capacity must be at least 3, got {0}")]
    RingTooSmall(usize),

    #[error("post_error_good_frames ({post_error}) must be greater than initial_good_frames ({initial})")]
    GoodFrames { initial: u32, post_error: u32 },

    #[error("browse_overflow_frames must be at least 1")]
    NoBrowseOverflowFrames,

    #[error("frame_rate must be non-zero")]
    ZeroFrameRate,

    #[error("multi_item_page_size_bytes must be non-zero")]
    ZeroPageSize,
}

/// Recorder configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecorderConfig {
    /// Frames held in the capture ring (5 seconds at 25fps by default)
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,

    /// Frame rate the capture source must deliver
    #[serde(default = "default_frame_rate")]
    pub frame_rate: u8,

    /// Consecutive good frames required before capture delivers at startup
    #[serde(default = "default_initial_good_frames")]
    pub initial_good_frames: u32,

    /// Consecutive good frames required after a dropped frame or pull failure
    #[serde(default = "default_post_error_good_frames")]
    pub post_error_good_frames: u32,

    /// Black frames substituted when the browse path falls a ring behind
    #[serde(default = "default_browse_overflow_frames")]
    pub browse_overflow_frames: u64,

    #[serde(default = "default_true")]
    pub browse_enabled: bool,

    #[serde(default = "default_browse_bitrate_kbps")]
    pub browse_bitrate_kbps: u32,

    #[serde(default = "default_browse_thread_count")]
    pub browse_thread_count: u32,

    #[serde(default = "default_true")]
    pub hazard_analysis_enabled: bool,

    #[serde(default)]
    pub dropout_thresholds: DropoutThresholds,

    /// Where VITC and LTC come from. Fixed when capture is initialised.
    #[serde(default)]
    pub timecode_policy: TimecodePolicy,

    /// Longest a consumer thread sleeps before re-checking its stop conditions
    #[serde(default = "default_consumer_wait_timeout_ms")]
    pub consumer_wait_timeout_ms: u64,

    /// Signal status poll period while capture is suspended
    #[serde(default = "default_signal_poll_interval_ms")]
    pub signal_poll_interval_ms: u64,

    /// How often a blocked stop call re-checks the pipeline
    #[serde(default = "default_stop_poll_interval_ms")]
    pub stop_poll_interval_ms: u64,

    /// A stop waiting on frames that never arrive gives up after this long
    /// without capture progress and stops at the last captured frame
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,

    #[serde(default = "default_true")]
    pub realtime_priority: bool,

    /// Refuse to start when the archive volume has less free space (0 = off)
    #[serde(default)]
    pub min_free_space_bytes: u64,

    /// Page size for multi-item archives (1 GiB by default)
    #[serde(default = "default_multi_item_page_size_bytes")]
    pub multi_item_page_size_bytes: u64,

    /// Frames between progress log lines (0 = off)
    #[serde(default = "default_progress_log_interval")]
    pub progress_log_interval: u64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            ring_capacity: default_ring_capacity(),
            frame_rate: default_frame_rate(),
            initial_good_frames: default_initial_good_frames(),
            post_error_good_frames: default_post_error_good_frames(),
            browse_overflow_frames: default_browse_overflow_frames(),
            browse_enabled: true,
            browse_bitrate_kbps: default_browse_bitrate_kbps(),
            browse_thread_count: default_browse_thread_count(),
            hazard_analysis_enabled: true,
            dropout_thresholds: DropoutThresholds::default(),
            timecode_policy: TimecodePolicy::default(),
            consumer_wait_timeout_ms: default_consumer_wait_timeout_ms(),
            signal_poll_interval_ms: default_signal_poll_interval_ms(),
            stop_poll_interval_ms: default_stop_poll_interval_ms(),
            stop_timeout_secs: default_stop_timeout_secs(),
            realtime_priority: true,
            min_free_space_bytes: 0,
            multi_item_page_size_bytes: default_multi_item_page_size_bytes(),
            progress_log_interval: default_progress_log_interval(),
        }
    }
}

impl RecorderConfig {
    /// Load config from disk or return default
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(contents) => match toml::from_str(&contents) {
                    Ok(config) => return config,
                    Err(e) => {
                        log::warn!("Failed to parse config {}: {}", path.display(), e);
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read config file {}: {}", path.display(), e);
                }
            }
        }

        Self::default()
    }

    /// Save config to disk
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ring_capacity < 3 {
            return Err(ConfigError::RingTooSmall(self.ring_capacity));
        }
        if self.post_error_good_frames <= self.initial_good_frames {
            return Err(ConfigError::GoodFrames {
                initial: self.initial_good_frames,
                post_error: self.post_error_good_frames,
            });
        }
        if self.browse_overflow_frames == 0 {
            return Err(ConfigError::NoBrowseOverflowFrames);
        }
        if self.frame_rate == 0 {
            return Err(ConfigError::ZeroFrameRate);
        }
        if self.multi_item_page_size_bytes == 0 {
            return Err(ConfigError::ZeroPageSize);
        }
        Ok(())
    }

    pub fn consumer_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.consumer_wait_timeout_ms.max(1))
    }

    pub fn signal_poll_interval(&self) -> Duration {
        Duration::from_millis(self.signal_poll_interval_ms.max(1))
    }

    pub fn stop_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stop_poll_interval_ms.max(1))
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

/// Get the default config file path
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ingest-recorder")
        .join("config.toml")
}

fn default_ring_capacity() -> usize {
    125
}

fn default_frame_rate() -> u8 {
    25
}

fn default_initial_good_frames() -> u32 {
    10
}

fn default_post_error_good_frames() -> u32 {
    32
}

fn default_browse_overflow_frames() -> u64 {
    50
}

fn default_browse_bitrate_kbps() -> u32 {
    2700
}

fn default_browse_thread_count() -> u32 {
    4
}

fn default_consumer_wait_timeout_ms() -> u64 {
    40
}

fn default_signal_poll_interval_ms() -> u64 {
    20
}

fn default_stop_poll_interval_ms() -> u64 {
    10
}

fn default_stop_timeout_secs() -> u64 {
    30
}

fn default_multi_item_page_size_bytes() -> u64 {
    1 << 30
}

fn default_progress_log_interval() -> u64 {
    250
}

/// Default true value (for serde)
fn default_true() -> bool {
    true
}
