//! Session configuration: source location, sequence layout, scheduler caps.
//!
//! A `PipelineConfig` is immutable for the lifetime of one streaming session
//! (one "generation"). Control commands build a modified copy, validate it,
//! and replace the whole configuration through a full pipeline reset — the
//! config is never mutated piecemeal while a session is ticking.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors are fatal at session start: the pipeline must not
/// begin ticking with an invalid config.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("sequence length must be at least 1")]
    EmptySequence,

    #[error("batch size must be at least 1")]
    ZeroBatchSize,

    #[error("at least one download slot is required")]
    ZeroDownloadSlots,

    #[error("at least one decode slot is required")]
    ZeroDecodeSlots,

    #[error("frame rate must be greater than zero (got {0})")]
    InvalidFrameRate(f64),

    #[error("quality list is empty")]
    NoQualities,

    #[error("quality index {index} out of range ({count} variants)")]
    QualityOutOfRange { index: usize, count: usize },

    #[error("host must not be empty")]
    EmptyHost,
}

/// Where the frame files live: `{scheme}://{host}:{port}/{quality}/`.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    /// Server-side path prefixes, one per quality variant.
    pub qualities: Vec<String>,
    /// Index into `qualities` selecting the active variant.
    pub quality: usize,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            scheme: "https".to_string(),
            host: "localhost".to_string(),
            port: 443,
            qualities: vec!["draco".to_string()],
            quality: 0,
        }
    }
}

impl SourceConfig {
    /// Base URL for the active quality variant, always with a trailing slash.
    pub fn base_url(&self) -> String {
        let quality = self.qualities.get(self.quality).map(String::as_str).unwrap_or("");
        let mut url = format!("{}://{}:{}/{}", self.scheme, self.host, self.port, quality);
        if !url.ends_with('/') {
            url.push('/');
        }
        url
    }
}

/// Full per-session configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub source: SourceConfig,

    /// Number of frames in the sequence (N).
    pub frame_count: usize,
    /// Numeric offset of the first frame file name.
    pub first_number: u32,
    /// File extension of the frame assets, including the dot.
    pub extension: String,

    /// Target number of frames per download batch.
    pub batch_size: usize,
    /// Maximum concurrently running fetch batches.
    pub max_parallel_batches: usize,
    /// Maximum concurrently running decode operations.
    pub max_parallel_decodes: usize,
    /// Backpressure cap on frames held past `None`. `None` selects the
    /// default of `min(frame_count / 3, batch_size * 2)`.
    pub max_buffered_frames: Option<usize>,

    /// Target playback rate in frames per second.
    pub fps: f64,
    /// How long the playback cursor may sit still before the watchdog skips.
    pub stall_threshold_ms: u64,
    /// Interval between `[state]` snapshot log lines (0 disables).
    pub snapshot_interval_ms: u64,
    /// Consecutive decode failures after which an index is quarantined
    /// until the playback cursor completes a lap.
    pub max_decode_retries: u8,

    /// Directory frame files are downloaded into.
    pub download_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            source: SourceConfig::default(),
            frame_count: 300,
            first_number: 1000,
            extension: ".drc".to_string(),
            batch_size: 30,
            max_parallel_batches: 3,
            max_parallel_decodes: 4,
            max_buffered_frames: None,
            fps: 30.0,
            stall_threshold_ms: 2000,
            snapshot_interval_ms: 1000,
            max_decode_retries: 3,
            download_dir: default_download_dir(),
        }
    }
}

/// Default frame download directory, under the user cache dir (temp dir
/// when the platform has none).
pub fn default_download_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("volustream")
        .join("frames")
}

impl PipelineConfig {
    /// Reject configurations the pipeline must not start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frame_count == 0 {
            return Err(ConfigError::EmptySequence);
        }
        if self.batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if self.max_parallel_batches == 0 {
            return Err(ConfigError::ZeroDownloadSlots);
        }
        if self.max_parallel_decodes == 0 {
            return Err(ConfigError::ZeroDecodeSlots);
        }
        if !(self.fps > 0.0) {
            return Err(ConfigError::InvalidFrameRate(self.fps));
        }
        if self.source.host.is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if self.source.qualities.is_empty() {
            return Err(ConfigError::NoQualities);
        }
        if self.source.quality >= self.source.qualities.len() {
            return Err(ConfigError::QualityOutOfRange {
                index: self.source.quality,
                count: self.source.qualities.len(),
            });
        }
        Ok(())
    }

    /// File name of frame `index`, e.g. `1042.drc`.
    pub fn frame_name(&self, index: usize) -> String {
        format!("{}{}", self.first_number as usize + index, self.extension)
    }

    /// Effective backpressure cap.
    pub fn buffer_cap(&self) -> usize {
        self.max_buffered_frames
            .unwrap_or_else(|| (self.frame_count / 3).min(self.batch_size * 2))
            .max(1)
    }

    /// Bounded scan window for the decode scheduler.
    pub fn decode_scan_window(&self) -> usize {
        self.frame_count.min(self.batch_size * 2)
    }

    /// Target interval between presented frames. `validate()` guarantees
    /// a positive rate, so the division is always finite.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps)
    }

    /// Watchdog stall threshold.
    pub fn stall_threshold(&self) -> Duration {
        Duration::from_millis(self.stall_threshold_ms)
    }
}
