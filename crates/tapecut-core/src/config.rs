// crates/tapecut-core/src/config.rs
//
// Engine configuration, loaded from TOML. Every field has a default so an
// empty file (or no file at all) yields a working engine.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// Main configuration for the trim/export engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub preview: PreviewConfig,
    pub export:  ExportConfig,
    pub queue:   QueueConfig,
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path:   path.display().to_string(),
            reason: e.to_string(),
        })?;
        let config = Self::from_toml_str(&content).map_err(|e| match e {
            crate::EngineError::Config(ConfigError::Parse { reason, .. }) => ConfigError::Parse {
                path: path.display().to_string(),
                reason,
            }
            .into(),
            other => other,
        })?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path:   "<inline>".to_string(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| {
            ConfigError::InvalidValue { key: "config".to_string(), value: e.to_string() }.into()
        })
    }

    pub fn validate(&self) -> Result<()> {
        self.preview.validate()?;
        self.export.validate()?;
        self.queue.validate()?;
        Ok(())
    }
}

/// Preview decode and display sizes.
///
/// Frames are decoded at `decode_*` (cheap) and then fitted into the
/// `preview_*` box for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewConfig {
    pub decode_width:      u32,
    pub decode_height:     u32,
    pub preview_width:     u32,
    pub preview_height:    u32,
    /// Decode failures tolerated per grab before giving up with "no frame".
    pub max_grab_attempts: u32,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            decode_width:      320,
            decode_height:     180,
            preview_width:     480,
            preview_height:    270,
            max_grab_attempts: 5,
        }
    }
}

impl PreviewConfig {
    pub fn decode_size(&self) -> (u32, u32) {
        (self.decode_width, self.decode_height)
    }

    pub fn preview_size(&self) -> (u32, u32) {
        (self.preview_width, self.preview_height)
    }

    fn validate(&self) -> Result<()> {
        for (key, v) in [
            ("preview.decode_width",      self.decode_width),
            ("preview.decode_height",     self.decode_height),
            ("preview.preview_width",     self.preview_width),
            ("preview.preview_height",    self.preview_height),
            ("preview.max_grab_attempts", self.max_grab_attempts),
        ] {
            if v == 0 {
                return Err(invalid(key, v));
            }
        }
        Ok(())
    }
}

/// Encoder settings for trimmed and joined output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Used when the source video stream does not report a bitrate.
    pub fallback_video_bitrate: u64,
    pub audio_bitrate:          u64,
    pub x264_preset:            String,
    /// Used when the source reports no usable average frame rate.
    pub fallback_frame_rate:    f64,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            fallback_video_bitrate: 10_000_000,
            audio_bitrate:          128_000,
            x264_preset:            "fast".to_string(),
            fallback_frame_rate:    30.0,
        }
    }
}

impl ExportConfig {
    fn validate(&self) -> Result<()> {
        if self.fallback_video_bitrate == 0 {
            return Err(invalid("export.fallback_video_bitrate", 0));
        }
        if self.audio_bitrate == 0 {
            return Err(invalid("export.audio_bitrate", 0));
        }
        if !(self.fallback_frame_rate.is_finite() && self.fallback_frame_rate > 0.0) {
            return Err(invalid("export.fallback_frame_rate", self.fallback_frame_rate));
        }
        if self.x264_preset.trim().is_empty() {
            return Err(invalid("export.x264_preset", "\"\""));
        }
        Ok(())
    }
}

/// Worker-pool limits for batch exports.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Upper bound on worker threads, in addition to hardware parallelism.
    pub max_workers:       Option<usize>,
    /// Per-task wall-clock limit. Unset means no limit.
    pub task_timeout_secs: Option<u64>,
}

impl QueueConfig {
    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_secs.map(Duration::from_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.max_workers == Some(0) {
            return Err(invalid("queue.max_workers", 0));
        }
        if self.task_timeout_secs == Some(0) {
            return Err(invalid("queue.task_timeout_secs", 0));
        }
        Ok(())
    }
}

fn invalid(key: &str, value: impl ToString) -> crate::EngineError {
    ConfigError::InvalidValue { key: key.to_string(), value: value.to_string() }.into()
}
