// crates/tapecut-core/src/error.rs
//
// Error type shared by every tapecut crate.
//
// Containment rules:
//   UnreadableMedia:        fatal to one session, never retried.
//   ZeroOrUnknownDuration:  degraded, the caller picks a fallback duration.
//   FrameGrabFailure:       one preview request gave up; the session lives on.
//   ExportFailed:           one task failed; sibling tasks keep running.

use std::path::PathBuf;

use thiserror::Error;

use crate::task::TaskState;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("unreadable media '{}': {reason}", path.display())]
    UnreadableMedia { path: PathBuf, reason: String },

    #[error("zero or unknown duration reported by '{}'", path.display())]
    ZeroOrUnknownDuration { path: PathBuf },

    #[error("no frame decoded at {timestamp:.3}s after {attempts} attempts")]
    FrameGrabFailure { timestamp: f64, attempts: u32 },

    #[error("export to '{}' failed: {reason}", output.display())]
    ExportFailed { output: PathBuf, reason: String },

    #[error("invalid trim range: start {start}s must be before end {end}s")]
    InvalidRange { start: f64, end: f64 },

    #[error("invalid output file name: {0:?}")]
    InvalidOutputName(String),

    #[error("nothing to export: the queue is empty")]
    NothingToExport,

    #[error("a batch is already running on this queue")]
    BatchInProgress,

    #[error("task cannot move from {from:?} to {to:?}")]
    InvalidTransition { from: TaskState, to: TaskState },

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse configuration file {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("invalid configuration value: {key} = {value}")]
    InvalidValue { key: String, value: String },
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    pub fn export_failed(output: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::ExportFailed { output: output.into(), reason: reason.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_path() {
        let e = EngineError::UnreadableMedia {
            path:   PathBuf::from("/tapes/vhs-01.avi"),
            reason: "Invalid data found when processing input".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("vhs-01.avi"));
        assert!(msg.contains("Invalid data"));
    }
}
