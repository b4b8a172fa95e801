// crates/tapecut-core/src/lib.rs
//
// Zero FFmpeg dependency. Shared types, configuration, the export task model
// and the batch queue used by tapecut-media and the CLI.

pub mod cancel;
pub mod config;
pub mod error;
pub mod helpers;
pub mod media_types;
pub mod queue;
pub mod task;

pub use cancel::{CancelReason, CancelToken};
pub use config::{EngineConfig, ExportConfig, PreviewConfig, QueueConfig};
pub use error::{ConfigError, EngineError, Result};
pub use media_types::{MediaInfo, PreviewResult, PreviewSlot, PreviewTicket, VideoFrame};
pub use queue::{BatchHandle, BatchSummary, ExportQueue, Exporter, QueueEvent, TaskOutcome};
pub use task::{ExportTask, LinkedRecord, NamingMode, TaskList, BatchEntry, TaskState};
