// crates/tapecut-media/src/lib.rs
//
// Everything that touches FFmpeg. Front-ends talk to this crate through
// MediaSession, PreviewService and TrimExporter only; plain data types live
// in tapecut-core.

pub mod helpers;
pub mod preview;
pub mod probe;
pub mod session;
pub mod trim;

use std::sync::Once;

use ffmpeg_the_third as ffmpeg;

pub use preview::PreviewService;
pub use probe::probe;
pub use session::{FrameIter, MediaSession};
pub use trim::TrimExporter;

static INIT: Once = Once::new();

/// Initialise libav once per process. Called by every entry point that opens
/// media, so front-ends never need to.
pub fn init() {
    INIT.call_once(|| {
        if let Err(e) = ffmpeg::init() {
            tracing::error!(error = %e, "ffmpeg init failed");
        }
    });
}

/// Lower libav's own console logging to errors only.
pub fn quiet_ffmpeg_logs() {
    ffmpeg::util::log::set_level(ffmpeg::util::log::Level::Error);
}
