// crates/tapecut-media/src/probe.rs
//
// In-process FFmpeg probing: container duration (with stream fallback),
// video geometry and rate, audio rate and channel count.

use std::path::Path;

use ffmpeg_the_third as ffmpeg;
use ffmpeg::format::{context::Input, input};
use ffmpeg::media::Type;

use tapecut_core::media_types::MediaInfo;
use tapecut_core::{EngineError, Result};

use crate::helpers::frame::rate_to_f64;

/// Open `path` just long enough to read its `MediaInfo`.
pub fn probe(path: &Path) -> Result<MediaInfo> {
    crate::init();
    let ictx = input(path).map_err(|e| EngineError::UnreadableMedia {
        path:   path.to_path_buf(),
        reason: e.to_string(),
    })?;
    Ok(read_info(path, &ictx))
}

/// Read everything `MediaInfo` holds from an already-open demuxer.
pub fn read_info(path: &Path, ictx: &Input) -> MediaInfo {
    let mut info = MediaInfo {
        path:        path.to_path_buf(),
        format_name: ictx.format().name().to_string(),
        duration:    duration_secs(ictx),
        ..Default::default()
    };

    if let Some(stream) = ictx.streams().best(Type::Video) {
        info.has_video  = true;
        info.frame_rate = rate_to_f64(stream.avg_frame_rate())
            .or_else(|| rate_to_f64(stream.rate()));
        let (w, h, bit_rate) = unsafe {
            let p = stream.parameters().as_ptr();
            ((*p).width, (*p).height, (*p).bit_rate)
        };
        info.width  = w.max(0) as u32;
        info.height = h.max(0) as u32;
        info.video_bitrate = (bit_rate > 0).then_some(bit_rate as u64);
        info.pixel_format = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .and_then(|ctx| ctx.decoder().video())
            .ok()
            .and_then(|dec| dec.format().descriptor())
            .map(|d| d.name().to_string());
    }

    if let Some(stream) = ictx.streams().best(Type::Audio) {
        info.has_audio = true;
        let (rate, channels) = unsafe {
            let p = stream.parameters().as_ptr();
            ((*p).sample_rate, (*p).ch_layout.nb_channels)
        };
        info.sample_rate = (rate > 0).then_some(rate as u32);
        info.channels    = channels.max(0) as u16;
    }

    tracing::debug!(
        path = %path.display(),
        format = %info.format_name,
        duration = ?info.duration,
        video = info.has_video,
        audio = info.has_audio,
        "probed"
    );
    info
}

/// Container duration in seconds, falling back to the best stream's own
/// duration. `None` when neither is positive.
pub fn duration_secs(ictx: &Input) -> Option<f64> {
    let dur = ictx.duration() as f64 / ffmpeg::ffi::AV_TIME_BASE as f64;
    if dur > 0.0 {
        return Some(dur);
    }
    let stream = ictx
        .streams()
        .best(Type::Video)
        .or_else(|| ictx.streams().best(Type::Audio))?;
    let d = stream.duration() as f64 * f64::from(stream.time_base());
    (d > 0.0).then_some(d)
}
