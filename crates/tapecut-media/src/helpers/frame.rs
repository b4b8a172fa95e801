// crates/tapecut-media/src/helpers/frame.rs
//
// Small conversions between ffmpeg frames and tapecut-core types.

use ffmpeg_the_third as ffmpeg;
use ffmpeg::format::Pixel;
use ffmpeg::software::scaling::{context::Context as SwsContext, flag::Flags};
use ffmpeg::util::frame::video::Video;
use ffmpeg::util::rational::Rational;

use tapecut_core::media_types::VideoFrame;

/// Presentation time of a decoded frame in seconds.
///
/// Prefers the best-effort timestamp, which survives streams with missing or
/// reordered PTS (common in AVI captures).
pub fn frame_secs(frame: &Video, time_base: Rational) -> Option<f64> {
    frame
        .timestamp()
        .or_else(|| frame.pts())
        .map(|ts| ts as f64 * f64::from(time_base))
}

/// Rational frame rate as f64, `None` for 0/0 and other unusable values.
pub fn rate_to_f64(rate: Rational) -> Option<f64> {
    if rate.numerator() <= 0 || rate.denominator() <= 0 {
        return None;
    }
    let fps = f64::from(rate);
    (fps.is_finite() && fps > 0.0).then_some(fps)
}

/// Scale a decoded frame to RGBA `(out_w, out_h)` and copy out the visible
/// pixels only (each row exactly `out_w * 4` bytes, no stride padding).
///
/// `scaler` is built on first use from the frame's own format; `src`
/// is the display size, so macroblock padding rows never reach the output.
pub fn to_rgba(
    scaler:    &mut Option<SwsContext>,
    decoded:   &Video,
    src:       (u32, u32),
    out:       (u32, u32),
    timestamp: f64,
) -> Result<VideoFrame, String> {
    let (out_w, out_h) = out;
    if scaler.is_none() {
        let sc = SwsContext::get(
            decoded.format(), src.0, src.1,
            Pixel::RGBA,      out_w, out_h,
            Flags::BILINEAR,
        )
        .map_err(|e| format!("create RGBA scaler: {e}"))?;
        *scaler = Some(sc);
    }
    let Some(sc) = scaler.as_mut() else {
        return Err("RGBA scaler unavailable".into());
    };

    let mut rgba = Video::empty();
    sc.run(decoded, &mut rgba).map_err(|e| format!("scale frame: {e}"))?;

    let stride = rgba.stride(0);
    let raw = rgba.data(0);
    let row_bytes = out_w as usize * 4;
    let data: Vec<u8> = (0..out_h as usize)
        .flat_map(|row| &raw[row * stride..row * stride + row_bytes])
        .copied()
        .collect();

    Ok(VideoFrame { width: out_w, height: out_h, timestamp, data })
}
