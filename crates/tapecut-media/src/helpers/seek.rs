// crates/tapecut-media/src/helpers/seek.rs
//
// Seek helper wrapping avformat seek with one soft-fail policy for every
// caller (frame grabs, frame iteration, trim export).
//
// Seeks are always backward: `..=target` lands on the keyframe at or before
// the target. The caller decodes forward and drops pre-roll frames by
// timestamp, so the first frame it keeps is the one at the target rather than
// a later keyframe.

use ffmpeg_the_third as ffmpeg;

use tapecut_core::helpers::time::secs_to_micros;

/// Seek `ictx` to `target_secs` seconds from the start of the file.
///
/// Returns `true` if the seek succeeded or was skipped because the target is
/// at (or before) the start. Returns `false` if the demuxer refused; the
/// caller keeps decoding from wherever the demuxer is and its timestamp
/// filter still discards pre-roll.
///
/// A target of 0 is skipped: a freshly opened demuxer is already there, and
/// some builds return EPERM for `max_ts = 0`.
pub fn seek_to_secs(
    ictx:        &mut ffmpeg::format::context::Input,
    target_secs: f64,
    label:       &str,
) -> bool {
    if target_secs <= 0.0 {
        return true;
    }

    let seek_ts = secs_to_micros(target_secs);
    match ictx.seek(seek_ts, ..=seek_ts) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(
                caller = label,
                target = target_secs,
                error = %e,
                "seek failed, decoding from current position"
            );
            false
        }
    }
}

/// Rewind to the first packet. Used after a grab read to EOF, where a failed
/// backward seek would otherwise leave the demuxer with nothing to read.
pub fn rewind(ictx: &mut ffmpeg::format::context::Input) -> bool {
    match ictx.seek(0, ..=0) {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(error = %e, "rewind failed");
            false
        }
    }
}
