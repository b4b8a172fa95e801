// crates/tapecut-media/src/session.rs
//
// MediaSession: one open source file shared by the preview threads and the
// front-end.
//
// Access model:
//   The demuxer and decoder live behind one parking_lot Mutex. A grab holds
//   the lock for its whole seek + decode, so two callers never interleave a
//   seek with someone else's decode. `iterate_frames` holds the same lock for
//   the lifetime of the iterator.
//
// Grab strategy:
//   backward seek to the keyframe at or before t, flush the decoder, decode
//   forward dropping pre-roll until the first frame at or after t - ½ frame.
//   Reaching EOF first returns the last decoded frame, which makes "show me
//   the end of the tape" requests work on files whose duration slightly
//   overstates the last frame's timestamp.

use std::path::{Path, PathBuf};

use parking_lot::{Mutex, MutexGuard};

use ffmpeg_the_third as ffmpeg;
use ffmpeg::format::{context::Input, input};
use ffmpeg::media::Type;
use ffmpeg::software::scaling::context::Context as SwsContext;
use ffmpeg::util::frame::video::Video;
use ffmpeg::util::rational::Rational;

use tapecut_core::config::PreviewConfig;
use tapecut_core::helpers::geometry::{even_dimension, fit_within};
use tapecut_core::media_types::{MediaInfo, VideoFrame};
use tapecut_core::{EngineError, Result};

use crate::helpers::frame::{frame_secs, to_rgba};
use crate::helpers::seek::{rewind, seek_to_secs};
use crate::probe::read_info;

/// Frame period used for pre-roll tolerance when the stream reports no rate.
const FALLBACK_FRAME_DURATION: f64 = 1.0 / 30.0;

pub struct MediaSession {
    path:              PathBuf,
    info:              MediaInfo,
    decode_size:       Option<(u32, u32)>,
    max_grab_attempts: u32,
    state:             Mutex<SessionState>,
}

struct SessionState {
    /// `None` once closed.
    decoder:  Option<SessionDecoder>,
    position: f64,
}

struct SessionDecoder {
    ictx:  Input,
    /// `None` for audio-only sources.
    video: Option<VideoTrack>,
}

struct VideoTrack {
    index:     usize,
    decoder:   ffmpeg::decoder::video::Video,
    time_base: Rational,
    /// Display size from the stream parameters (excludes macroblock padding).
    display:   (u32, u32),
    /// Output size of every frame this session produces.
    out:       (u32, u32),
    frame_dur: f64,
}

impl MediaSession {
    /// Open `path` for frame access. `decode_size` bounds the decoded frame
    /// size (aspect ratio kept); `None` decodes at native resolution.
    pub fn open(path: impl AsRef<Path>, decode_size: Option<(u32, u32)>) -> Result<Self> {
        crate::init();
        let path = path.as_ref().to_path_buf();
        let unreadable = |reason: String| EngineError::UnreadableMedia { path: path.clone(), reason };

        let ictx = input(&path).map_err(|e| unreadable(e.to_string()))?;
        let info = read_info(&path, &ictx);
        if !info.has_video && !info.has_audio {
            return Err(unreadable("no video or audio stream".into()));
        }

        let video = match ictx.streams().best(Type::Video) {
            None => None,
            Some(stream) => {
                let ctx = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
                    .map_err(|e| unreadable(format!("video decoder context: {e}")))?;
                let decoder = ctx
                    .decoder()
                    .video()
                    .map_err(|e| unreadable(format!("open video decoder: {e}")))?;
                let display = if info.width > 0 && info.height > 0 {
                    (info.width, info.height)
                } else {
                    (decoder.width(), decoder.height())
                };
                let out = match decode_size {
                    Some((max_w, max_h)) => {
                        let (w, h) = fit_within(display.0, display.1, max_w, max_h);
                        (even_dimension(w), even_dimension(h))
                    }
                    None => display,
                };
                Some(VideoTrack {
                    index: stream.index(),
                    decoder,
                    time_base: stream.time_base(),
                    display,
                    out,
                    frame_dur: info.frame_duration().unwrap_or(FALLBACK_FRAME_DURATION),
                })
            }
        };

        tracing::info!(
            path = %path.display(),
            duration = ?info.duration,
            size = ?video.as_ref().map(|v| v.out),
            "media session opened"
        );

        Ok(Self {
            path,
            info,
            decode_size,
            max_grab_attempts: PreviewConfig::default().max_grab_attempts,
            state: Mutex::new(SessionState {
                decoder:  Some(SessionDecoder { ictx, video }),
                position: 0.0,
            }),
        })
    }

    /// Open with the decode size and retry budget from `config`.
    pub fn open_with(path: impl AsRef<Path>, config: &PreviewConfig) -> Result<Self> {
        Ok(Self::open(path, Some(config.decode_size()))?
            .with_max_grab_attempts(config.max_grab_attempts))
    }

    pub fn with_max_grab_attempts(mut self, attempts: u32) -> Self {
        self.max_grab_attempts = attempts.max(1);
        self
    }

    pub fn path(&self) -> &Path { &self.path }
    pub fn info(&self) -> &MediaInfo { &self.info }
    pub fn decode_size(&self) -> Option<(u32, u32)> { self.decode_size }

    /// Timestamp of the last seek.
    pub fn current_position(&self) -> f64 {
        self.state.lock().position
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().decoder.is_some()
    }

    /// Total duration in seconds.
    pub fn probe_duration(&self) -> Result<f64> {
        self.info
            .duration
            .ok_or_else(|| EngineError::ZeroOrUnknownDuration { path: self.path.clone() })
    }

    /// Duration, or `fallback` when the container does not report one.
    pub fn duration_or(&self, fallback: f64) -> f64 {
        self.info.duration.unwrap_or(fallback)
    }

    /// Decode the frame shown at `t` seconds.
    ///
    /// `None` for timestamps outside the file, audio-only sources, a closed
    /// session, or when every retry failed.
    pub fn grab_frame_at(&self, t: f64) -> Option<VideoFrame> {
        if !t.is_finite() || t < 0.0 {
            return None;
        }
        if self.info.duration.is_some_and(|d| t > d) {
            return None;
        }

        let mut guard = self.state.lock();
        let SessionState { decoder, position } = &mut *guard;
        let dec = decoder.as_mut()?;
        dec.video.as_ref()?;
        *position = t;

        for attempt in 1..=self.max_grab_attempts {
            match dec.grab(t) {
                Ok(frame) => return frame,
                Err(e) => tracing::debug!(attempt, timestamp = t, error = %e, "frame grab attempt failed"),
            }
        }

        let err = EngineError::FrameGrabFailure { timestamp: t, attempts: self.max_grab_attempts };
        tracing::warn!(path = %self.path.display(), "{err}");
        None
    }

    /// Decode every frame with timestamp in `[from, to]`, in order.
    ///
    /// Holds the session for as long as the iterator lives. The first frame
    /// past `to` ends iteration and is not yielded.
    pub fn iterate_frames(&self, from: f64, to: f64) -> FrameIter<'_> {
        let mut guard = self.state.lock();
        let mut state = IterState::Done;
        let mut target = from;

        if from.is_finite() && to.is_finite() && from >= 0.0 && from <= to {
            let SessionState { decoder, position } = &mut *guard;
            if let Some(SessionDecoder { ictx, video: Some(video) }) = decoder.as_mut() {
                *position = from;
                video.decoder.flush();
                if from <= 0.0 || !seek_to_secs(ictx, from, "iterate_frames") {
                    rewind(ictx);
                }
                state = IterState::Reading;
                target = from - 0.5 * video.frame_dur;
            }
        }

        FrameIter { guard, target, to, state, scaler: None, decoded: Video::empty() }
    }

    /// Release the demuxer and decoder. Safe to call more than once.
    pub fn close(&self) {
        if self.state.lock().decoder.take().is_some() {
            tracing::debug!(path = %self.path.display(), "media session closed");
        }
    }
}

impl SessionDecoder {
    /// One seek + decode pass. `Ok(None)` when the stream yields no frame at all.
    fn grab(&mut self, t: f64) -> std::result::Result<Option<VideoFrame>, String> {
        let Some(video) = self.video.as_mut() else { return Ok(None) };

        video.decoder.flush();
        if t <= 0.0 || !seek_to_secs(&mut self.ictx, t, "grab_frame_at") {
            rewind(&mut self.ictx);
        }

        let target = t - 0.5 * video.frame_dur;
        let mut decoded = Video::empty();
        // Last pre-roll frame, kept raw so only the returned frame is scaled.
        let mut last: Option<(Video, f64)> = None;

        for result in self.ictx.packets() {
            let (stream, packet) = result.map_err(|e| format!("read packet: {e}"))?;
            if stream.index() != video.index {
                continue;
            }
            if video.decoder.send_packet(&packet).is_err() {
                continue;
            }
            while video.decoder.receive_frame(&mut decoded).is_ok() {
                let ts = frame_secs(&decoded, video.time_base).unwrap_or(t);
                if ts >= target {
                    return video.convert(&decoded, ts).map(Some);
                }
                last = Some((decoded.clone(), ts));
            }
        }

        // EOF: drain frames the decoder is still holding.
        let _ = video.decoder.send_eof();
        while video.decoder.receive_frame(&mut decoded).is_ok() {
            let ts = frame_secs(&decoded, video.time_base).unwrap_or(t);
            if ts >= target {
                return video.convert(&decoded, ts).map(Some);
            }
            last = Some((decoded.clone(), ts));
        }

        match last {
            Some((frame, ts)) => video.convert(&frame, ts).map(Some),
            None => Ok(None),
        }
    }
}

impl VideoTrack {
    fn convert(&self, decoded: &Video, ts: f64) -> std::result::Result<VideoFrame, String> {
        // Grabs jump around the file, so the scaler is not kept between calls.
        let mut scaler: Option<SwsContext> = None;
        to_rgba(&mut scaler, decoded, self.display, self.out, ts)
    }
}

enum IterState {
    Reading,
    Draining,
    Done,
}

/// Lazy in-order frame iterator returned by [`MediaSession::iterate_frames`].
pub struct FrameIter<'a> {
    guard:   MutexGuard<'a, SessionState>,
    target:  f64,
    to:      f64,
    state:   IterState,
    scaler:  Option<SwsContext>,
    decoded: Video,
}

impl Iterator for FrameIter<'_> {
    type Item = (VideoFrame, f64);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if matches!(self.state, IterState::Done) {
                return None;
            }
            let Some(SessionDecoder { ictx, video: Some(video) }) = self.guard.decoder.as_mut() else {
                self.state = IterState::Done;
                return None;
            };

            if video.decoder.receive_frame(&mut self.decoded).is_ok() {
                let Some(ts) = frame_secs(&self.decoded, video.time_base) else { continue };
                if ts < self.target {
                    continue;
                }
                if ts > self.to {
                    self.state = IterState::Done;
                    return None;
                }
                let (display, out) = (video.display, video.out);
                self.guard.position = ts;
                match to_rgba(&mut self.scaler, &self.decoded, display, out, ts) {
                    Ok(frame) => return Some((frame, ts)),
                    Err(e) => {
                        tracing::warn!(timestamp = ts, error = %e, "frame iteration stopped");
                        self.state = IterState::Done;
                        return None;
                    }
                }
            }

            if matches!(self.state, IterState::Draining) {
                self.state = IterState::Done;
                return None;
            }

            match ictx.packets().next() {
                Some(Ok((stream, packet))) => {
                    if stream.index() == video.index {
                        let _ = video.decoder.send_packet(&packet);
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "frame iteration read error");
                    self.state = IterState::Done;
                }
                None => {
                    let _ = video.decoder.send_eof();
                    self.state = IterState::Draining;
                }
            }
        }
    }
}
