// crates/tapecut-core/src/media_types.rs
//
// Types that flow between tapecut-media and whatever front-end drives it.
// Plain data shared between the engine and its front-ends. No FFmpeg types.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Container / stream parameters read once when a file is opened.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub path:           PathBuf,
    /// Short demuxer name, e.g. `mov,mp4,m4a,3gp,3g2,mj2` or `avi`.
    pub format_name:    String,
    /// Seconds. `None` when the container reports zero or a negative value.
    pub duration:       Option<f64>,
    pub width:          u32,
    pub height:         u32,
    /// Average frame rate in frames per second, `None` for audio-only files.
    pub frame_rate:     Option<f64>,
    pub pixel_format:   Option<String>,
    /// Bits per second, `None` when the stream does not report one.
    pub video_bitrate:  Option<u64>,
    pub sample_rate:    Option<u32>,
    pub channels:       u16,
    pub has_video:      bool,
    pub has_audio:      bool,
}

impl MediaInfo {
    /// Duration of one video frame in seconds, if a frame rate is known.
    pub fn frame_duration(&self) -> Option<f64> {
        self.frame_rate.filter(|r| *r > 0.0).map(|r| 1.0 / r)
    }
}

impl fmt::Display for MediaInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "File:           {}", self.path.display())?;
        writeln!(f, "Format:         {}", self.format_name)?;
        match self.duration {
            Some(d) => writeln!(f, "Duration:       {}", crate::helpers::time::format_duration(d))?,
            None    => writeln!(f, "Duration:       unknown")?,
        }
        if self.has_video {
            writeln!(f, "Video:          {}x{}", self.width, self.height)?;
            if let Some(r) = self.frame_rate {
                writeln!(f, "Frame Rate:     {r:.3}")?;
            }
            if let Some(p) = &self.pixel_format {
                writeln!(f, "Pixel Format:   {p}")?;
            }
            if let Some(b) = self.video_bitrate {
                writeln!(f, "Video Bitrate:  {} kb/s", b / 1000)?;
            }
        }
        if self.has_audio {
            writeln!(f, "Audio Channels: {}", self.channels)?;
            if let Some(r) = self.sample_rate {
                writeln!(f, "Sample Rate:    {r} Hz")?;
            }
        }
        Ok(())
    }
}

/// A decoded RGBA frame, de-striped (each row exactly `width * 4` bytes).
#[derive(Clone, Debug, PartialEq)]
pub struct VideoFrame {
    pub width:     u32,
    pub height:    u32,
    /// Source timestamp in seconds.
    pub timestamp: f64,
    pub data:      Vec<u8>,
}

impl VideoFrame {
    pub fn is_well_formed(&self) -> bool {
        self.data.len() == self.width as usize * self.height as usize * 4
    }
}

/// The two independent preview slots of a trim view.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PreviewSlot {
    Start,
    End,
}

impl PreviewSlot {
    pub const ALL: [PreviewSlot; 2] = [PreviewSlot::Start, PreviewSlot::End];

    pub fn label(self) -> &'static str {
        match self {
            PreviewSlot::Start => "start",
            PreviewSlot::End   => "end",
        }
    }
}

/// Identifies one preview request. Increases per slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PreviewTicket {
    pub slot:       PreviewSlot,
    pub generation: u64,
}

/// Results sent from the preview threads to the front-end.
///
/// A superseded request sends nothing at all.
#[derive(Clone, Debug)]
pub enum PreviewResult {
    Frame   { ticket: PreviewTicket, timestamp: f64, frame: VideoFrame },
    /// Out-of-range timestamp, audio-only source, or the grab gave up.
    NoFrame { ticket: PreviewTicket, timestamp: f64 },
}

impl PreviewResult {
    pub fn ticket(&self) -> PreviewTicket {
        match self {
            PreviewResult::Frame { ticket, .. } | PreviewResult::NoFrame { ticket, .. } => *ticket,
        }
    }

    pub fn frame(&self) -> Option<&VideoFrame> {
        match self {
            PreviewResult::Frame { frame, .. } => Some(frame),
            PreviewResult::NoFrame { .. }      => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_duration_from_rate() {
        let info = MediaInfo { frame_rate: Some(25.0), ..Default::default() };
        assert!((info.frame_duration().unwrap() - 0.04).abs() < 1e-9);
        let audio_only = MediaInfo::default();
        assert!(audio_only.frame_duration().is_none());
    }

    #[test]
    fn tickets_order_by_slot_then_generation() {
        let start = |generation| PreviewTicket { slot: PreviewSlot::Start, generation };
        assert!(start(1) < start(2));
        assert!(start(9) < PreviewTicket { slot: PreviewSlot::End, generation: 1 });
        let mut tickets = vec![start(3), start(1), start(2)];
        tickets.sort();
        assert_eq!(tickets, [start(1), start(2), start(3)]);
    }

    #[test]
    fn well_formed_frame() {
        let f = VideoFrame { width: 2, height: 2, timestamp: 0.0, data: vec![0; 16] };
        assert!(f.is_well_formed());
        let bad = VideoFrame { data: vec![0; 15], ..f };
        assert!(!bad.is_well_formed());
    }

    #[test]
    fn display_lists_stream_parameters() {
        let info = MediaInfo {
            path:         PathBuf::from("tape.mp4"),
            format_name:  "mov,mp4,m4a,3gp,3g2,mj2".into(),
            duration:     Some(120.0),
            width:        720,
            height:       480,
            frame_rate:   Some(29.97),
            has_video:    true,
            has_audio:    true,
            channels:     2,
            sample_rate:  Some(48_000),
            ..Default::default()
        };
        let text = info.to_string();
        assert!(text.contains("720x480"));
        assert!(text.contains("2:00"));
        assert!(text.contains("48000 Hz"));
    }
}
