// crates/tapecut-media/src/helpers/fifo.rs
//
// Float-planar sample FIFO in front of the AAC encoder.
//
// AAC takes exactly `frame_size` (typically 1024) samples per input frame but
// decoded audio arrives in arbitrary chunk sizes. Everything decoded (already
// resampled to FLTP at the output rate and channel count) is appended here;
// full frames are popped from the front. The final partial frame is
// zero-padded on flush.
//
// One Vec per channel. Mono output has one plane, stereo two.

use ffmpeg_the_third as ffmpeg;
use ffmpeg::format::Sample;
use ffmpeg::format::sample::Type as SampleType;
use ffmpeg::util::channel_layout::ChannelLayoutMask;
use ffmpeg::util::frame::audio::Audio as AudioFrame;

pub struct AudioFifo {
    planes: Vec<Vec<f32>>,
}

impl AudioFifo {
    pub fn new(channels: usize) -> Self {
        Self { planes: vec![Vec::new(); channels.max(1)] }
    }

    pub fn channels(&self) -> usize {
        self.planes.len()
    }

    /// Samples buffered per channel.
    pub fn len(&self) -> usize {
        self.planes[0].len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append `take` samples per channel starting at `skip`. Missing source
    /// planes repeat the last one.
    pub fn push_planes(&mut self, planes: &[&[f32]], skip: usize, take: usize) {
        let Some(last) = planes.last() else { return };
        for (ch, dst) in self.planes.iter_mut().enumerate() {
            let src = planes.get(ch).unwrap_or(last);
            let from = skip.min(src.len());
            let to = (skip + take).min(src.len());
            dst.extend_from_slice(&src[from..to]);
        }
    }

    /// Append `take` samples per channel of an FLTP frame, starting at `skip`.
    ///
    /// The frame must be float planar with at least one channel.
    pub fn push_frame(&mut self, frame: &AudioFrame, skip: usize, take: usize) {
        let n = frame.samples();
        if n == 0 || skip >= n {
            return;
        }
        let plane_count = (frame.ch_layout().channels() as usize).clamp(1, self.channels());
        let planes: Vec<&[f32]> = (0..plane_count)
            .map(|p| unsafe {
                let bytes = frame.data(p);
                std::slice::from_raw_parts(bytes.as_ptr() as *const f32, n)
            })
            .collect();
        self.push_planes(&planes, skip, take.min(n - skip));
    }

    pub fn push_silence(&mut self, samples: usize) {
        for plane in &mut self.planes {
            plane.resize(plane.len() + samples, 0.0);
        }
    }

    /// Remove `n` samples per channel from the front, zero-padding past the
    /// end of what is buffered.
    pub fn take(&mut self, n: usize) -> Vec<Vec<f32>> {
        let available = self.len().min(n);
        self.planes
            .iter_mut()
            .map(|plane| {
                let mut out: Vec<f32> = plane.drain(..available).collect();
                out.resize(n, 0.0);
                out
            })
            .collect()
    }

    /// Pop one encoder-sized FLTP frame with its PTS set to `sample_idx`
    /// (time base 1/rate).
    pub fn pop_frame(&mut self, n: usize, sample_idx: i64, rate: u32) -> AudioFrame {
        let mask = if self.channels() == 1 { ChannelLayoutMask::MONO } else { ChannelLayoutMask::STEREO };
        let mut frame = AudioFrame::new(Sample::F32(SampleType::Planar), n, mask);
        frame.set_rate(rate);
        frame.set_pts(Some(sample_idx));

        for (p, samples) in self.take(n).into_iter().enumerate() {
            unsafe {
                let data = frame.data_mut(p);
                let dst = std::slice::from_raw_parts_mut(data.as_mut_ptr() as *mut f32, n);
                dst.copy_from_slice(&samples);
            }
        }
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_take_keep_channels_apart() {
        let mut fifo = AudioFifo::new(2);
        fifo.push_planes(&[&[1.0, 2.0, 3.0], &[-1.0, -2.0, -3.0]], 0, 3);
        assert_eq!(fifo.len(), 3);
        let out = fifo.take(2);
        assert_eq!(out, vec![vec![1.0, 2.0], vec![-1.0, -2.0]]);
        assert_eq!(fifo.len(), 1);
    }

    #[test]
    fn take_pads_the_tail_with_silence() {
        let mut fifo = AudioFifo::new(1);
        fifo.push_planes(&[&[0.5, 0.5]], 0, 2);
        assert_eq!(fifo.take(4), vec![vec![0.5, 0.5, 0.0, 0.0]]);
        assert!(fifo.is_empty());
    }

    #[test]
    fn skip_and_take_trim_a_chunk() {
        let mut fifo = AudioFifo::new(1);
        let chunk: Vec<f32> = (0..10).map(|i| i as f32).collect();
        fifo.push_planes(&[&chunk], 3, 4);
        assert_eq!(fifo.take(4), vec![vec![3.0, 4.0, 5.0, 6.0]]);
        // Asking past the end only copies what exists.
        fifo.push_planes(&[&chunk], 8, 100);
        assert_eq!(fifo.len(), 2);
    }

    #[test]
    fn mono_source_fills_both_planes() {
        let mut fifo = AudioFifo::new(2);
        fifo.push_planes(&[&[0.25, 0.75]], 0, 2);
        let out = fifo.take(2);
        assert_eq!(out[0], out[1]);
    }

    #[test]
    fn silence_extends_every_plane() {
        let mut fifo = AudioFifo::new(2);
        fifo.push_silence(5);
        fifo.push_planes(&[&[1.0], &[1.0]], 0, 1);
        let out = fifo.take(6);
        assert_eq!(out[1][4], 0.0);
        assert_eq!(out[1][5], 1.0);
    }
}
