// crates/tapecut-media/src/trim.rs
//
// TrimExporter: re-encode one range of a source file (or several whole files
// back to back) into an H.264 + AAC MP4.
//
// Stream layout in the output MP4:
//   Stream 0: H.264 video (YUV420P, source display size rounded to even,
//              source frame rate, source bitrate or the configured fallback)
//   Stream 1: AAC audio (FLTP, source sample rate, mono or stereo; more than
//              two source channels are downmixed). Absent for silent sources.
//
// PTS strategy:
//   Video: round((t − start) / frame period) in the encoder's 1/fps time base.
//          A frame whose slot is already taken is dropped, so PTS strictly
//          increase without drifting away from source time.
//   Audio: sample counter in 1/rate. Each decoded chunk is placed at
//          round((ts − start) × rate): samples before the in-point are cut,
//          samples past the out-point are cut, and a gap in front (late audio
//          start) is filled with silence.
//
// Output file:
//   Everything is written to `.<name>.partial` next to the destination and
//   renamed on success. On any failure the partial file is removed, so a
//   destination path either holds a complete export or nothing.
//
// Cancellation:
//   `CancelToken::check` is polled once per demuxed packet.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use ffmpeg_the_third as ffmpeg;
use ffmpeg::codec::{self, Id as CodecId};
use ffmpeg::encoder;
use ffmpeg::format::sample::Type as SampleType;
use ffmpeg::format::{Pixel, Sample, input as open_input};
use ffmpeg::media::Type as MediaType;
use ffmpeg::software::resampling;
use ffmpeg::software::scaling::{Context as ScaleCtx, Flags as ScaleFlags};
use ffmpeg::util::channel_layout::ChannelLayout;
use ffmpeg::util::frame::audio::Audio as AudioFrame;
use ffmpeg::util::frame::video::Video as VideoFrame;
use ffmpeg::util::rational::Rational;
use ffmpeg::Packet;

use tapecut_core::cancel::CancelToken;
use tapecut_core::config::ExportConfig;
use tapecut_core::helpers::geometry::even_dimension;
use tapecut_core::helpers::time::range_fraction;
use tapecut_core::queue::Exporter;
use tapecut_core::task::{ExportTask, normalize_output_name, normalize_output_path, validate_range};
use tapecut_core::{EngineError, Result};

use crate::helpers::fifo::AudioFifo;
use crate::helpers::frame::{frame_secs, rate_to_f64};
use crate::helpers::seek::seek_to_secs;
use crate::probe::{probe, read_info};

/// Report progress every this many encoded video frames.
const PROGRESS_INTERVAL: u64 = 15;

/// In-loop progress never reaches 1.0; the single 1.0 is sent after rename.
const PROGRESS_CEILING: f64 = 0.999;

/// Audio gaps shorter than this are closed up instead of filled with silence.
const AUDIO_GAP_TOLERANCE_SECS: f64 = 0.01;

pub struct TrimExporter {
    config: ExportConfig,
}

impl Default for TrimExporter {
    fn default() -> Self {
        Self::new(ExportConfig::default())
    }
}

/// One input's contribution to an output file.
struct Segment {
    source: PathBuf,
    start:  f64,
    /// `None` runs to the end of the file.
    end:    Option<f64>,
    /// Share of overall progress, in seconds.
    weight: f64,
}

impl TrimExporter {
    pub fn new(config: ExportConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExportConfig {
        &self.config
    }

    /// Export `[start, end]` of `source` to `output_dir/output_name` (`.mp4`
    /// appended when missing).
    ///
    /// The source must have a video stream. Audio-only files fail with
    /// `ExportFailed` before the output directory is created.
    #[allow(clippy::too_many_arguments)]
    pub fn export(
        &self,
        source:      &Path,
        output_dir:  &Path,
        output_name: &str,
        start:       f64,
        end:         f64,
        progress:    &dyn Fn(f64),
        cancel:      &CancelToken,
    ) -> Result<PathBuf> {
        let name = normalize_output_name(output_name)?;
        self.export_to_path(source, &output_dir.join(name), start, end, progress, cancel)
    }

    /// Export `[start, end]` of `source` to `output_path` (`.mp4` appended to
    /// the file name when missing).
    pub fn export_to_path(
        &self,
        source:      &Path,
        output_path: &Path,
        start:       f64,
        end:         f64,
        progress:    &dyn Fn(f64),
        cancel:      &CancelToken,
    ) -> Result<PathBuf> {
        validate_range(start, end)?;
        let output = normalize_output_path(output_path)?;
        crate::init();

        tracing::info!(
            source = %source.display(),
            output = %output.display(),
            start,
            end,
            "trim export started"
        );
        let segment = Segment { source: source.to_path_buf(), start, end: Some(end), weight: end - start };
        self.run(&output, &[segment], progress, cancel)
    }

    /// Concatenate whole `inputs` into `output_path`, re-encoding each one.
    ///
    /// Output size, rate and audio layout come from the first input; later
    /// inputs are scaled and resampled to match. Progress is weighted by
    /// each input's duration.
    pub fn join(
        &self,
        inputs:      &[PathBuf],
        output_path: &Path,
        progress:    &dyn Fn(f64),
        cancel:      &CancelToken,
    ) -> Result<PathBuf> {
        if inputs.is_empty() {
            return Err(EngineError::NothingToExport);
        }
        let output = normalize_output_path(output_path)?;
        crate::init();

        let segments: Vec<Segment> = inputs
            .iter()
            .map(|source| Segment {
                source: source.clone(),
                start:  0.0,
                end:    None,
                weight: probe(source).ok().and_then(|i| i.duration).unwrap_or(1.0),
            })
            .collect();

        tracing::info!(inputs = inputs.len(), output = %output.display(), "join started");
        self.run(&output, &segments, progress, cancel)
    }

    fn run(
        &self,
        output:   &Path,
        segments: &[Segment],
        progress: &dyn Fn(f64),
        cancel:   &CancelToken,
    ) -> Result<PathBuf> {
        // Sources without a video stream are rejected before anything is created.
        let first = segments.first().ok_or(EngineError::NothingToExport)?;
        let params = OutputParams::from_source(&first.source, &self.config).map_err(|reason| {
            tracing::warn!(output = %output.display(), %reason, "export failed");
            EngineError::export_failed(output, reason)
        })?;

        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                EngineError::export_failed(output, format!("create output directory: {e}"))
            })?;
        }

        let partial = partial_path(output);
        let result = self
            .encode(&partial, &params, segments, progress, cancel)
            .and_then(|()| fs::rename(&partial, output).map_err(|e| format!("rename temporary file: {e}")));

        match result {
            Ok(()) => {
                progress(1.0);
                tracing::info!(output = %output.display(), "export finished");
                Ok(output.to_path_buf())
            }
            Err(reason) => {
                if let Err(e) = fs::remove_file(&partial) {
                    if e.kind() != io::ErrorKind::NotFound {
                        tracing::warn!(path = %partial.display(), error = %e, "could not remove partial output");
                    }
                }
                tracing::warn!(output = %output.display(), %reason, "export failed");
                Err(EngineError::export_failed(output, reason))
            }
        }
    }

    fn encode(
        &self,
        partial:  &Path,
        params:   &OutputParams,
        segments: &[Segment],
        progress: &dyn Fn(f64),
        cancel:   &CancelToken,
    ) -> std::result::Result<(), String> {
        let mut sink = EncodeSink::open(partial, params, &self.config)?;

        let total_weight = segments.iter().map(|s| s.weight).sum::<f64>().max(f64::EPSILON);
        let mut done_weight = 0.0;

        for segment in segments {
            if let Some(reason) = cancel.check() {
                return Err(reason.as_str().into());
            }
            let report = |secs: f64| {
                let within = range_fraction(0.0, segment.weight, secs) * segment.weight;
                progress(((done_weight + within) / total_weight).min(PROGRESS_CEILING));
            };
            encode_segment(&mut sink, segment, &report, cancel)?;
            done_weight += segment.weight;
        }

        if sink.video.last_pts < 0 {
            return Err("no video frames in the requested range".into());
        }
        sink.finish()
    }
}

impl Exporter for TrimExporter {
    fn export(
        &self,
        task:       &ExportTask,
        output_dir: &Path,
        progress:   &dyn Fn(f64),
        cancel:     &CancelToken,
    ) -> Result<PathBuf> {
        TrimExporter::export(
            self,
            task.source(),
            output_dir,
            task.output_name(),
            task.start(),
            task.end(),
            progress,
            cancel,
        )
    }
}

/// `dir/name.mp4` → `dir/.name.mp4.partial`
pub fn partial_path(output: &Path) -> PathBuf {
    let name = output.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
    output.with_file_name(format!(".{name}.partial"))
}

fn secs_to_samples(secs: f64, rate: u32) -> i64 {
    (secs * f64::from(rate)).round() as i64
}

fn layout_for(channels: u32) -> ChannelLayout<'static> {
    if channels == 1 { ChannelLayout::MONO } else { ChannelLayout::STEREO }
}

// ── Output parameters ─────────────────────────────────────────────────────────

struct OutputParams {
    width:         u32,
    height:        u32,
    frame_rate:    Rational,
    video_bitrate: u64,
    /// `(sample rate, channels)`; `None` for a silent output.
    audio:         Option<(u32, u32)>,
}

impl OutputParams {
    fn from_source(path: &Path, config: &ExportConfig) -> std::result::Result<Self, String> {
        let ictx = open_input(path).map_err(|e| format!("open '{}': {e}", path.display()))?;
        let info = read_info(path, &ictx);
        let stream = ictx
            .streams()
            .best(MediaType::Video)
            .ok_or_else(|| format!("no video stream in '{}'", path.display()))?;
        if info.width == 0 || info.height == 0 {
            return Err(format!("no frame size reported by '{}'", path.display()));
        }

        let frame_rate = [stream.avg_frame_rate(), stream.rate()]
            .into_iter()
            .find(|r| rate_to_f64(*r).is_some())
            .unwrap_or_else(|| Rational::from(config.fallback_frame_rate));

        let audio = match (info.has_audio, info.sample_rate) {
            (true, Some(rate)) => Some((rate, if info.channels == 1 { 1 } else { 2 })),
            _ => None,
        };

        Ok(Self {
            width: even_dimension(info.width),
            height: even_dimension(info.height),
            frame_rate,
            video_bitrate: info.video_bitrate.unwrap_or(config.fallback_video_bitrate),
            audio,
        })
    }
}

// ── Encoder + muxer ───────────────────────────────────────────────────────────

struct VideoSink {
    encoder:  encoder::video::Video,
    width:    u32,
    height:   u32,
    /// 1/fps.
    enc_tb:   Rational,
    ost_tb:   Rational,
    last_pts: i64,
}

impl VideoSink {
    /// Seconds of output covered by frames written so far.
    fn end_secs(&self) -> f64 {
        (self.last_pts + 1) as f64 * f64::from(self.enc_tb)
    }

    fn write(
        &mut self,
        octx:     &mut ffmpeg::format::context::Output,
        yuv:      &mut VideoFrame,
        rel_secs: f64,
    ) -> std::result::Result<(), String> {
        let pts = ((rel_secs / f64::from(self.enc_tb)).round() as i64).max(0);
        if pts <= self.last_pts {
            tracing::trace!(pts, last = self.last_pts, "duplicate frame slot dropped");
            return Ok(());
        }
        self.last_pts = pts;

        yuv.set_pts(Some(pts));
        // swscale copies the source SAR onto the output frame; force square
        // pixels so players do not letterbox. No safe setter exists.
        unsafe {
            (*yuv.as_mut_ptr()).sample_aspect_ratio = ffmpeg::ffi::AVRational { num: 1, den: 1 };
        }

        self.encoder
            .send_frame(yuv)
            .map_err(|e| format!("send video frame to encoder: {e}"))?;
        self.drain_packets(octx)
    }

    fn drain_packets(&mut self, octx: &mut ffmpeg::format::context::Output) -> std::result::Result<(), String> {
        let mut pkt = Packet::empty();
        while self.encoder.receive_packet(&mut pkt).is_ok() {
            pkt.set_stream(0);
            pkt.rescale_ts(self.enc_tb, self.ost_tb);
            pkt.write_interleaved(octx)
                .map_err(|e| format!("write video packet: {e}"))?;
        }
        Ok(())
    }
}

struct AudioSink {
    encoder:    encoder::Audio,
    fifo:       AudioFifo,
    frame_size: usize,
    rate:       u32,
    channels:   u32,
    /// Next encoder frame's PTS, in samples.
    next_pts:   i64,
    /// Samples pushed into the FIFO so far (output position).
    written:    i64,
    enc_tb:     Rational,
    ost_tb:     Rational,
}

impl AudioSink {
    /// Place `frame` at output sample `first`, cutting anything before the
    /// current write position and anything at or past `limit`. Returns `true`
    /// once `limit` is reached.
    fn push(
        &mut self,
        octx:  &mut ffmpeg::format::context::Output,
        frame: &AudioFrame,
        first: i64,
        limit: Option<i64>,
    ) -> std::result::Result<bool, String> {
        let n = frame.samples() as i64;
        let gap = first - self.written;
        if gap > secs_to_samples(AUDIO_GAP_TOLERANCE_SECS, self.rate) {
            let fill = limit.map_or(gap, |l| gap.min(l - self.written)).max(0);
            self.fifo.push_silence(fill as usize);
            self.written += fill;
        }

        let skip = (-gap).max(0).min(n);
        let mut take = n - skip;
        if let Some(limit) = limit {
            take = take.min(limit - self.written);
        }
        if take > 0 {
            self.fifo.push_frame(frame, skip as usize, take as usize);
            self.written += take;
        }

        self.drain_fifo(octx, false)?;
        Ok(limit.is_some_and(|l| self.written >= l))
    }

    fn pad_to(
        &mut self,
        octx:   &mut ffmpeg::format::context::Output,
        target: i64,
    ) -> std::result::Result<(), String> {
        if target > self.written {
            self.fifo.push_silence((target - self.written) as usize);
            self.written = target;
        }
        self.drain_fifo(octx, false)
    }

    /// Encode buffered samples. Only full frames are sent unless `flush`, in
    /// which case the short tail goes out as a final small frame.
    fn drain_fifo(
        &mut self,
        octx:  &mut ffmpeg::format::context::Output,
        flush: bool,
    ) -> std::result::Result<(), String> {
        while self.fifo.len() >= self.frame_size || (flush && !self.fifo.is_empty()) {
            let n = self.fifo.len().min(self.frame_size);
            let frame = self.fifo.pop_frame(n, self.next_pts, self.rate);
            self.next_pts += n as i64;

            self.encoder.send_frame(&frame)
                .map_err(|e| format!("send audio frame to encoder: {e}"))?;
            self.drain_packets(octx)?;
        }
        Ok(())
    }

    fn drain_packets(&mut self, octx: &mut ffmpeg::format::context::Output) -> std::result::Result<(), String> {
        let mut pkt = Packet::empty();
        while self.encoder.receive_packet(&mut pkt).is_ok() {
            pkt.set_stream(1);
            pkt.rescale_ts(self.enc_tb, self.ost_tb);
            pkt.write_interleaved(octx)
                .map_err(|e| format!("write audio packet: {e}"))?;
        }
        Ok(())
    }
}

struct EncodeSink {
    octx:  ffmpeg::format::context::Output,
    video: VideoSink,
    audio: Option<AudioSink>,
}

impl EncodeSink {
    fn open(path: &Path, params: &OutputParams, config: &ExportConfig) -> std::result::Result<Self, String> {
        // The partial file's extension says nothing about the container.
        let mut octx = ffmpeg::format::output_as(path, "mp4")
            .map_err(|e| format!("could not open output '{}': {e}", path.display()))?;
        let global_header = octx
            .format()
            .flags()
            .contains(ffmpeg::format::Flags::GLOBAL_HEADER);

        // ── Video encoder (stream 0) ──────────────────────────────────────────
        let enc_tb = params.frame_rate.invert();
        let h264 = encoder::find(CodecId::H264)
            .ok_or_else(|| "H.264 encoder not found, is libx264 available?".to_string())?;
        {
            let mut ost = octx.add_stream(h264).map_err(|e| format!("add video stream: {e}"))?;
            ost.set_time_base(enc_tb);
        }

        let mut video_enc = codec::context::Context::new_with_codec(h264)
            .encoder()
            .video()
            .map_err(|e| format!("create video encoder context: {e}"))?;
        video_enc.set_width(params.width);
        video_enc.set_height(params.height);
        video_enc.set_format(Pixel::YUV420P);
        video_enc.set_time_base(enc_tb);
        video_enc.set_frame_rate(Some(params.frame_rate));
        video_enc.set_bit_rate(params.video_bitrate as usize);
        if global_header {
            video_enc.set_flags(codec::Flags::GLOBAL_HEADER);
        }

        let mut opts = ffmpeg::Dictionary::new();
        opts.set("preset", &config.x264_preset);
        let mut video_encoder = video_enc
            .open_as_with(h264, opts)
            .map_err(|e| format!("open H.264 encoder: {e}"))?;
        // libavcodec resets the SAR while opening; set it on the opened context.
        video_encoder.set_aspect_ratio(Rational::new(1, 1));
        copy_parameters(&mut octx, 0, video_encoder.as_ptr())?;

        // ── Audio encoder (stream 1) ──────────────────────────────────────────
        let audio = match params.audio {
            None => None,
            Some((rate, channels)) => {
                let audio_tb = Rational::new(1, rate as i32);
                let aac = encoder::find(CodecId::AAC)
                    .ok_or_else(|| "AAC encoder not found".to_string())?;
                {
                    let mut ost = octx.add_stream(aac).map_err(|e| format!("add audio stream: {e}"))?;
                    ost.set_time_base(audio_tb);
                }

                let mut audio_enc = codec::context::Context::new_with_codec(aac)
                    .encoder()
                    .audio()
                    .map_err(|e| format!("create audio encoder context: {e}"))?;
                audio_enc.set_rate(rate as i32);
                audio_enc.set_ch_layout(layout_for(channels));
                audio_enc.set_format(Sample::F32(SampleType::Planar));
                audio_enc.set_bit_rate(config.audio_bitrate as usize);
                audio_enc.set_time_base(audio_tb);
                if global_header {
                    audio_enc.set_flags(codec::Flags::GLOBAL_HEADER);
                }

                let audio_encoder = audio_enc
                    .open_as_with(aac, ffmpeg::Dictionary::new())
                    .map_err(|e| format!("open AAC encoder: {e}"))?;
                copy_parameters(&mut octx, 1, audio_encoder.as_ptr())?;

                let frame_size = match audio_encoder.frame_size() {
                    0 => 1024,
                    n => n as usize,
                };
                Some(AudioSink {
                    encoder: audio_encoder,
                    fifo: AudioFifo::new(channels as usize),
                    frame_size,
                    rate,
                    channels,
                    next_pts: 0,
                    written: 0,
                    enc_tb: audio_tb,
                    ost_tb: audio_tb,
                })
            }
        };

        octx.write_header().map_err(|e| format!("write output header: {e}"))?;

        // The muxer may pick its own stream time bases while writing the header.
        let ost_video_tb = octx.stream(0).map(|s| s.time_base()).ok_or("video stream missing")?;
        let mut audio = audio;
        if let Some(a) = audio.as_mut() {
            a.ost_tb = octx.stream(1).map(|s| s.time_base()).ok_or("audio stream missing")?;
        }

        tracing::debug!(
            width = params.width,
            height = params.height,
            fps = f64::from(params.frame_rate),
            bitrate = params.video_bitrate,
            audio = ?params.audio,
            "encoder opened"
        );

        Ok(Self {
            octx,
            video: VideoSink {
                encoder: video_encoder,
                width: params.width,
                height: params.height,
                enc_tb,
                ost_tb: ost_video_tb,
                last_pts: -1,
            },
            audio,
        })
    }

    fn finish(mut self) -> std::result::Result<(), String> {
        self.video.encoder.send_eof()
            .map_err(|e| format!("send EOF to video encoder: {e}"))?;
        self.video.drain_packets(&mut self.octx)?;

        if let Some(audio) = self.audio.as_mut() {
            audio.drain_fifo(&mut self.octx, true)?;
            audio.encoder.send_eof()
                .map_err(|e| format!("send EOF to audio encoder: {e}"))?;
            audio.drain_packets(&mut self.octx)?;
        }

        self.octx.write_trailer().map_err(|e| format!("write trailer: {e}"))
    }
}

/// Copy an opened encoder's parameters into output stream `index` so the
/// muxer sees resolution, format and codec-private data. `set_parameters()`
/// needs `AsPtr<AVCodecParameters>`, which opened encoders do not implement.
fn copy_parameters(
    octx:  &mut ffmpeg::format::context::Output,
    index: usize,
    ctx:   *const ffmpeg::ffi::AVCodecContext,
) -> std::result::Result<(), String> {
    let ret = unsafe {
        ffmpeg::ffi::avcodec_parameters_from_context(
            (**(*octx.as_mut_ptr()).streams.add(index)).codecpar,
            ctx as *mut ffmpeg::ffi::AVCodecContext,
        )
    };
    if ret < 0 {
        return Err(format!("avcodec_parameters_from_context (stream {index}) failed: {ret}"));
    }
    Ok(())
}

// ── Per-input decode loop ─────────────────────────────────────────────────────

struct SegmentVideo {
    index:      usize,
    decoder:    ffmpeg::decoder::video::Video,
    time_base:  Rational,
    display:    (u32, u32),
    scaler:     Option<ScaleCtx>,
    frame_dur:  f64,
    start:      f64,
    end:        Option<f64>,
    offset:     f64,
    last_t:     f64,
    frames:     u64,
}

impl SegmentVideo {
    /// Encode every frame the decoder has ready. Returns `true` once a frame
    /// past the out-point shows up.
    fn receive(
        &mut self,
        sink:   &mut EncodeSink,
        report: &dyn Fn(f64),
    ) -> std::result::Result<bool, String> {
        let mut decoded = VideoFrame::empty();
        while self.decoder.receive_frame(&mut decoded).is_ok() {
            let t = frame_secs(&decoded, self.time_base).unwrap_or(self.last_t + self.frame_dur);
            self.last_t = t;

            if t < self.start - 0.5 * self.frame_dur {
                continue;
            }
            if self.end.is_some_and(|end| t > end) {
                return Ok(true);
            }

            if self.scaler.is_none() {
                // Display dimensions, not decoded.width/height, so macroblock
                // padding rows are not scaled into the picture.
                let sc = ScaleCtx::get(
                    decoded.format(),  self.display.0,   self.display.1,
                    Pixel::YUV420P,    sink.video.width, sink.video.height,
                    ScaleFlags::BILINEAR,
                )
                .map_err(|e| format!("create swscale context: {e}"))?;
                self.scaler = Some(sc);
            }
            let Some(sc) = self.scaler.as_mut() else {
                return Err("swscale context unavailable".into());
            };

            let mut yuv = VideoFrame::empty();
            sc.run(&decoded, &mut yuv).map_err(|e| format!("scale video frame: {e}"))?;
            sink.video.write(&mut sink.octx, &mut yuv, self.offset + t - self.start)?;

            self.frames += 1;
            if self.frames % PROGRESS_INTERVAL == 0 {
                report(t - self.start);
            }
        }
        Ok(false)
    }
}

struct SegmentAudio {
    index:     usize,
    decoder:   ffmpeg::decoder::audio::Audio,
    time_base: Rational,
    resampler: Option<resampling::Context>,
    start:     f64,
    offset:    f64,
    /// Output sample at which this segment's audio stops.
    limit:     Option<i64>,
}

impl SegmentAudio {
    /// Push every decoded chunk into the sink. Returns `true` once the
    /// segment's audio limit is reached.
    fn receive(&mut self, sink: &mut EncodeSink) -> std::result::Result<bool, String> {
        let EncodeSink { octx, audio, .. } = sink;
        let Some(out) = audio.as_mut() else { return Ok(true) };

        let target_fmt = Sample::F32(SampleType::Planar);
        let mut raw = AudioFrame::empty();
        let mut resampled = AudioFrame::empty();

        while self.decoder.receive_frame(&mut raw).is_ok() {
            let ts = raw.timestamp().or_else(|| raw.pts()).map(|p| p as f64 * f64::from(self.time_base));

            let raw_channels = raw.ch_layout().channels() as u32;
            let needs_resample = raw.format() != target_fmt
                || raw.rate()                  != out.rate
                || raw_channels                != out.channels;

            let frame = if needs_resample {
                if self.resampler.is_none() {
                    // Mono sources must be declared as MONO or swr misreads
                    // the channel layout.
                    let src_layout = if raw_channels >= 2 { raw.ch_layout() } else { ChannelLayout::MONO };
                    let rs = resampling::Context::get2(
                        raw.format(), src_layout,                raw.rate(),
                        target_fmt,   layout_for(out.channels),  out.rate,
                    )
                    .map_err(|e| format!("create audio resampler: {e}"))?;
                    self.resampler = Some(rs);
                }
                let Some(rs) = self.resampler.as_mut() else { continue };
                if rs.run(&raw, &mut resampled).is_err() || resampled.samples() == 0 {
                    continue;
                }
                &resampled
            } else {
                &raw
            };

            let first = match ts {
                Some(ts) => secs_to_samples(self.offset + ts - self.start, out.rate),
                None     => out.written,
            };
            if out.push(octx, frame, first, self.limit)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

fn encode_segment(
    sink:    &mut EncodeSink,
    segment: &Segment,
    report:  &dyn Fn(f64),
    cancel:  &CancelToken,
) -> std::result::Result<(), String> {
    let path = &segment.source;
    let mut ictx = open_input(path).map_err(|e| format!("open '{}': {e}", path.display()))?;
    let info = read_info(path, &ictx);
    let offset = sink.video.end_secs();

    let mut video = {
        let stream = ictx
            .streams()
            .best(MediaType::Video)
            .ok_or_else(|| format!("no video stream in '{}'", path.display()))?;
        let decoder = codec::context::Context::from_parameters(stream.parameters())
            .and_then(|ctx| ctx.decoder().video())
            .map_err(|e| format!("open video decoder: {e}"))?;
        let display = if info.width > 0 && info.height > 0 {
            (info.width, info.height)
        } else {
            (decoder.width(), decoder.height())
        };
        SegmentVideo {
            index: stream.index(),
            decoder,
            time_base: stream.time_base(),
            display,
            scaler: None,
            frame_dur: info.frame_duration().unwrap_or_else(|| f64::from(sink.video.enc_tb)),
            start: segment.start,
            end: segment.end,
            offset,
            last_t: segment.start,
            frames: 0,
        }
    };

    // Audio is optional: a missing or undecodable track only costs silence.
    let mut audio = match (sink.audio.as_ref(), ictx.streams().best(MediaType::Audio)) {
        (Some(out), Some(stream)) => {
            match codec::context::Context::from_parameters(stream.parameters())
                .and_then(|ctx| ctx.decoder().audio())
            {
                Ok(decoder) => Some(SegmentAudio {
                    index: stream.index(),
                    decoder,
                    time_base: stream.time_base(),
                    resampler: None,
                    start: segment.start,
                    offset,
                    limit: segment
                        .end
                        .map(|end| secs_to_samples(offset + end - segment.start, out.rate)),
                }),
                Err(e) => {
                    tracing::warn!(source = %path.display(), error = %e, "audio decoder unavailable, writing silence");
                    None
                }
            }
        }
        _ => None,
    };

    seek_to_secs(&mut ictx, segment.start, "trim");

    let mut video_done = false;
    let mut audio_done = audio.is_none();

    for result in ictx.packets() {
        if let Some(reason) = cancel.check() {
            return Err(reason.as_str().into());
        }
        let (stream, packet) = result.map_err(|e| format!("read packet from '{}': {e}", path.display()))?;
        let sidx = stream.index();

        if sidx == video.index && !video_done {
            if let Err(e) = video.decoder.send_packet(&packet) {
                tracing::debug!(error = %e, "corrupt video packet skipped");
                continue;
            }
            video_done = video.receive(sink, report)?;
        } else if let Some(a) = audio.as_mut().filter(|a| a.index == sidx && !audio_done) {
            if a.decoder.send_packet(&packet).is_err() {
                continue;
            }
            audio_done = a.receive(sink)?;
        }

        if video_done && audio_done {
            break;
        }
    }

    // Decoders with frame reordering hold frames back until EOF.
    if !video_done {
        let _ = video.decoder.send_eof();
        video.receive(sink, report)?;
    }
    if let Some(a) = audio.as_mut().filter(|_| !audio_done) {
        let _ = a.decoder.send_eof();
        a.receive(sink)?;
    }

    // Keep audio as long as the video written for this segment.
    let video_end = sink.video.end_secs();
    let EncodeSink { octx, audio: out, .. } = sink;
    if let Some(out) = out.as_mut() {
        let mut target = secs_to_samples(video_end, out.rate);
        if let Some(limit) = audio.as_ref().and_then(|a| a.limit) {
            target = target.min(limit);
        }
        out.pad_to(octx, target)?;
    }

    tracing::debug!(source = %path.display(), frames = video.frames, "segment encoded");
    Ok(())
}
