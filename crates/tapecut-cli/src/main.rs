// crates/tapecut-cli/src/main.rs
//
// `tapecut`: headless front-end over tapecut-media. Every subcommand maps to
// one engine entry point so the engine can be driven from scripts and CI.

use std::cell::Cell;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use tapecut_core::{
    CancelToken, EngineConfig, ExportQueue, ExportTask, PreviewSlot, QueueEvent, TaskList,
    TaskOutcome, VideoFrame,
};
use tapecut_media::{MediaSession, PreviewService, TrimExporter};

/// How long `frame` waits for the preview thread before giving up.
const PREVIEW_WAIT: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(
    name = "tapecut",
    version,
    about = "Trim and export digitized tape recordings",
    long_about = "tapecut cuts ranges out of digitized analog tapes and re-encodes them to H.264/AAC MP4, one file at a time or as a parallel batch."
)]
struct Cli {
    /// Configuration file (TOML). Defaults apply when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print container and stream parameters
    Probe {
        file: PathBuf,
    },
    /// Grab one preview frame and save it as PNG
    Frame {
        file: PathBuf,
        /// Timestamp in seconds
        #[arg(long)]
        at: f64,
        #[arg(long)]
        out: PathBuf,
        #[arg(long, value_enum, default_value_t = SlotArg::Start)]
        slot: SlotArg,
    },
    /// Export one range of a file
    Trim {
        file: PathBuf,
        #[arg(long)]
        start: f64,
        #[arg(long)]
        end: f64,
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
        /// Output file name, `.mp4` appended when missing. Defaults to the source name.
        #[arg(long)]
        name: Option<String>,
    },
    /// Concatenate whole files into one
    Join {
        #[arg(required = true, num_args = 2..)]
        inputs: Vec<PathBuf>,
        #[arg(long)]
        out: PathBuf,
    },
    /// Run every `[[task]]` of a batch file through the export queue
    Batch {
        jobs: PathBuf,
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
    },
    /// Print the effective configuration
    Config,
}

#[derive(Clone, Copy, ValueEnum)]
enum SlotArg {
    Start,
    End,
}

impl From<SlotArg> for PreviewSlot {
    fn from(slot: SlotArg) -> Self {
        match slot {
            SlotArg::Start => PreviewSlot::Start,
            SlotArg::End   => PreviewSlot::End,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    tapecut_media::init();
    tapecut_media::quiet_ffmpeg_logs();

    let config = match &cli.config {
        Some(path) => {
            info!(path = %path.display(), "loading configuration");
            EngineConfig::from_file(path)?
        }
        None => EngineConfig::default(),
    };

    match cli.command {
        Command::Probe { file } => probe(&file),
        Command::Frame { file, at, out, slot } => frame(&config, &file, at, &out, slot.into()),
        Command::Trim { file, start, end, out_dir, name } => {
            trim(&config, &file, start, end, &out_dir, name.as_deref())
        }
        Command::Join { inputs, out } => join(&config, &inputs, &out),
        Command::Batch { jobs, out_dir } => batch(&config, &jobs, &out_dir),
        Command::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn probe(file: &Path) -> Result<()> {
    let info = tapecut_media::probe(file)?;
    print!("{info}");
    Ok(())
}

fn frame(config: &EngineConfig, file: &Path, at: f64, out: &Path, slot: PreviewSlot) -> Result<()> {
    let session = Arc::new(MediaSession::open_with(file, &config.preview)?);
    let mut service = PreviewService::new(&config.preview);
    let ticket = service.request_preview(&session, at, slot);

    let result = loop {
        let result = service
            .results()
            .recv_timeout(PREVIEW_WAIT)
            .context("preview thread did not answer")?;
        if result.ticket() == ticket {
            break result;
        }
    };
    service.shutdown();

    let Some(frame) = result.frame() else {
        bail!("no frame at {at}s in {}", file.display());
    };
    write_png(frame, out)?;
    println!("{}", out.display());
    Ok(())
}

fn write_png(frame: &VideoFrame, dest: &Path) -> Result<()> {
    let file = File::create(dest).with_context(|| format!("create {}", dest.display()))?;
    let w = &mut BufWriter::new(file);
    let mut encoder = png::Encoder::new(w, frame.width, frame.height);
    encoder.set_color(png::ColorType::Rgba);
    encoder.set_depth(png::BitDepth::Eight);
    let mut writer = encoder.write_header()?;
    writer.write_image_data(&frame.data)?;
    Ok(())
}

fn trim(
    config:  &EngineConfig,
    file:    &Path,
    start:   f64,
    end:     f64,
    out_dir: &Path,
    name:    Option<&str>,
) -> Result<()> {
    let name = match name {
        Some(name) => name.to_string(),
        None => file
            .file_stem()
            .and_then(|s| s.to_str())
            .map(str::to_string)
            .context("source has no usable file name; pass --name")?,
    };
    let exporter = TrimExporter::new(config.export.clone());
    let progress = ProgressLine::new("trim");
    let output = exporter.export(file, out_dir, &name, start, end, &|p| progress.update(p), &CancelToken::new())?;
    progress.finish();
    println!("{}", output.display());
    Ok(())
}

fn join(config: &EngineConfig, inputs: &[PathBuf], out: &Path) -> Result<()> {
    let exporter = TrimExporter::new(config.export.clone());
    let progress = ProgressLine::new("join");
    let output = exporter.join(inputs, out, &|p| progress.update(p), &CancelToken::new())?;
    progress.finish();
    println!("{}", output.display());
    Ok(())
}

fn batch(config: &EngineConfig, jobs: &Path, out_dir: &Path) -> Result<()> {
    let text = std::fs::read_to_string(jobs).with_context(|| format!("read {}", jobs.display()))?;
    let mut list: TaskList = toml::from_str(&text).with_context(|| format!("parse {}", jobs.display()))?;
    if list.tasks.is_empty() {
        bail!("{} has no [[task]] entries", jobs.display());
    }

    // Relative sources are relative to the batch file.
    let base = jobs.parent().unwrap_or_else(|| Path::new("."));
    for entry in &mut list.tasks {
        if entry.source.is_relative() {
            entry.source = base.join(&entry.source);
        }
    }

    let queue = ExportQueue::new(config.queue.clone());
    let mut names = std::collections::HashMap::new();
    for (i, entry) in list.tasks.iter().enumerate() {
        let task = ExportTask::from_entry(entry).with_context(|| format!("task #{}", i + 1))?;
        names.insert(task.id(), task.normalized_output_name());
        queue.add(task);
    }

    let exporter = Arc::new(TrimExporter::new(config.export.clone()));
    let handle = queue.run_all(exporter, out_dir)?;
    let mut last_percent = None;

    for event in handle.events().iter() {
        match event {
            QueueEvent::TaskStarted { task } => {
                eprintln!("started   {}", names.get(&task).map_or("?", String::as_str));
            }
            QueueEvent::Progress { overall, .. } => {
                let percent = (overall * 100.0).floor() as u32;
                if last_percent != Some(percent) {
                    last_percent = Some(percent);
                    eprint!("\r{percent:>3}%");
                    let _ = std::io::stderr().flush();
                }
            }
            QueueEvent::TaskFinished { task, outcome } => {
                let name = names.get(&task).map_or("?", String::as_str);
                match outcome {
                    TaskOutcome::Succeeded(path) => eprintln!("\rdone      {name} -> {}", path.display()),
                    TaskOutcome::Failed(reason)  => eprintln!("\rfailed    {name}: {reason}"),
                }
            }
            QueueEvent::BatchComplete(_) => break,
        }
    }

    let summary = handle.wait();
    println!(
        "{} of {} exported to {}",
        summary.succeeded,
        summary.total,
        summary.output_dir.display()
    );
    if summary.failed > 0 {
        bail!("{} task(s) failed", summary.failed);
    }
    Ok(())
}

/// Single-line percentage on stderr, redrawn only when the whole percent changes.
struct ProgressLine {
    label: &'static str,
    last:  Cell<Option<u32>>,
}

impl ProgressLine {
    fn new(label: &'static str) -> Self {
        Self { label, last: Cell::new(None) }
    }

    fn update(&self, fraction: f64) {
        let percent = (fraction.clamp(0.0, 1.0) * 100.0).floor() as u32;
        if self.last.get() != Some(percent) {
            self.last.set(Some(percent));
            eprint!("\r{} {percent:>3}%", self.label);
            let _ = std::io::stderr().flush();
        }
    }

    fn finish(&self) {
        eprintln!();
    }
}
