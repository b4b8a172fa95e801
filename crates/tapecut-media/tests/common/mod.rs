// Shared fixtures for the tapecut-media integration tests.
//
// Media is generated with the ffmpeg CLI from lavfi sources so the tests need
// no binary assets: `testsrc` for picture, `sine` for sound.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;

pub const FPS: f64 = 25.0;

pub struct Fixture {
    pub dir:  TempDir,
    pub path: PathBuf,
}

impl Fixture {
    pub fn out_dir(&self) -> &Path {
        self.dir.path()
    }
}

fn run_ffmpeg(args: &[&str], output: &Path) {
    let status = Command::new("ffmpeg")
        .args(["-y", "-v", "error"])
        .args(args)
        .arg(output)
        .output()
        .expect("ffmpeg must be installed to run tests");
    assert!(
        status.status.success(),
        "ffmpeg command must succeed: {}",
        String::from_utf8_lossy(&status.stderr)
    );
}

/// `secs` of 320×240 testsrc at 25 fps with a stereo 48 kHz sine.
pub fn tape(secs: f64) -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("tape.mp4");
    write_tape(&path, secs, true);
    Fixture { dir, path }
}

/// Same as [`tape`] without an audio stream.
pub fn silent_tape(secs: f64) -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("silent.mp4");
    write_tape(&path, secs, false);
    Fixture { dir, path }
}

/// Write another tape into an existing fixture directory.
pub fn write_tape(path: &Path, secs: f64, with_audio: bool) {
    let duration = format!("{secs}");
    let mut args = vec!["-f", "lavfi", "-i", "testsrc=size=320x240:rate=25"];
    if with_audio {
        args.extend(["-f", "lavfi", "-i", "sine=frequency=440:sample_rate=48000", "-ac", "2", "-c:a", "aac"]);
    }
    args.extend(["-t", duration.as_str(), "-pix_fmt", "yuv420p", "-c:v", "libx264", "-g", "25"]);
    run_ffmpeg(&args, path);
}

/// `secs` of mono sine, no video.
pub fn audio_only(secs: f64) -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("voice.m4a");
    let duration = format!("{secs}");
    run_ffmpeg(
        &["-f", "lavfi", "-i", "sine=frequency=220:sample_rate=44100", "-t", duration.as_str(), "-c:a", "aac"],
        &path,
    );
    Fixture { dir, path }
}
