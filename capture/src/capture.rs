//! Screen + microphone capture – spawns `ffmpeg` as a child process and
//! streams its WebM output as chunks.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tracing::{debug, info, warn};

use recorder_common::config::Config;

/// Largest chunk handed to the recorder.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// stderr lines kept for classifying a failed start.
const STDERR_TAIL: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),
}

/// What to capture and how.
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    pub ffmpeg_bin: String,
    pub video_format: String,
    pub display: String,
    pub audio_format: String,
    pub audio_device: String,
}

impl CaptureSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            width: config.capture_width,
            height: config.capture_height,
            framerate: config.capture_framerate,
            ffmpeg_bin: config.ffmpeg_bin.clone(),
            video_format: config.capture_video_format.clone(),
            display: config.capture_display.clone(),
            audio_format: config.capture_audio_format.clone(),
            audio_device: config.capture_audio_device.clone(),
        }
    }

    /// ffmpeg arguments: screen + audio in, VP8/Opus WebM out on stdout.
    fn ffmpeg_args(&self) -> Vec<String> {
        let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.extend([
            "-f".into(),
            self.video_format.clone(),
            "-framerate".into(),
            self.framerate.to_string(),
            "-video_size".into(),
            format!("{}x{}", self.width, self.height),
            "-i".into(),
            self.display.clone(),
            "-f".into(),
            self.audio_format.clone(),
            "-i".into(),
            self.audio_device.clone(),
            "-c:v".into(),
            "libvpx".into(),
            "-deadline".into(),
            "realtime".into(),
            "-b:v".into(),
            "2M".into(),
            "-c:a".into(),
            "libopus".into(),
            "-f".into(),
            "webm".into(),
            "pipe:1".into(),
        ]);
        args
    }
}

/// Platform capture mechanism.
pub trait CaptureSource {
    /// Begin capturing. Encoded chunks are sent on `chunks` in the order
    /// they are produced.
    fn open(
        &mut self,
        settings: &CaptureSettings,
        chunks: Sender<Vec<u8>>,
    ) -> Result<Box<dyn ActiveCapture>, CaptureError>;
}

/// A running capture.
pub trait ActiveCapture {
    /// Stop capturing. Returns once every chunk has been sent.
    fn finish(self: Box<Self>) -> Result<()>;
}

// ── ffmpeg ───────────────────────────────────────────────────────────────

pub struct FfmpegSource;

impl CaptureSource for FfmpegSource {
    fn open(
        &mut self,
        settings: &CaptureSettings,
        chunks: Sender<Vec<u8>>,
    ) -> Result<Box<dyn ActiveCapture>, CaptureError> {
        let args = settings.ffmpeg_args();
        debug!("Spawning: {} {}", settings.ffmpeg_bin, args.join(" "));

        let mut child = Command::new(&settings.ffmpeg_bin)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                CaptureError::DeviceUnavailable(format!("cannot run {}: {e}", settings.ffmpeg_bin))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CaptureError::DeviceUnavailable("ffmpeg stdout not piped".into()))?;
        let reader = match std::thread::Builder::new()
            .name("ffmpeg-stdout".into())
            .spawn(move || pump(stdout, &chunks))
        {
            Ok(reader) => reader,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(CaptureError::DeviceUnavailable(format!(
                    "cannot spawn reader: {e}"
                )));
            }
        };

        // Drain stderr in a background thread so we see device errors and
        // the pipe buffer doesn't fill up and block ffmpeg.
        let tail = Arc::new(Mutex::new(VecDeque::<String>::new()));
        if let Some(stderr) = child.stderr.take() {
            let tail = tail.clone();
            let spawned = std::thread::Builder::new()
                .name("ffmpeg-stderr".into())
                .spawn(move || drain_stderr(stderr, &tail));
            if let Err(e) = spawned {
                let _ = child.kill();
                let _ = child.wait();
                return Err(CaptureError::DeviceUnavailable(format!(
                    "cannot spawn stderr reader: {e}"
                )));
            }
        }

        // Give ffmpeg a moment to fail on a bad device before declaring success.
        std::thread::sleep(Duration::from_millis(500));
        match child.try_wait() {
            Ok(Some(status)) => {
                let _ = reader.join();
                // Let the stderr thread catch up with the last lines.
                std::thread::sleep(Duration::from_millis(50));
                let stderr = tail
                    .lock()
                    .map(|t| t.iter().cloned().collect::<Vec<_>>().join("\n"))
                    .unwrap_or_default();
                return Err(classify(&format!("ffmpeg exited with {status}: {stderr}")));
            }
            Ok(None) => {} // still running – good
            Err(e) => warn!("Cannot check ffmpeg status: {e}"),
        }

        info!(
            "ffmpeg started (pid={}, {}x{} from {} {}, audio {} {})",
            child.id(),
            settings.width,
            settings.height,
            settings.video_format,
            settings.display,
            settings.audio_format,
            settings.audio_device,
        );

        Ok(Box::new(FfmpegCapture {
            child,
            reader: Some(reader),
        }))
    }
}

struct FfmpegCapture {
    child: Child,
    reader: Option<JoinHandle<()>>,
}

impl ActiveCapture for FfmpegCapture {
    fn finish(mut self: Box<Self>) -> Result<()> {
        // `q` asks ffmpeg to finalize the container and exit.
        if let Some(mut stdin) = self.child.stdin.take() {
            if let Err(e) = stdin.write_all(b"q\n") {
                warn!("Cannot ask ffmpeg to stop: {e}");
            }
        }

        let status = self.child.wait().context("Cannot wait for ffmpeg")?;
        if let Some(reader) = self.reader.take() {
            reader
                .join()
                .map_err(|_| anyhow!("ffmpeg reader thread panicked"))?;
        }

        if !status.success() {
            warn!("ffmpeg exited with {status}");
        }
        info!("ffmpeg stopped");
        Ok(())
    }
}

impl Drop for FfmpegCapture {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Forward everything readable from `out` as chunks of at most [`CHUNK_SIZE`].
fn pump<R: Read>(mut out: R, chunks: &Sender<Vec<u8>>) {
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        match out.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if chunks.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("Capture stream read failed: {e}");
                break;
            }
        }
    }
    debug!("capture stream ended");
}

/// Log every stderr line and keep the last [`STDERR_TAIL`] of them.
fn drain_stderr<R: Read>(stderr: R, tail: &Mutex<VecDeque<String>>) {
    for line in BufReader::new(stderr).lines() {
        match line {
            Ok(l) if l.is_empty() => {}
            Ok(l) => {
                warn!("[ffmpeg] {l}");
                if let Ok(mut tail) = tail.lock() {
                    if tail.len() == STDERR_TAIL {
                        tail.pop_front();
                    }
                    tail.push_back(l);
                }
            }
            Err(_) => break,
        }
    }
    debug!("ffmpeg stderr stream ended");
}

/// Map ffmpeg's failure output onto a capture error.
fn classify(detail: &str) -> CaptureError {
    let lower = detail.to_lowercase();
    if lower.contains("permission denied")
        || lower.contains("operation not permitted")
        || lower.contains("not authorized")
    {
        CaptureError::PermissionDenied(detail.to_string())
    } else {
        CaptureError::DeviceUnavailable(detail.to_string())
    }
}
