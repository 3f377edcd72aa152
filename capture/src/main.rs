//! Screen Recorder – records the screen and microphone, previews the result
//! locally and uploads it to the recorder server.
//!
//! This binary:
//! 1. Reads configuration from `recorder.conf`
//! 2. Reads commands from the terminal (`start`, `stop`, `save`, `upload`, …)
//! 3. Captures through ffmpeg, exports the finished WebM for playback, and
//!    POSTs it to the upload endpoint on request.

mod capture;
mod preview;
mod recorder;
mod upload;

use std::io::{BufRead, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use recorder_common::config::{self, Config};

use crate::capture::{CaptureSettings, CaptureSource, FfmpegSource};
use crate::preview::Preview;
use crate::recorder::{Recorder, RecorderState};
use crate::upload::UploadClient;

/// How often the command loop checks for shutdown and drains capture output.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // ── load config ──────────────────────────────────────────────────
    let config_path = Config::path_from_env();
    let config = config::load(&config_path).context("Config load failed")?;

    info!(
        "Screen Recorder starting (upload endpoint={})",
        config.upload_endpoint
    );

    let mut session = Session {
        recorder: Recorder::new(FfmpegSource, CaptureSettings::from_config(&config)),
        preview: Preview::new(config.export_dir.clone(), config.player.clone()),
        uploader: UploadClient::from_config(&config)?,
    };

    // ── ctrl-c ───────────────────────────────────────────────────────
    // The command loop notices the flag and stops an active recording, so
    // ffmpeg finalizes the file even on SIGTERM, which it never receives.
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_flag.store(true, Ordering::Relaxed);
    })
    .context("Cannot set Ctrl-C handler")?;

    // ── stdin ────────────────────────────────────────────────────────
    let (tx, lines) = mpsc::channel();
    std::thread::Builder::new()
        .name("stdin".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                match line {
                    Ok(l) => {
                        if tx.send(l).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Cannot read command: {e}");
                        break;
                    }
                }
            }
        })
        .context("Cannot spawn stdin reader")?;

    print_help();
    session.prompt();
    session.run(&lines, &shutdown);

    info!("Screen Recorder stopped");
    Ok(())
}

enum Flow {
    Continue,
    Quit,
}

/// Everything the terminal front end drives.
struct Session<S: CaptureSource> {
    recorder: Recorder<S>,
    preview: Preview,
    uploader: UploadClient,
}

impl<S: CaptureSource> Session<S> {
    /// Handle commands until `quit`, end of input or `shutdown`. An active
    /// recording is stopped and previewed before returning.
    fn run(&mut self, lines: &Receiver<String>, shutdown: &AtomicBool) {
        loop {
            match lines.recv_timeout(POLL_INTERVAL) {
                Ok(line) => {
                    if let Flow::Quit = self.handle(&line) {
                        break;
                    }
                    self.recorder.pump();
                    self.prompt();
                }
                Err(RecvTimeoutError::Timeout) => self.recorder.pump(),
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if shutdown.load(Ordering::Relaxed) {
                info!("Shutdown signal received");
                break;
            }
        }

        if self.recorder.state() == RecorderState::Recording {
            self.stop();
        }
    }

    fn handle(&mut self, line: &str) -> Flow {
        let mut words = line.split_whitespace();

        match words.next() {
            Some("start") => self.start(),
            Some("stop") => self.stop(),
            Some("save") => {
                let dest = words.next().unwrap_or(".");
                self.save(Path::new(dest));
            }
            Some("upload") => self.upload(),
            Some("status") => self.status(),
            Some("help") => print_help(),
            Some("quit") | Some("exit") => return Flow::Quit,
            Some(other) => println!("Unknown command: {other} (try `help`)"),
            None => {}
        }
        Flow::Continue
    }

    // ── commands ─────────────────────────────────────────────────────

    fn start(&mut self) {
        if !self.recorder.controls().start_enabled {
            println!("Already recording.");
            return;
        }
        match self.recorder.start() {
            Ok(()) => println!("Recording… type `stop` to finish."),
            Err(e) => println!("Could not start recording: {e}"),
        }
    }

    fn stop(&mut self) {
        let Some(artifact) = self.recorder.stop() else {
            println!("Not recording.");
            return;
        };

        match self.preview.show(artifact) {
            Ok(exported) => {
                println!("Video recording complete! You can now download the video.");
                println!("  preview: {}", exported.url);
            }
            Err(e) => error!("Preview failed: {e:#}"),
        }
    }

    fn save(&self, dest: &Path) {
        if !self.preview.is_visible() {
            alert("No recorded video available.");
            return;
        }
        match self.preview.save_to(dest) {
            Ok(path) => println!("Saved to {}", path.display()),
            Err(e) => println!("Could not save: {e:#}"),
        }
    }

    fn upload(&self) {
        match self.uploader.upload(self.recorder.artifact()) {
            Ok(resp) => {
                info!("{resp:?}");
                alert("Video recorded and uploaded successfully!");
                println!("  {} (id {})", resp.video_url, resp.object_id);
            }
            Err(e) => {
                error!("{e}");
                alert(&e.to_string());
            }
        }
    }

    fn status(&self) {
        println!("state: {:?}", self.recorder.state());
        match self.recorder.artifact() {
            Some(a) => println!("recording: {} bytes ({})", a.len(), a.media_type()),
            None => println!("recording: none"),
        }
        match self.preview.download_link() {
            Some(url) => println!("preview: {url}"),
            None => println!("preview: hidden"),
        }
    }

    fn prompt(&self) {
        let controls = self.recorder.controls();
        let mut available = Vec::new();
        if controls.start_enabled {
            available.push("start");
        }
        if controls.stop_enabled {
            available.push("stop");
        }
        if self.preview.is_visible() {
            available.push("save");
        }
        available.push("upload");
        print!("[{}]> ", available.join("|"));
        let _ = std::io::stdout().flush();
    }
}

// ── terminal ui ──────────────────────────────────────────────────────────

/// Blocking, user-visible message.
fn alert(msg: &str) {
    println!("!! {msg}");
}

fn print_help() {
    println!("Commands:");
    println!("  start          start recording screen and microphone");
    println!("  stop           stop recording and show the preview");
    println!("  save [PATH]    save the recording locally (default: current directory)");
    println!("  upload         upload the recording to the server");
    println!("  status         show recorder state");
    println!("  quit           exit");
}
