//! Preview & export of a finished recording.
//!
//! The artifact is written to the export directory and exposed as a
//! `file://` URL. If a player is configured it is launched on that file.
//! Until a recording exists, playback and export stay hidden.

use std::path::{Path, PathBuf};
use std::process::{Child, Command};

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use tracing::{debug, info, warn};
use url::Url;

use crate::recorder::Artifact;

/// A recording exported for playback.
#[derive(Debug, Clone)]
pub struct Exported {
    pub path: PathBuf,
    pub url: Url,
}

pub struct Preview {
    export_dir: PathBuf,
    player: Option<String>,
    current: Option<Exported>,
    playback: Option<Child>,
}

impl Preview {
    pub fn new(export_dir: PathBuf, player: Option<String>) -> Self {
        Self {
            export_dir,
            player,
            current: None,
            playback: None,
        }
    }

    /// Whether playback and the save affordance are shown.
    pub fn is_visible(&self) -> bool {
        self.current.is_some()
    }

    /// Local URL of the recording currently on display.
    pub fn download_link(&self) -> Option<&Url> {
        self.current.as_ref().map(|e| &e.url)
    }

    /// Export `artifact` and bind it to the player, replacing the previous one.
    pub fn show(&mut self, artifact: &Artifact) -> Result<&Exported> {
        std::fs::create_dir_all(&self.export_dir).with_context(|| {
            format!("Cannot create export directory {}", self.export_dir.display())
        })?;

        let path = self
            .export_dir
            .join(format!("recording-{}.webm", Utc::now().timestamp_millis()));
        std::fs::write(&path, artifact.bytes())
            .with_context(|| format!("Cannot write {}", path.display()))?;

        let absolute = path
            .canonicalize()
            .with_context(|| format!("Cannot resolve {}", path.display()))?;
        let url = Url::from_file_path(&absolute)
            .map_err(|_| anyhow!("Not a local path: {}", absolute.display()))?;

        self.stop_playback();
        if let Some(previous) = self.current.take().filter(|p| p.path != absolute) {
            if let Err(e) = std::fs::remove_file(&previous.path) {
                debug!("Cannot remove previous export {}: {e}", previous.path.display());
            }
        }

        if let Some(player) = &self.player {
            self.playback = launch(player, &absolute);
        }

        info!("Preview ready at {url} ({} bytes)", artifact.len());
        Ok(&*self.current.insert(Exported { path: absolute, url }))
    }

    /// Copy the current recording to `dest`. A directory gets the export's
    /// file name.
    pub fn save_to(&self, dest: &Path) -> Result<PathBuf> {
        let Some(current) = &self.current else {
            bail!("No recorded video available.");
        };

        let target = if dest.is_dir() {
            match current.path.file_name() {
                Some(name) => dest.join(name),
                None => bail!("Export has no file name: {}", current.path.display()),
            }
        } else {
            dest.to_path_buf()
        };

        std::fs::copy(&current.path, &target).with_context(|| {
            format!("Cannot copy {} to {}", current.path.display(), target.display())
        })?;
        info!("Saved recording to {}", target.display());
        Ok(target)
    }

    fn stop_playback(&mut self) {
        if let Some(mut child) = self.playback.take() {
            if let Ok(None) = child.try_wait() {
                let _ = child.kill();
            }
            let _ = child.wait();
        }
    }
}

impl Drop for Preview {
    fn drop(&mut self) {
        self.stop_playback();
    }
}

/// Start `player` (a command line, e.g. `mpv --loop`) on `file`.
fn launch(player: &str, file: &Path) -> Option<Child> {
    let mut parts = player.split_whitespace();
    let program = parts.next()?;
    match Command::new(program).args(parts).arg(file).spawn() {
        Ok(child) => {
            debug!("Player {program} started (pid={})", child.id());
            Some(child)
        }
        Err(e) => {
            warn!("Cannot start player {program}: {e}");
            None
        }
    }
}
