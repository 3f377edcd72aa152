//! Configuration parsing – reads a KEY=VALUE file (`recorder.conf`).
//!
//! The client and the upload server load the same file; each ignores the
//! fields it does not need.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

/// Application configuration, shared between the recorder and the server.
#[derive(Debug, Clone)]
pub struct Config {
    // ── upload server ────────────────────────────────────────────────
    /// Address the upload server listens on.
    pub listen_addr: String,
    /// Directory uploaded videos are written to.
    pub videos_dir: PathBuf,
    /// Largest accepted request body, in bytes.
    pub max_upload_bytes: usize,

    // ── metadata store (server) ──────────────────────────────────────
    pub mongo_uri: String,
    pub mongo_database: String,
    pub mongo_collection: String,

    // ── upload client ────────────────────────────────────────────────
    pub upload_endpoint: String,
    pub upload_timeout_secs: u64,

    // ── capture (client) ─────────────────────────────────────────────
    pub capture_width: u32,
    pub capture_height: u32,
    pub capture_framerate: u32,
    pub ffmpeg_bin: String,
    /// ffmpeg input format for the screen, e.g. `x11grab`, `gdigrab`.
    pub capture_video_format: String,
    /// Display / screen identifier handed to the video input.
    pub capture_display: String,
    /// ffmpeg input format for audio, e.g. `pulse`, `alsa`.
    pub capture_audio_format: String,
    pub capture_audio_device: String,

    // ── preview & export (client) ────────────────────────────────────
    pub export_dir: PathBuf,
    /// Player launched on a finished recording. `None` disables playback.
    pub player: Option<String>,
}

impl Config {
    /// Default config path.
    pub fn default_path() -> &'static str {
        "/etc/screen-recorder/recorder.conf"
    }

    /// Resolve the config path: first CLI argument, then `RECORDER_CONFIG`,
    /// then [`Config::default_path`].
    pub fn path_from_env() -> PathBuf {
        std::env::args()
            .nth(1)
            .or_else(|| std::env::var("RECORDER_CONFIG").ok())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(Self::default_path()))
    }

    /// Public path under which a stored video is served.
    pub fn video_url(file_name: &str) -> String {
        format!("/videos/{file_name}")
    }
}

impl Default for Config {
    fn default() -> Self {
        from_map(&HashMap::new())
    }
}

/// Load the configuration file at `path`.
///
/// A missing file is not an error: every key has a default.
pub fn load(path: &Path) -> Result<Config> {
    if !path.exists() {
        info!("No config at {}, using defaults", path.display());
        return Ok(Config::default());
    }

    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read config: {}", path.display()))?;

    let map = parse_conf(&text);
    info!("Loaded config from {}", path.display());

    Ok(from_map(&map))
}

fn from_map(map: &HashMap<String, String>) -> Config {
    let get = |key: &str| -> Option<String> { map.get(key).cloned().filter(|s| !s.is_empty()) };
    let get_u32 = |key: &str, default: u32| -> u32 {
        get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    };
    let get_u64 = |key: &str, default: u64| -> u64 {
        get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    };

    Config {
        listen_addr: get("LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0:3000".into()),
        videos_dir: PathBuf::from(get("VIDEOS_DIR").unwrap_or_else(|| "videos".into())),
        max_upload_bytes: get("MAX_UPLOAD_BYTES")
            .and_then(|v| v.parse().ok())
            .unwrap_or(1024 * 1024 * 1024),

        mongo_uri: get("MONGO_URI").unwrap_or_else(|| "mongodb://127.0.0.1:27017".into()),
        mongo_database: get("MONGO_DATABASE").unwrap_or_else(|| "records".into()),
        mongo_collection: get("MONGO_COLLECTION").unwrap_or_else(|| "videos".into()),

        upload_endpoint: get("UPLOAD_ENDPOINT")
            .unwrap_or_else(|| "http://localhost:3000/upload".into()),
        upload_timeout_secs: get_u64("UPLOAD_TIMEOUT_SECS", 300),

        capture_width: get_u32("CAPTURE_WIDTH", 1280),
        capture_height: get_u32("CAPTURE_HEIGHT", 720),
        capture_framerate: get_u32("CAPTURE_FRAMERATE", 30),
        ffmpeg_bin: get("FFMPEG_BIN").unwrap_or_else(|| "ffmpeg".into()),
        capture_video_format: get("CAPTURE_VIDEO_FORMAT").unwrap_or_else(|| "x11grab".into()),
        capture_display: get("CAPTURE_DISPLAY").unwrap_or_else(|| ":0.0".into()),
        capture_audio_format: get("CAPTURE_AUDIO_FORMAT").unwrap_or_else(|| "pulse".into()),
        capture_audio_device: get("CAPTURE_AUDIO_DEVICE").unwrap_or_else(|| "default".into()),

        export_dir: PathBuf::from(get("EXPORT_DIR").unwrap_or_else(|| "recordings".into())),
        player: get("PLAYER"),
    }
}

/// Parse `KEY=VALUE` lines into a map, stripping optional double-quotes.
fn parse_conf(text: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, val)) = line.split_once('=') {
            let key = key.trim();
            let val = val.trim().trim_matches('"');
            map.insert(key.to_string(), val.to_string());
        }
    }
    map
}

// ─── tests ───────────────────────────────────────────────────────────────
