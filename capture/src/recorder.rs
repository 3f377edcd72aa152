//! Recording lifecycle: `idle → recording → stopped → recording …`.
//!
//! The recorder owns the chunk buffer of the current session. Stopping
//! assembles the buffer into an immutable [`Artifact`] that stays valid
//! until the next stop replaces it.

use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use recorder_common::protocol::VIDEO_MEDIA_TYPE;

use crate::capture::{ActiveCapture, CaptureError, CaptureSettings, CaptureSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Idle,
    Recording,
    Stopped,
}

/// Which commands the user may issue right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Controls {
    pub start_enabled: bool,
    pub stop_enabled: bool,
}

/// A finished recording. Cheap to clone; the bytes are shared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    data: Arc<[u8]>,
    media_type: &'static str,
}

impl Artifact {
    pub fn new(data: Vec<u8>, media_type: &'static str) -> Self {
        Self {
            data: data.into(),
            media_type,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn media_type(&self) -> &'static str {
        self.media_type
    }
}

struct Session {
    capture: Box<dyn ActiveCapture>,
    chunks: Receiver<Vec<u8>>,
    started: Instant,
}

pub struct Recorder<S> {
    source: S,
    settings: CaptureSettings,
    state: RecorderState,
    chunks: Vec<Vec<u8>>,
    session: Option<Session>,
    artifact: Option<Artifact>,
}

impl<S: CaptureSource> Recorder<S> {
    pub fn new(source: S, settings: CaptureSettings) -> Self {
        Self {
            source,
            settings,
            state: RecorderState::Idle,
            chunks: Vec::new(),
            session: None,
            artifact: None,
        }
    }

    pub fn state(&self) -> RecorderState {
        self.state
    }

    pub fn controls(&self) -> Controls {
        let recording = self.state == RecorderState::Recording;
        Controls {
            start_enabled: !recording,
            stop_enabled: recording,
        }
    }

    /// The most recent finished recording, if any.
    pub fn artifact(&self) -> Option<&Artifact> {
        self.artifact.as_ref()
    }

    /// Start a new session. No-op while already recording.
    ///
    /// On failure the recorder keeps its previous state and may be started
    /// again.
    pub fn start(&mut self) -> Result<(), CaptureError> {
        if self.state == RecorderState::Recording {
            debug!("start ignored: already recording");
            return Ok(());
        }

        let (tx, rx) = mpsc::channel();
        let capture = self.source.open(&self.settings, tx).map_err(|e| {
            error!("Error accessing screen and microphone: {e}");
            e
        })?;

        self.chunks.clear();
        self.session = Some(Session {
            capture,
            chunks: rx,
            started: Instant::now(),
        });
        self.state = RecorderState::Recording;
        info!(
            "Recording started ({}x{})",
            self.settings.width, self.settings.height
        );
        Ok(())
    }

    /// Append one encoded chunk. Empty chunks are dropped.
    pub fn on_chunk(&mut self, data: Vec<u8>) {
        if !data.is_empty() {
            self.chunks.push(data);
        }
    }

    /// Move every chunk delivered so far into the session buffer.
    pub fn pump(&mut self) {
        let Some(session) = &self.session else {
            return;
        };
        let pending: Vec<Vec<u8>> = session.chunks.try_iter().collect();
        for chunk in pending {
            self.on_chunk(chunk);
        }
    }

    /// Finish the session and assemble the artifact. Returns `None` (and
    /// does nothing) when not recording.
    pub fn stop(&mut self) -> Option<&Artifact> {
        let session = self.session.take()?;

        if let Err(e) = session.capture.finish() {
            warn!("Capture did not finish cleanly: {e:#}");
        }
        // `finish` has returned, so every chunk is already queued.
        for chunk in session.chunks.try_iter() {
            self.on_chunk(chunk);
        }

        let chunk_count = self.chunks.len();
        let data = std::mem::take(&mut self.chunks).concat();
        let artifact = Artifact::new(data, VIDEO_MEDIA_TYPE);
        info!(
            "Video recording complete: {} bytes in {} chunk(s), {:.1}s",
            artifact.len(),
            chunk_count,
            session.started.elapsed().as_secs_f64()
        );

        self.state = RecorderState::Stopped;
        self.artifact = Some(artifact);
        self.artifact.as_ref()
    }
}

// ─── tests ───────────────────────────────────────────────────────────────
