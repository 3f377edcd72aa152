//! Video directory on local disk.
//!
//! Files are named `<epoch-ms>-<original-name>`. The client-supplied name
//! is reduced to a safe final path component, and files are created
//! exclusively so an upload never overwrites an earlier one.

use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::fs::{File, OpenOptions};
use tracing::{info, warn};

/// Name used when the client sends no (usable) file name.
const FALLBACK_NAME: &str = "blob";

/// Attempts at finding a free name before giving up.
const MAX_NAME_ATTEMPTS: i64 = 16;

#[derive(Debug, Clone)]
pub struct VideoDir {
    root: PathBuf,
}

impl VideoDir {
    /// Create `root` if needed. Already existing is fine; any other
    /// failure is returned.
    pub fn ensure(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Cannot create videos directory {}", root.display()))?;
        info!("Storing videos in {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create a new, empty file for an upload named `original_name`.
    ///
    /// Returns the stored file name (relative to the root) and the open file.
    pub async fn create(&self, original_name: &str) -> io::Result<(String, File)> {
        let received = Utc::now().timestamp_millis();
        let safe = sanitize(original_name);

        for attempt in 0..MAX_NAME_ATTEMPTS {
            let name = stored_name(received + attempt, &safe);
            let open = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(self.root.join(&name))
                .await;
            match open {
                Ok(file) => return Ok((name, file)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
        }

        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("no free file name for {safe}"),
        ))
    }

    /// Remove a file written by [`VideoDir::create`]. Best effort.
    pub async fn remove(&self, name: &str) {
        if let Err(e) = tokio::fs::remove_file(self.root.join(name)).await {
            warn!("Cannot remove partial upload {name}: {e}");
        }
    }
}

/// `<epoch-ms>-<name>`.
pub fn stored_name(epoch_ms: i64, name: &str) -> String {
    format!("{epoch_ms}-{name}")
}

/// Keep only the final path component and a conservative character set.
fn sanitize(original: &str) -> String {
    let last = original
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or_default();

    let cleaned: String = last
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        FALLBACK_NAME.to_string()
    } else {
        cleaned.to_string()
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("clip.webm"), "clip.webm");
        assert_eq!(sanitize("../../etc/passwd"), "passwd");
        assert_eq!(sanitize("C:\\Users\\me\\screen cap.webm"), "screen_cap.webm");
        assert_eq!(sanitize(".."), FALLBACK_NAME);
        assert_eq!(sanitize(""), FALLBACK_NAME);
        assert_eq!(sanitize(".hidden"), "hidden");
    }

    #[test]
    fn test_stored_name() {
        assert_eq!(stored_name(1_700_000_000_000, "a.webm"), "1700000000000-a.webm");
    }

    #[test]
    fn test_ensure_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("videos");
        VideoDir::ensure(&root).unwrap();
        VideoDir::ensure(&root).unwrap();
        assert!(root.is_dir());
    }

    #[test]
    fn test_ensure_fails_when_path_is_a_file() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("videos");
        std::fs::write(&root, b"not a dir").unwrap();
        assert!(VideoDir::ensure(&root).is_err());
    }

    #[tokio::test]
    async fn test_create_never_overwrites() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = VideoDir::ensure(tmp.path()).unwrap();

        let (first, mut f) = dir.create("clip.webm").await.unwrap();
        f.write_all(b"one").await.unwrap();
        f.flush().await.unwrap();
        let (second, _) = dir.create("clip.webm").await.unwrap();

        assert_ne!(first, second);
        assert!(first.ends_with("-clip.webm"));
        assert!(second.ends_with("-clip.webm"));
        assert_eq!(std::fs::read(tmp.path().join(&first)).unwrap(), b"one");
    }

    #[tokio::test]
    async fn test_remove() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = VideoDir::ensure(tmp.path()).unwrap();
        let (name, _) = dir.create("x.webm").await.unwrap();
        dir.remove(&name).await;
        assert!(!tmp.path().join(&name).exists());
    }
}
