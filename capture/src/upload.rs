//! Upload client – sends a finished recording to the recorder server as a
//! single-field multipart form.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::multipart::{Form, Part};
use tracing::{debug, info};

use recorder_common::config::Config;
use recorder_common::protocol::{ErrorResponse, UploadResponse, UPLOAD_FIELD};

use crate::recorder::Artifact;

/// File name sent with the `video` field.
const UPLOAD_FILE_NAME: &str = "recording.webm";

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("No recorded video available.")]
    NoRecording,
    #[error("Error: {}", failure_text(.status, .reason))]
    UploadFailed { status: Option<u16>, reason: String },
}

fn failure_text(status: &Option<u16>, reason: &str) -> String {
    match status {
        Some(code) => format!("{code} {reason}"),
        None => reason.to_string(),
    }
}

pub struct UploadClient {
    client: reqwest::blocking::Client,
    endpoint: String,
}

impl UploadClient {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("Cannot create HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            &config.upload_endpoint,
            Duration::from_secs(config.upload_timeout_secs),
        )
    }

    /// POST the recording once. Nothing is sent when there is no recording.
    pub fn upload(&self, artifact: Option<&Artifact>) -> Result<UploadResponse, UploadError> {
        let artifact = artifact
            .filter(|a| !a.is_empty())
            .ok_or(UploadError::NoRecording)?;

        let part = Part::bytes(artifact.bytes().to_vec())
            .file_name(UPLOAD_FILE_NAME)
            .mime_str(artifact.media_type())
            .map_err(|e| failed(None, e))?;
        let form = Form::new().part(UPLOAD_FIELD, part);

        debug!("POST {} ({} bytes)", self.endpoint, artifact.len());
        let resp = self
            .client
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .map_err(|e| failed(None, e))?;

        let status = resp.status();
        if !status.is_success() {
            let mut reason = status.canonical_reason().unwrap_or("Unknown").to_string();
            if let Ok(body) = resp.json::<ErrorResponse>() {
                if body.error != reason {
                    reason = format!("{reason} ({})", body.error);
                }
            }
            return Err(UploadError::UploadFailed {
                status: Some(status.as_u16()),
                reason,
            });
        }

        let body: UploadResponse = resp
            .json()
            .map_err(|e| failed(Some(status.as_u16()), format!("invalid response: {e}")))?;
        info!("Uploaded recording: {} (id {})", body.video_url, body.object_id);
        Ok(body)
    }
}

fn failed(status: Option<u16>, reason: impl ToString) -> UploadError {
    UploadError::UploadFailed {
        status,
        reason: reason.to_string(),
    }
}
