//! Shared HTTP protocol types for communication between the recorder and
//! the upload server.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Multipart field carrying the recording.
pub const UPLOAD_FIELD: &str = "video";

/// Media type of every recording artifact.
pub const VIDEO_MEDIA_TYPE: &str = "video/webm";

/// `200` body of `POST /upload`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub message: String,
    /// Server-relative path of the stored file, e.g. `/videos/1700000000000-a.webm`.
    pub video_url: String,
    /// Hex ObjectId of the inserted metadata document.
    pub object_id: String,
}

/// Body of `POST /storeVideoUrl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreVideoUrlRequest {
    pub video_url: String,
    /// RFC 3339 timestamp.
    pub timestamp: DateTime<Utc>,
}

/// `201` body of `POST /storeVideoUrl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreVideoUrlResponse {
    pub message: String,
    pub object_id: String,
}

/// Body of every non-2xx response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
