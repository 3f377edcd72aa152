//! HTTP server accepting recordings from the screen recorder.
//!
//! Routes:
//!   POST /upload          → store the multipart `video` field, record its URL
//!   POST /storeVideoUrl   → record a `{videoUrl, timestamp}` pair directly
//!   GET  /videos/{file}   → serve a stored video

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use axum::extract::multipart::{Field, MultipartRejection};
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    AUTHORIZATION, CONTENT_TYPE,
};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::Json;
use axum::routing::post;
use axum::Router;
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use recorder_common::config::Config;
use recorder_common::protocol::{
    StoreVideoUrlRequest, StoreVideoUrlResponse, UploadResponse, UPLOAD_FIELD,
};

use crate::error::ApiError;
use crate::storage::VideoDir;
use crate::store::{self, VideoStore};

/// Shared state for route handlers.
#[derive(Clone)]
pub struct AppState {
    videos: Arc<VideoDir>,
    store: Arc<dyn VideoStore>,
}

impl AppState {
    pub fn new(videos: VideoDir, store: Arc<dyn VideoStore>) -> Self {
        Self {
            videos: Arc::new(videos),
            store,
        }
    }
}

/// Build the router with CORS applied to every response.
pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    let serve_videos = ServeDir::new(state.videos.root());

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::OPTIONS,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
        ])
        .allow_headers([CONTENT_TYPE, AUTHORIZATION]);

    Router::new()
        .route("/upload", post(upload))
        .route("/storeVideoUrl", post(store_video_url))
        .nest_service("/videos", serve_videos)
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        // CorsLayer only answers preflights with the full set; these put it
        // on every response, errors included.
        .layer(SetResponseHeaderLayer::overriding(
            ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET, POST, OPTIONS, PUT, PATCH, DELETE"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("Content-Type, Authorization"),
        ))
        .with_state(state)
}

/// Start the HTTP server. Blocks until `shutdown` is set.
pub async fn run(state: AppState, config: &Config, shutdown: Arc<AtomicBool>) -> anyhow::Result<()> {
    let app = router(state, config.max_upload_bytes);

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Cannot bind {}", config.listen_addr))?;
    info!("Server is running at http://{}", config.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            loop {
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
            }
        })
        .await?;

    Ok(())
}

// ── route handlers ───────────────────────────────────────────────────────

async fn upload(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<UploadResponse>, ApiError> {
    let multipart = multipart?;

    let mut written = None;
    let received = receive_video(&state.videos, multipart, &mut written).await;
    let file_name = match received {
        Ok(name) => name,
        Err(e) => {
            if let Some(name) = written {
                state.videos.remove(&name).await;
            }
            return Err(e);
        }
    };

    let video_url = Config::video_url(&file_name);
    info!("Stored upload as {video_url}");

    // A failed insert leaves the file on disk.
    let object_id = store::record_video(state.store.as_ref(), video_url.clone(), Utc::now()).await?;

    Ok(Json(UploadResponse {
        message: "Video uploaded successfully".to_string(),
        video_url,
        object_id: object_id.to_hex(),
    }))
}

async fn store_video_url(
    State(state): State<AppState>,
    body: Result<Json<StoreVideoUrlRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<StoreVideoUrlResponse>), ApiError> {
    let Json(req) = body?;
    info!("Received request to store video URL");

    if req.video_url.trim().is_empty() {
        return Err(ApiError::bad_request("videoUrl must not be empty"));
    }
    // Stored as a BSON date, which keeps milliseconds only.
    if req.timestamp.timestamp_subsec_nanos() % 1_000_000 != 0 {
        return Err(ApiError::bad_request(
            "timestamp must not be more precise than milliseconds",
        ));
    }

    let object_id = store::record_video(state.store.as_ref(), req.video_url, req.timestamp).await?;

    Ok((
        StatusCode::CREATED,
        Json(StoreVideoUrlResponse {
            message: "Video URL stored successfully".to_string(),
            object_id: object_id.to_hex(),
        }),
    ))
}

async fn not_found() -> ApiError {
    ApiError::Rejected(StatusCode::NOT_FOUND, "Not Found".to_string())
}

// ── helpers ──────────────────────────────────────────────────────────────

/// Walk the multipart body and write the single `video` field to disk.
///
/// `written` is set as soon as a file exists, so the caller can remove it
/// if anything later fails.
async fn receive_video(
    videos: &VideoDir,
    mut multipart: Multipart,
    written: &mut Option<String>,
) -> Result<String, ApiError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(UPLOAD_FIELD) {
            debug!("Ignoring multipart field {:?}", field.name());
            continue;
        }
        if written.is_some() {
            return Err(ApiError::bad_request("more than one `video` field"));
        }
        save_field(videos, field, written).await?;
    }

    written
        .clone()
        .ok_or_else(|| ApiError::bad_request("missing `video` field"))
}

async fn save_field(
    videos: &VideoDir,
    mut field: Field<'_>,
    written: &mut Option<String>,
) -> Result<(), ApiError> {
    let original = field.file_name().unwrap_or_default().to_string();
    let (name, mut file) = videos
        .create(&original)
        .await
        .context("Cannot create video file")?;
    *written = Some(name);

    let mut size = 0usize;
    while let Some(chunk) = field.chunk().await? {
        size += chunk.len();
        file.write_all(&chunk)
            .await
            .context("Cannot write video file")?;
    }
    file.flush().await.context("Cannot write video file")?;
    file.sync_all().await.context("Cannot sync video file")?;

    debug!("Received {size} bytes for {original:?}");
    Ok(())
}

// ─── tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, Response};
    use chrono::{DateTime, TimeZone};
    use tower::ServiceExt;

    use super::*;
    use crate::store::testing::{FailingStore, MemoryStore};

    const BOUNDARY: &str = "recorder-test-boundary";

    struct Harness {
        _tmp: tempfile::TempDir,
        dir: std::path::PathBuf,
        app: Router,
    }

    fn harness(store: Arc<dyn VideoStore>) -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("videos");
        let videos = VideoDir::ensure(&dir).unwrap();
        let app = router(AppState::new(videos, store), 1024 * 1024);
        Harness { _tmp: tmp, dir, app }
    }

    fn stored_files(dir: &std::path::Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    /// (field name, file name, content)
    fn multipart_request(parts: &[(&str, Option<&str>, &[u8])]) -> Request<Body> {
        let mut body = Vec::new();
        for (name, file_name, data) in parts {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            let header = match file_name {
                Some(f) => format!(
                    "Content-Disposition: form-data; name=\"{name}\"; filename=\"{f}\"\r\n\
                     Content-Type: video/webm\r\n\r\n"
                ),
                None => format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n"),
            };
            body.extend_from_slice(header.as_bytes());
            body.extend_from_slice(data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri("/upload")
            .header(
                CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn json_request(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/storeVideoUrl")
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(resp: Response<Body>) -> serde_json::Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn assert_cors(resp: &Response<Body>) {
        let h = resp.headers();
        assert_eq!(h[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(
            h[ACCESS_CONTROL_ALLOW_METHODS],
            "GET, POST, OPTIONS, PUT, PATCH, DELETE"
        );
        assert_eq!(h[ACCESS_CONTROL_ALLOW_HEADERS], "Content-Type, Authorization");
    }

    #[tokio::test]
    async fn test_upload_writes_file_and_record() {
        let store = Arc::new(MemoryStore::default());
        let h = harness(store.clone());

        let resp = h
            .app
            .oneshot(multipart_request(&[("video", Some("clip.webm"), b"webm-bytes")]))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_cors(&resp);

        let body = json_body(resp).await;
        assert_eq!(body["message"], "Video uploaded successfully");
        let video_url = body["videoUrl"].as_str().unwrap();
        assert!(video_url.starts_with("/videos/"));
        assert!(video_url.ends_with("-clip.webm"));

        let files = stored_files(&h.dir);
        assert_eq!(files.len(), 1);
        assert_eq!(format!("/videos/{}", files[0]), video_url);
        assert_eq!(std::fs::read(h.dir.join(&files[0])).unwrap(), b"webm-bytes");

        let (millis, _) = files[0].split_once('-').unwrap();
        assert!(millis.parse::<i64>().is_ok());

        let records = store.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].video_url, video_url);
        assert_eq!(records[0].id.to_hex(), body["objectId"].as_str().unwrap());
    }

    #[tokio::test]
    async fn test_upload_ignores_other_fields() {
        let store = Arc::new(MemoryStore::default());
        let h = harness(store.clone());

        let resp = h
            .app
            .oneshot(multipart_request(&[
                ("note", None, b"hello"),
                ("video", Some("clip.webm"), b"abc"),
            ]))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(stored_files(&h.dir).len(), 1);
        assert_eq!(store.records().len(), 1);
    }

    #[tokio::test]
    async fn test_upload_without_file_name_uses_fallback() {
        let h = harness(Arc::new(MemoryStore::default()));
        let resp = h
            .app
            .oneshot(multipart_request(&[("video", None, b"abc")]))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let files = stored_files(&h.dir);
        assert!(files[0].ends_with("-blob"));
    }

    #[tokio::test]
    async fn test_upload_keeps_file_when_insert_fails() {
        let h = harness(Arc::new(FailingStore));

        let resp = h
            .app
            .oneshot(multipart_request(&[("video", Some("clip.webm"), b"abc")]))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_cors(&resp);
        assert_eq!(json_body(resp).await["error"], "Internal Server Error");
        assert_eq!(stored_files(&h.dir).len(), 1);
    }

    #[tokio::test]
    async fn test_upload_missing_video_field() {
        let store = Arc::new(MemoryStore::default());
        let h = harness(store.clone());

        let resp = h
            .app
            .oneshot(multipart_request(&[("file", Some("clip.webm"), b"abc")]))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_cors(&resp);
        assert!(json_body(resp).await["error"].as_str().unwrap().contains("video"));
        assert!(stored_files(&h.dir).is_empty());
        assert!(store.records().is_empty());
    }

    #[tokio::test]
    async fn test_upload_rejects_second_video_field() {
        let store = Arc::new(MemoryStore::default());
        let h = harness(store.clone());

        let resp = h
            .app
            .oneshot(multipart_request(&[
                ("video", Some("a.webm"), b"aaa"),
                ("video", Some("b.webm"), b"bbb"),
            ]))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(stored_files(&h.dir).is_empty());
        assert!(store.records().is_empty());
    }

    #[tokio::test]
    async fn test_upload_requires_multipart() {
        let h = harness(Arc::new(MemoryStore::default()));
        let req = Request::builder()
            .method("POST")
            .uri("/upload")
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from("{}"))
            .unwrap();

        let resp = h.app.oneshot(req).await.unwrap();
        assert!(resp.status().is_client_error());
        assert_cors(&resp);
        assert!(stored_files(&h.dir).is_empty());
    }

    #[tokio::test]
    async fn test_upload_cannot_escape_videos_dir() {
        let h = harness(Arc::new(MemoryStore::default()));
        let resp = h
            .app
            .oneshot(multipart_request(&[("video", Some("../../escape.webm"), b"x")]))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let files = stored_files(&h.dir);
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("-escape.webm"));
        assert!(!h.dir.parent().unwrap().join("escape.webm").exists());
    }

    #[tokio::test]
    async fn test_store_video_url_inserts_exact_values() {
        let store = Arc::new(MemoryStore::default());
        let h = harness(store.clone());

        let resp = h
            .app
            .oneshot(json_request(
                r#"{"videoUrl":"/videos/1700000000000-a.webm","timestamp":"2024-03-01T12:00:00.250Z"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_cors(&resp);

        let body = json_body(resp).await;
        assert_eq!(body["message"], "Video URL stored successfully");

        let records = store.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id.to_hex(), body["objectId"].as_str().unwrap());
        assert_eq!(records[0].video_url, "/videos/1700000000000-a.webm");
        let expected: DateTime<Utc> = Utc.timestamp_millis_opt(1_709_294_400_250).unwrap();
        assert_eq!(records[0].timestamp, expected);
    }

    #[tokio::test]
    async fn test_store_video_url_rejects_malformed_body() {
        let store = Arc::new(MemoryStore::default());
        let h = harness(store.clone());

        for body in [
            "not json",
            r#"{"videoUrl":"/videos/a.webm"}"#,
            r#"{"videoUrl":"/videos/a.webm","timestamp":"soon"}"#,
            r#"{"videoUrl":"  ","timestamp":"2024-03-01T12:00:00Z"}"#,
        ] {
            let resp = h.app.clone().oneshot(json_request(body)).await.unwrap();
            assert!(resp.status().is_client_error(), "{body} → {}", resp.status());
            assert_cors(&resp);
        }
        assert!(store.records().is_empty());
    }

    #[tokio::test]
    async fn test_store_video_url_rejects_sub_millisecond_timestamp() {
        let store = Arc::new(MemoryStore::default());
        let h = harness(store.clone());

        let resp = h
            .app
            .oneshot(json_request(
                r#"{"videoUrl":"/videos/a.webm","timestamp":"2024-03-01T12:00:00.123456Z"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_cors(&resp);
        assert!(json_body(resp).await["error"]
            .as_str()
            .unwrap()
            .contains("timestamp"));
        assert!(store.records().is_empty());
    }

    #[tokio::test]
    async fn test_upload_aborted_mid_stream_leaves_nothing() {
        let store = Arc::new(MemoryStore::default());
        let h = harness(store.clone());

        // no closing boundary: the client went away mid-field
        let mut body = format!(
            "--{BOUNDARY}\r\n\
             Content-Disposition: form-data; name=\"video\"; filename=\"clip.webm\"\r\n\
             Content-Type: video/webm\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(&[7u8; 4096]);
        let req = Request::builder()
            .method("POST")
            .uri("/upload")
            .header(
                CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap();

        let resp = h.app.oneshot(req).await.unwrap();
        assert!(resp.status().is_client_error(), "{}", resp.status());
        assert_cors(&resp);
        assert!(json_body(resp).await["error"].is_string());
        assert!(stored_files(&h.dir).is_empty());
        assert!(store.records().is_empty());
    }

    #[tokio::test]
    async fn test_upload_over_limit_leaves_nothing() {
        let store = Arc::new(MemoryStore::default());
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("videos");
        let videos = VideoDir::ensure(&dir).unwrap();
        let app = router(AppState::new(videos, store.clone()), 1024);

        let data = vec![0u8; 100 * 1024];
        let resp = app
            .oneshot(multipart_request(&[("video", Some("big.webm"), data.as_slice())]))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_cors(&resp);
        assert!(json_body(resp).await["error"].is_string());
        assert!(stored_files(&dir).is_empty());
        assert!(store.records().is_empty());
    }

    #[tokio::test]
    async fn test_store_video_url_database_failure() {
        let h = harness(Arc::new(FailingStore));
        let resp = h
            .app
            .oneshot(json_request(
                r#"{"videoUrl":"/videos/a.webm","timestamp":"2024-03-01T12:00:00Z"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json_body(resp).await["error"], "Internal Server Error");
    }

    #[tokio::test]
    async fn test_cors_on_preflight_and_not_found() {
        let h = harness(Arc::new(MemoryStore::default()));

        let preflight = Request::builder()
            .method("OPTIONS")
            .uri("/upload")
            .header("origin", "http://example.com")
            .header("access-control-request-method", "POST")
            .body(Body::empty())
            .unwrap();
        let resp = h.app.clone().oneshot(preflight).await.unwrap();
        assert!(resp.status().is_success());
        assert_cors(&resp);

        let missing = Request::builder()
            .uri("/nothing-here")
            .body(Body::empty())
            .unwrap();
        let resp = h.app.oneshot(missing).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_cors(&resp);
    }

    #[tokio::test]
    async fn test_stored_video_is_served() {
        let h = harness(Arc::new(MemoryStore::default()));
        let resp = h
            .app
            .clone()
            .oneshot(multipart_request(&[("video", Some("clip.webm"), b"abc")]))
            .await
            .unwrap();
        let video_url = json_body(resp).await["videoUrl"]
            .as_str()
            .unwrap()
            .to_string();

        let get = Request::builder().uri(video_url.as_str()).body(Body::empty()).unwrap();
        let resp = h.app.oneshot(get).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"abc");
    }
}
