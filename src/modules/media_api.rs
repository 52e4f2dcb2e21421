/// HTTP API for producers (upload, processing) and theatres (authorization,
/// streaming, expiry checks), plus status, history and audit views.
use crate::error::{AuthError, DeliveryError, PipelineError, SessionError};
use crate::modules::assembler::ShardAssembler;
use crate::modules::audit::AuditLog;
use crate::modules::authorization::AuthorizationService;
use crate::modules::crypto::{AesGcmCipher, ShardCipher};
use crate::modules::delivery::Delivery;
use crate::modules::pipeline::{
    has_allowed_extension, new_movie_id, normalize_theatre_id, sanitize_filename, JobTable,
    ProducerPipeline, ProgressEvent,
};
use crate::modules::session_store::{token_prefix, ExpiryStatus, SessionStore};
use crate::modules::tools::{ByteConcatRemuxer, FfmpegRemuxer, FfmpegSegmenter, Remuxer, Segmenter};
use crate::modules::workspace::Workspace;
use crate::settings::{RemuxerKind, ServerSettings};
use axum::{
    body::Body,
    extract::{rejection::JsonRejection, ConnectInfo, DefaultBodyLimit, Multipart, Path, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures_util::stream;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;

/// Shared state for every handler.
pub struct AppState {
    pub settings: ServerSettings,
    pub workspace: Arc<Workspace>,
    pub audit: Arc<AuditLog>,
    pub sessions: Arc<SessionStore>,
    pub jobs: Arc<JobTable>,
    pub pipeline: Arc<ProducerPipeline>,
    pub authorization: Arc<AuthorizationService>,
    pub delivery: Arc<Delivery>,
}

impl AppState {
    pub fn new(
        settings: ServerSettings,
        segmenter: Arc<dyn Segmenter>,
        remuxer: Arc<dyn Remuxer>,
        cipher: Arc<dyn ShardCipher>,
    ) -> io::Result<Self> {
        let workspace = Arc::new(Workspace::open(&settings.data_dir)?);
        let audit = Arc::new(AuditLog::open(
            workspace.audit_log_path(),
            settings.audit_log_capacity,
        ));
        let sessions = Arc::new(SessionStore::new(audit.clone()));
        let jobs = Arc::new(JobTable::new());

        let pipeline = Arc::new(ProducerPipeline::new(
            workspace.clone(),
            jobs.clone(),
            audit.clone(),
            segmenter,
            cipher.clone(),
            settings.playback_window(),
        ));
        let assembler = ShardAssembler::new(workspace.shards_dir(), cipher, remuxer);
        let authorization = Arc::new(AuthorizationService::new(
            workspace.clone(),
            assembler,
            sessions.clone(),
            audit.clone(),
        ));

        Ok(Self {
            delivery: Arc::new(Delivery::new(sessions.clone())),
            settings,
            workspace,
            audit,
            sessions,
            jobs,
            pipeline,
            authorization,
        })
    }

    /// Production wiring: ffmpeg tools and AES-256-GCM.
    pub fn from_settings(settings: ServerSettings) -> io::Result<Self> {
        let segmenter = Arc::new(FfmpegSegmenter::new(
            &settings.ffmpeg_path,
            &settings.ffprobe_path,
            settings.total_shards,
        ));
        let remuxer: Arc<dyn Remuxer> = match settings.remuxer {
            RemuxerKind::Ffmpeg => Arc::new(FfmpegRemuxer::new(&settings.ffmpeg_path)),
            RemuxerKind::Concat => Arc::new(ByteConcatRemuxer),
        };
        Self::new(settings, segmenter, remuxer, Arc::new(AesGcmCipher))
    }

    /// Drop all sessions and remove every assembled artifact.
    pub fn shutdown(&self) {
        self.sessions.evict_all();
        if let Err(e) = self.workspace.clear_artifacts() {
            warn!("Failed to clear artifacts: {}", e);
        }
        info!("Shutdown cleanup complete");
    }
}

// ==================== Request/Response Types ====================

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    pub movie_id: String,
    pub filename: String,
}

#[derive(Debug, Deserialize)]
pub struct AuthenticateRequest {
    #[serde(default)]
    pub key: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MovieInfo {
    pub shards: usize,
    pub theatre_id: String,
    pub time_remaining: String,
    pub window_end: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthenticateResponse {
    pub success: bool,
    pub token: String,
    pub movie_info: MovieInfo,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: &str, message: impl Into<String>) -> Self {
        Self {
            error: error.to_string(),
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new("invalid_request", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("internal_error", message)
    }

    pub fn status(&self) -> StatusCode {
        match self.error.as_str() {
            "invalid_request" => StatusCode::BAD_REQUEST,
            "invalid_key" => StatusCode::UNAUTHORIZED,
            "too_early" | "expired" => StatusCode::FORBIDDEN,
            "not_ready" | "not_found" => StatusCode::NOT_FOUND,
            "conflict" => StatusCode::CONFLICT,
            "range_not_satisfiable" => StatusCode::RANGE_NOT_SATISFIABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        (self.status(), Json(self)).into_response()
    }
}

impl From<AuthError> for ErrorResponse {
    fn from(e: AuthError) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

impl From<PipelineError> for ErrorResponse {
    fn from(e: PipelineError) -> Self {
        let kind = match &e {
            PipelineError::JobNotFound { .. } => "not_found",
            PipelineError::AlreadyStarted { .. } => "conflict",
            PipelineError::Tool(_) => "tool_failure",
            _ => "internal_error",
        };
        Self::new(kind, e.to_string())
    }
}

impl From<DeliveryError> for ErrorResponse {
    fn from(e: DeliveryError) -> Self {
        let kind = match &e {
            DeliveryError::Session(SessionError::NotFound) => "not_found",
            DeliveryError::Session(SessionError::Expired) => "expired",
            DeliveryError::RangeNotSatisfiable { .. } => "range_not_satisfiable",
            DeliveryError::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => "not_found",
            DeliveryError::Io(_) => "internal_error",
        };
        Self::new(kind, e.to_string())
    }
}

fn client_addr(connect_info: Option<ConnectInfo<SocketAddr>>) -> Option<String> {
    connect_info.map(|ConnectInfo(addr)| addr.ip().to_string())
}

// ==================== Producer Endpoints ====================

/// `POST /api/upload`: multipart `file` plus optional `theatre_id`.
pub async fn upload(
    State(state): State<Arc<AppState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ErrorResponse> {
    let mut theatre_field = None;
    let mut saved: Option<(String, String, std::path::PathBuf)> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                discard_upload(saved.as_ref().map(|(_, _, path)| path.as_path())).await;
                return Err(ErrorResponse::invalid_request(format!(
                    "Malformed upload: {}",
                    e
                )));
            }
        };

        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("theatre_id") => {
                match field.text().await {
                    Ok(text) => theatre_field = Some(text),
                    Err(e) => {
                        discard_upload(saved.as_ref().map(|(_, _, path)| path.as_path())).await;
                        return Err(ErrorResponse::invalid_request(e.to_string()));
                    }
                }
            }
            Some("file") if saved.is_none() => {
                let filename = field
                    .file_name()
                    .and_then(sanitize_filename)
                    .filter(|name| has_allowed_extension(name))
                    .ok_or_else(|| {
                        ErrorResponse::invalid_request(
                            "Invalid file type. Allowed: mp4, mkv, avi, mov",
                        )
                    })?;
                let movie_id = new_movie_id();
                let path = state
                    .workspace
                    .uploads_dir()
                    .join(format!("{}_{}", movie_id, filename));

                if let Err(e) = save_field(field, &path).await {
                    discard_upload(Some(&path)).await;
                    return Err(e);
                }
                saved = Some((movie_id, filename, path));
            }
            _ => {}
        }
    }

    let (movie_id, filename, path) =
        saved.ok_or_else(|| ErrorResponse::invalid_request("No file provided"))?;
    let theatre_id = normalize_theatre_id(
        theatre_field.as_deref(),
        &state.settings.default_theatre_id,
    );

    let source = client_addr(connect_info);
    state.pipeline.register_upload(
        movie_id.clone(),
        filename.clone(),
        theatre_id,
        path,
        source.as_deref(),
    );
    Ok(Json(UploadResponse { movie_id, filename }))
}

async fn save_field(
    mut field: axum::extract::multipart::Field<'_>,
    path: &std::path::Path,
) -> Result<(), ErrorResponse> {
    let mut file = tokio::fs::File::create(path).await.map_err(|e| {
        error!("Failed to create upload {}: {}", path.display(), e);
        ErrorResponse::internal("Failed to store upload")
    })?;
    loop {
        match field.chunk().await {
            Ok(Some(chunk)) => file.write_all(&chunk).await.map_err(|e| {
                error!("Failed to write upload {}: {}", path.display(), e);
                ErrorResponse::internal("Failed to store upload")
            })?,
            Ok(None) => break,
            Err(e) => {
                return Err(ErrorResponse::invalid_request(format!(
                    "Upload interrupted: {}",
                    e
                )))
            }
        }
    }
    file.flush()
        .await
        .map_err(|e| ErrorResponse::internal(e.to_string()))
}

async fn discard_upload(path: Option<&std::path::Path>) {
    if let Some(path) = path {
        let _ = tokio::fs::remove_file(path).await;
    }
}

/// `GET /api/process/:movie_id`: run the pipeline, streaming progress as SSE.
pub async fn process(
    State(state): State<Arc<AppState>>,
    Path(movie_id): Path<String>,
) -> Result<Response, ErrorResponse> {
    let job = state.pipeline.start(&movie_id)?;
    info!("Processing started movie_id={}", job.id);

    let (tx, rx) = mpsc::channel::<ProgressEvent>(16);
    let pipeline = state.pipeline.clone();
    tokio::task::spawn_blocking(move || {
        // A disconnected client does not stop the run.
        let _ = pipeline.run(&job, |event| {
            let _ = tx.blocking_send(event);
        });
    });

    let events = stream::unfold(rx, |mut rx| async move {
        let event = rx.recv().await?;
        Some((Event::default().json_data(&event), rx))
    });

    let headers = [
        (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
        (
            HeaderName::from_static("x-accel-buffering"),
            HeaderValue::from_static("no"),
        ),
    ];
    Ok((headers, Sse::new(events).keep_alive(KeepAlive::default())).into_response())
}

// ==================== Theatre Endpoints ====================

/// `POST /api/authenticate` with `{ "key": "..." }`.
pub async fn authenticate(
    State(state): State<Arc<AppState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    payload: Result<Json<AuthenticateRequest>, JsonRejection>,
) -> Result<Json<AuthenticateResponse>, ErrorResponse> {
    let Json(request) =
        payload.map_err(|e| ErrorResponse::invalid_request(e.body_text()))?;
    let key = request.key.unwrap_or_default();
    let source = client_addr(connect_info);

    let authorization = state.authorization.clone();
    let auth = tokio::task::spawn_blocking(move || {
        authorization.authorize(&key, Utc::now(), source.as_deref())
    })
    .await
    .map_err(|e| {
        error!("Authorization task failed: {}", e);
        ErrorResponse::internal("Authorization task failed")
    })??;

    Ok(Json(AuthenticateResponse {
        success: true,
        movie_info: MovieInfo {
            shards: auth.shards,
            theatre_id: auth.theatre_id.clone(),
            time_remaining: auth.time_remaining(),
            window_end: auth.window_end,
        },
        token: auth.token,
    }))
}

/// `GET /api/stream/:token`, honouring a single `Range`.
pub async fn stream_video(
    State(state): State<Arc<AppState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Path(token): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ErrorResponse> {
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let source = client_addr(connect_info);

    let delivery = state.delivery.clone();
    let lookup = token.clone();
    let planned = tokio::task::spawn_blocking(move || {
        delivery.stream(&lookup, range.as_deref(), Utc::now(), source.as_deref())
    })
    .await
    .map_err(|e| {
        error!("Delivery task failed: {}", e);
        ErrorResponse::internal("Delivery task failed")
    })?;

    let plan = match planned {
        Ok(plan) => plan,
        Err(DeliveryError::RangeNotSatisfiable { len }) => {
            let body = ErrorResponse::new(
                "range_not_satisfiable",
                format!("Requested range not satisfiable for {} bytes", len),
            );
            return Ok((
                StatusCode::RANGE_NOT_SATISFIABLE,
                [(header::CONTENT_RANGE, format!("bytes */{}", len))],
                Json(body),
            )
                .into_response());
        }
        Err(e) => return Err(e.into()),
    };

    let reader = plan.open().await.map_err(DeliveryError::from)?;
    let status = if plan.partial {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };

    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "video/mp4")
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_LENGTH, plan.content_length());
    if let Some(content_range) = plan.content_range() {
        builder = builder.header(header::CONTENT_RANGE, content_range);
    }
    log::debug!(
        "Streaming token={} status={} bytes={}",
        token_prefix(&token),
        status.as_u16(),
        plan.content_length()
    );

    builder
        .body(Body::from_stream(ReaderStream::new(reader)))
        .map_err(|e| ErrorResponse::internal(e.to_string()))
}

/// `GET /api/check-expiry/:token`
pub async fn check_expiry(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Json<Value> {
    let body = match state.sessions.check_expiry(&token, Utc::now()) {
        ExpiryStatus::NotFound => json!({ "expired": true, "reason": "Session not found" }),
        ExpiryStatus::Ended => json!({ "expired": true, "reason": "Playback window ended" }),
        ExpiryStatus::Remaining(seconds) => {
            json!({ "expired": false, "remaining_seconds": seconds })
        }
    };
    Json(body)
}

// ==================== Status Endpoints ====================

/// `GET /api/status`
pub async fn system_status(State(state): State<Arc<AppState>>) -> Json<Value> {
    let manifest = match state.authorization.published_manifest() {
        Ok(manifest) if state.workspace.has_published_shards() => manifest,
        _ => return Json(json!({ "ready": false })),
    };
    let window = manifest.playback_window;
    Json(json!({
        "ready": true,
        "shards": manifest.shards.len(),
        "theatre_id": manifest.theatre_id,
        "playback_active": window.contains(Utc::now()),
        "playback_start": window.start,
        "playback_end": window.end,
    }))
}

/// `GET /api/history`
pub async fn history(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!(state.jobs.history()))
}

/// `GET /api/audit-log`
pub async fn audit_log(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!(state.audit.entries()))
}

pub fn router(state: Arc<AppState>) -> Router {
    let upload_limit = state.settings.max_upload_bytes;
    Router::new()
        .route(
            "/api/upload",
            post(upload).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/api/process/:movie_id", get(process))
        .route("/api/authenticate", post(authenticate))
        .route("/api/stream/:token", get(stream_video))
        .route("/api/status", get(system_status))
        .route("/api/check-expiry/:token", get(check_expiry))
        .route("/api/history", get(history))
        .route("/api/audit-log", get(audit_log))
        .with_state(state)
}
