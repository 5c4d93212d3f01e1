#![forbid(unsafe_code)]

//! HTTP and WebSocket front of the TubeVault download service.
//!
//! Clients submit a URL, get the video's metadata back immediately, and
//! follow the transfer over `/ws`. Finished files are served from the storage
//! directory together with a static UI bundle when one is configured.

use std::{
    net::{IpAddr, SocketAddr},
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Body,
    extract::{
        Path as AxumPath, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, Request, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::Parser;
use futures::{Sink, SinkExt, Stream, StreamExt};
use mime_guess::{MimeGuess, mime::Mime};
use serde::{Deserialize, Serialize};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
    select, signal,
};
use tokio_util::io::ReaderStream;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tubevault::{
    config::{RuntimeOverrides, resolve_runtime_config},
    error::JobError,
    error_log::ErrorLog,
    extractor::{MediaExtractor, YtDlp},
    hub::{ChannelSink, NotificationHub, SUBSCRIBER_BUFFER},
    jobs::{Job, JobId},
    library::{LibraryEntry, is_reserved_name, list_library},
    logging::init_logging,
    metadata::MetadataStore,
    orchestrator::{DownloadOrchestrator, OrchestratorSettings, VideoDescriptor},
    security::ensure_unprivileged,
};

#[derive(Debug, Clone, Default, Parser)]
#[command(name = "backend", about = "Download service with live progress over WebSocket")]
struct BackendArgs {
    /// Directory holding downloaded media, metadata and error.log.
    #[arg(long)]
    storage: Option<PathBuf>,
    /// Static UI bundle to serve for non-API paths.
    #[arg(long)]
    www_root: Option<PathBuf>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    max_concurrent: Option<usize>,
    /// Optional TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Alternative `.env` file.
    #[arg(long)]
    env_file: Option<PathBuf>,
}

impl BackendArgs {
    fn into_overrides(self) -> RuntimeOverrides {
        RuntimeOverrides {
            storage_root: self.storage,
            www_root: self.www_root,
            port: self.port,
            host: self.host,
            max_concurrent: self.max_concurrent,
            env_path: self.env_file,
            config_path: self.config,
        }
    }
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .trim()
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/TUBEVAULT_HOST")
}

struct AppState<E> {
    orchestrator: DownloadOrchestrator<E>,
    storage_root: Arc<PathBuf>,
    www_root: Option<Arc<PathBuf>>,
}

impl<E> Clone for AppState<E> {
    fn clone(&self) -> Self {
        Self {
            orchestrator: self.orchestrator.clone(),
            storage_root: self.storage_root.clone(),
            www_root: self.www_root.clone(),
        }
    }
}

impl<E: MediaExtractor> AppState<E> {
    fn hub(&self) -> &Arc<NotificationHub> {
        self.orchestrator.hub()
    }

    fn store(&self) -> &Arc<MetadataStore> {
        self.orchestrator.store()
    }

    fn errors(&self) -> &Arc<ErrorLog> {
        self.orchestrator.errors()
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        let status = StatusCode::from_u16(err.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let message = match err {
            JobError::InvalidRequest(message) => message,
            other => other.to_string(),
        };
        Self { status, message }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
struct DownloadRequest {
    #[serde(default, rename = "sourceURL", alias = "url")]
    source_url: Option<String>,
    #[serde(default, rename = "clientJobId", alias = "downloadId")]
    client_job_id: Option<JobId>,
}

#[derive(Debug, Serialize)]
struct DownloadResponse {
    message: &'static str,
    video: VideoDescriptor,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = BackendArgs::parse();
    init_logging("info")?;

    let config = resolve_runtime_config(args.into_overrides())?;
    ensure_unprivileged("backend", config.allow_root)?;
    let host = parse_host_arg(&config.host)?;

    tokio::fs::create_dir_all(&config.storage_root)
        .await
        .with_context(|| format!("creating storage directory {}", config.storage_root.display()))?;
    let store = MetadataStore::load(&MetadataStore::document_path(&config.storage_root))
        .await
        .context("loading metadata document")?;

    let orchestrator = DownloadOrchestrator::new(
        YtDlp::new(config.ytdlp.clone()),
        Arc::new(NotificationHub::new()),
        Arc::new(store),
        Arc::new(ErrorLog::new(&config.storage_root)),
        OrchestratorSettings::from_runtime(&config),
    );
    let state = AppState {
        orchestrator: orchestrator.clone(),
        storage_root: Arc::new(config.storage_root.clone()),
        www_root: config.www_root.clone().map(Arc::new),
    };

    let addr = SocketAddr::new(host, config.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    tracing::info!(%addr, storage = %config.storage_root.display(), "server listening");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    orchestrator.shutdown().await;
    tracing::info!("server stopped");
    Ok(())
}

fn build_router<E: MediaExtractor>(state: AppState<E>) -> Router {
    Router::new()
        .route("/api/download", post(start_download::<E>))
        .route("/api/videos", get(list_videos::<E>))
        .route("/api/downloads/{id}", get(get_download_status::<E>))
        .route("/ws", get(ws_handler::<E>))
        .route("/videos/{file}", get(stream_video::<E>))
        .fallback(static_fallback::<E>)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to install Ctrl+C handler");
    }
    tracing::info!("shutdown requested");
}

async fn start_download<E: MediaExtractor>(
    State(state): State<AppState<E>>,
    Json(payload): Json<DownloadRequest>,
) -> ApiResult<Json<DownloadResponse>> {
    let url = payload
        .source_url
        .filter(|url| !url.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("URL is required"))?;
    let job = state
        .orchestrator
        .submit(&url, payload.client_job_id)
        .await?;
    Ok(Json(DownloadResponse {
        message: "Starting download",
        video: job.video,
    }))
}

async fn list_videos<E: MediaExtractor>(
    State(state): State<AppState<E>>,
) -> ApiResult<Json<Vec<LibraryEntry>>> {
    let records = state.store().snapshot().await;
    let dir = state.storage_root.clone();
    let listing = tokio::task::spawn_blocking(move || list_library(&dir, &records))
        .await
        .context("listing task panicked")
        .and_then(|result| result);

    match listing {
        Ok((entries, skipped)) => {
            for err in &skipped {
                state.errors().record_anyhow("Library listing", err).await;
            }
            Ok(Json(entries))
        }
        Err(err) => {
            state.errors().record_anyhow("Failed to list videos", &err).await;
            Err(ApiError::internal("Failed to list videos"))
        }
    }
}

async fn get_download_status<E: MediaExtractor>(
    State(state): State<AppState<E>>,
    AxumPath(id): AxumPath<u64>,
) -> ApiResult<Json<Job>> {
    state
        .orchestrator
        .job(JobId(id))
        .map(Json)
        .ok_or_else(|| ApiError::not_found("download not found"))
}

async fn ws_handler<E: MediaExtractor>(
    ws: WebSocketUpgrade,
    State(state): State<AppState<E>>,
) -> Response {
    let hub = state.hub().clone();
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

async fn handle_socket(socket: WebSocket, hub: Arc<NotificationHub>) {
    let (sender, receiver) = socket.split();
    forward_events(sender, receiver, hub).await;
}

/// Forwards every hub event to one client until either side goes away.
/// Inbound frames other than close are ignored.
async fn forward_events<S, R, Err>(mut sender: S, mut receiver: R, hub: Arc<NotificationHub>)
where
    S: Sink<Message> + Unpin,
    R: Stream<Item = Result<Message, Err>> + Unpin,
    Err: std::fmt::Display,
{
    let (sink, mut events) = ChannelSink::new(SUBSCRIBER_BUFFER);
    let handle = hub.register(Arc::new(sink));

    loop {
        select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match serde_json::to_string(&event) {
                    Ok(json) => {
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => tracing::error!(error = %err, "failed to serialize event"),
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(err)) => {
                    tracing::debug!(error = %err, "websocket receive failed");
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    hub.unregister(handle);
}

async fn stream_video<E: MediaExtractor>(
    State(state): State<AppState<E>>,
    AxumPath(file): AxumPath<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    ensure_safe_path_segment(&file)?;
    if is_reserved_name(&file) {
        return Err(ApiError::not_found("file not found"));
    }
    stream_file(state.storage_root.join(&file), None, Some(&headers)).await
}

async fn static_fallback<E: MediaExtractor>(
    State(state): State<AppState<E>>,
    req: Request<Body>,
) -> Response {
    let path = req.uri().path();
    if path == "/api" || path.starts_with("/api/") {
        return ApiError::not_found("endpoint not found").into_response();
    }
    let Some(root) = state.www_root.as_deref() else {
        return ApiError::not_found("file not found").into_response();
    };

    match serve_www_path(root, path).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn serve_www_path(root: &Path, request_path: &str) -> ApiResult<Response> {
    let target = resolve_www_path(root, request_path)?;
    match tokio::fs::metadata(&target).await {
        Ok(meta) if meta.is_dir() => stream_file(root.join("index.html"), None, None).await,
        Ok(_) => stream_file(target, None, None).await,
        Err(_) if should_fallback_to_index(request_path) => {
            stream_file(root.join("index.html"), None, None).await
        }
        Err(_) => Err(ApiError::not_found("file not found")),
    }
}

fn resolve_www_path(root: &Path, request_path: &str) -> ApiResult<PathBuf> {
    let trimmed = request_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Ok(root.join("index.html"));
    }
    let candidate = Path::new(trimmed);
    if candidate
        .components()
        .any(|component| !matches!(component, Component::Normal(_)))
    {
        return Err(ApiError::not_found("file not found"));
    }
    Ok(root.join(candidate))
}

/// Client-side routes have no extension; asset misses stay 404.
fn should_fallback_to_index(request_path: &str) -> bool {
    Path::new(request_path.trim_start_matches('/'))
        .extension()
        .is_none()
}

fn ensure_safe_path_segment(value: &str) -> ApiResult<()> {
    let mut components = Path::new(value).components();
    let single_normal = matches!(components.next(), Some(Component::Normal(_)))
        && components.next().is_none();
    if !single_normal {
        return Err(ApiError::not_found("file not found"));
    }
    Ok(())
}

async fn stream_file(
    path: PathBuf,
    mime: Option<Mime>,
    headers: Option<&HeaderMap>,
) -> ApiResult<Response> {
    let mut file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let metadata = file
        .metadata()
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    if !metadata.is_file() {
        return Err(ApiError::not_found("file not found"));
    }
    let size = metadata.len();

    let guessed = mime.or_else(|| MimeGuess::from_path(&path).first());
    let range = headers
        .and_then(|headers| headers.get(header::RANGE))
        .and_then(|value| parse_range_header(value, size));

    let mut response = match range {
        Some((start, _)) if start >= size => {
            let mut response = StatusCode::RANGE_NOT_SATISFIABLE.into_response();
            if let Ok(value) = format!("bytes */{size}").parse() {
                response.headers_mut().insert(header::CONTENT_RANGE, value);
            }
            return Ok(response);
        }
        Some((start, end)) => {
            let end = end.min(size.saturating_sub(1));
            let length = end - start + 1;
            file.seek(std::io::SeekFrom::Start(start))
                .await
                .map_err(|_| ApiError::internal("failed to seek media file"))?;
            let body = Body::from_stream(ReaderStream::new(file.take(length)));
            let mut response = body.into_response();
            *response.status_mut() = StatusCode::PARTIAL_CONTENT;
            let headers = response.headers_mut();
            if let Ok(value) = format!("bytes {start}-{end}/{size}").parse() {
                headers.insert(header::CONTENT_RANGE, value);
            }
            headers.insert(header::CONTENT_LENGTH, length.into());
            response
        }
        None => {
            let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
            response.headers_mut().insert(header::CONTENT_LENGTH, size.into());
            response
        }
    };

    let headers = response.headers_mut();
    headers.insert(header::ACCEPT_RANGES, header::HeaderValue::from_static("bytes"));
    if let Some(mime) = guessed
        && let Ok(value) = mime.to_string().parse()
    {
        headers.insert(header::CONTENT_TYPE, value);
    }

    Ok(response)
}

/// Single `bytes=` range, including open-ended and suffix forms.
fn parse_range_header(value: &header::HeaderValue, size: u64) -> Option<(u64, u64)> {
    let value = value.to_str().ok()?.trim();
    let range = value.strip_prefix("bytes=")?.trim();
    if range.is_empty() || range.contains(',') {
        return None;
    }
    let (start_str, end_str) = range.split_once('-')?;

    if start_str.is_empty() {
        let suffix_len: u64 = end_str.parse().ok()?;
        if suffix_len == 0 {
            return None;
        }
        return Some((size.saturating_sub(suffix_len), size.saturating_sub(1)));
    }

    let start: u64 = start_str.parse().ok()?;
    if start >= size {
        // Unsatisfiable; `stream_file` answers 416.
        return Some((start, start));
    }
    let end = if end_str.is_empty() {
        size.saturating_sub(1)
    } else {
        end_str.parse().ok()?
    };
    if end < start {
        return None;
    }
    Some((start, end))
}
