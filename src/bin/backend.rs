#![forbid(unsafe_code)]

//! HTTP surface of the cache: watch pages, status polling, and media serving.
//!
//! Requests never talk to the video platform directly. The orchestrator
//! decides whether an identifier is servable from disk; anything else is
//! delegated to the in-process job runner while clients poll the status
//! endpoint. All ledger and filesystem work happens on the blocking pool so
//! the request path stays async-clean.

use std::{
    collections::HashSet,
    fs,
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Body,
    extract::{Path as AxumPath, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::get,
};
use mime_guess::{MimeGuess, mime::Mime};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
    signal, task,
};
use tokio_util::io::ReaderStream;
use tracing_subscriber::EnvFilter;
use ytcache_tools::{
    config::load_runtime_config,
    error::CacheError,
    identity::{self, VideoId},
    ledger::{JobLedger, SqliteLedger},
    orchestrator::{CacheState, Orchestrator, Readiness},
    queue::TokioJobQueue,
    retrieval,
    security::ensure_not_root,
    store::{ArtifactKind, MediaStore},
    thumbs,
};

/// Finalized artifacts never change, so browsers and CDNs may cache forever.
const CACHE_CONTROL_IMMUTABLE: &str = "public, max-age=31536000, immutable";

/// Minimal player page. Polls the status endpoint until the artifacts are
/// ready, then drives the separate audio element in lockstep with the video
/// element (the streams are cached unmuxed).
const WATCH_PAGE_TEMPLATE: &str = r#"<!doctype html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>__VIDEO_ID__</title>
<style>
  body { margin: 0; background: #111; color: #eee; font-family: sans-serif; }
  main { max-width: 960px; margin: 2rem auto; padding: 0 1rem; }
  video { width: 100%; background: #000; }
  #message { padding: 2rem 0; text-align: center; }
</style>
</head>
<body>
<main>
  <div id="message">Preparing media&hellip; this page checks again every few seconds.</div>
  <video id="player" controls poster="__BASE_URL__/media/__VIDEO_ID__/thumbnail" hidden></video>
  <audio id="soundtrack" hidden></audio>
</main>
<script>
const STATUS_URL = "__BASE_URL__/v1/yt/status?video_id=__VIDEO_ID__";
const PLAY_URL = "__BASE_URL__/v1/yt/play?video_id=__VIDEO_ID__";
const POLL_INTERVAL_MS = 5000;
const player = document.getElementById("player");
const soundtrack = document.getElementById("soundtrack");
const message = document.getElementById("message");

function attach(data) {
  player.src = data.video_url;
  soundtrack.src = data.audio_url;
  player.hidden = false;
  message.hidden = true;
  player.addEventListener("play", () => {
    soundtrack.currentTime = player.currentTime;
    soundtrack.play();
  });
  player.addEventListener("pause", () => soundtrack.pause());
  player.addEventListener("seeked", () => {
    soundtrack.currentTime = player.currentTime;
  });
  player.addEventListener("ratechange", () => {
    soundtrack.playbackRate = player.playbackRate;
  });
}

async function poll() {
  try {
    const res = await fetch(STATUS_URL, { headers: { "Accept": "application/json" } });
    const data = await res.json();
    if (data.ready) {
      attach(data);
      return;
    }
    if (data.state === "failed" || data.state === "unknown") {
      message.textContent = "Requesting a fresh caching attempt…";
      await fetch(PLAY_URL, { headers: { "Accept": "application/json" } });
    }
  } catch (err) {
    console.warn("status poll failed", err);
  }
  setTimeout(poll, POLL_INTERVAL_MS);
}

poll();
</script>
</body>
</html>
"#;

/// Identifiers already observed ready. Artifacts are never deleted, so a
/// positive answer stays valid for the process lifetime and saves the
/// filesystem round-trip on every subsequent poll.
struct ReadyMemo {
    ids: RwLock<HashSet<String>>,
}

impl ReadyMemo {
    fn new() -> Self {
        Self {
            ids: RwLock::new(HashSet::new()),
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.ids.read().contains(id)
    }

    fn insert(&self, id: &str) {
        self.ids.write().insert(id.to_owned());
    }
}

#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
    store: MediaStore,
    ready_memo: Arc<ReadyMemo>,
    public_base_url: Arc<String>,
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

    fn unavailable(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
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

impl From<CacheError> for ApiError {
    fn from(err: CacheError) -> Self {
        match &err {
            CacheError::InvalidIdentifier(_) => Self::bad_request(err.to_string()),
            CacheError::StoreUnavailable(_) => Self::unavailable(err.to_string()),
            CacheError::RetrievalFailed { .. } | CacheError::ArtifactCorrupt(_) => {
                Self::internal(err.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, headers, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    ensure_not_root("backend")?;

    let config = load_runtime_config()?;
    fs::create_dir_all(&config.media_root)
        .with_context(|| format!("creating media root {}", config.media_root.display()))?;

    if let Err(err) = retrieval::ensure_downloader_available() {
        tracing::warn!(error = %err, "downloader unavailable; only already-cached media will be served");
    }

    let ledger: Arc<dyn JobLedger> =
        Arc::new(SqliteLedger::open(&config.state_db, config.stale_after)?);
    let store = MediaStore::new(&config.media_root);
    let queue = Arc::new(TokioJobQueue::new(store.clone(), ledger.clone()));
    let orchestrator = Arc::new(Orchestrator::new(store.clone(), ledger, queue));

    let state = AppState {
        orchestrator,
        store,
        ready_memo: Arc::new(ReadyMemo::new()),
        public_base_url: Arc::new(config.public_base_url.clone()),
    };

    let app = router(state);

    let host: IpAddr = config
        .host
        .parse()
        .with_context(|| format!("parsing listen host {:?}", config.host))?;
    let addr = SocketAddr::new(host, config.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    tracing::info!(%addr, media_root = %config.media_root.display(), "cache API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/watch", get(watch_query))
        .route("/watch/{video_id}", get(watch_path))
        .route("/v1/yt/play", get(play))
        .route("/v1/yt/status", get(status))
        .route("/media/{video_id}/{kind}", get(media))
        .route("/oembed", get(oembed_route))
        .route("/{video_id}", get(watch_by_root_id))
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to install Ctrl+C handler");
    }
}

/// Query parameters shared by the watch/play/status/oembed routes.
#[derive(Debug, Default, Deserialize)]
struct WatchParams {
    v: Option<String>,
    video_id: Option<String>,
    url: Option<String>,
    format: Option<String>,
}

/// Resolves the identifier from a path segment or query parameters, in that
/// priority order. Validation happens before anything else touches the
/// request.
fn resolve_input(path_id: Option<&str>, params: &WatchParams) -> Result<VideoId, CacheError> {
    let raw = path_id
        .or(params.v.as_deref())
        .or(params.video_id.as_deref())
        .or(params.url.as_deref());

    match raw {
        Some(input) => identity::resolve(input),
        None => Err(CacheError::InvalidIdentifier(String::new())),
    }
}

fn accepts_html(headers: &HeaderMap) -> bool {
    header_value(headers, header::ACCEPT)
        .map(|accept| accept.to_ascii_lowercase().contains("text/html"))
        .unwrap_or(false)
}

fn accepts_oembed(headers: &HeaderMap) -> bool {
    header_value(headers, header::ACCEPT)
        .map(|accept| {
            let accept = accept.to_ascii_lowercase();
            accept.contains("application/json+oembed")
                || (accept.contains("application/json") && accept.contains("oembed"))
        })
        .unwrap_or(false)
}

fn header_value(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_owned())
}

/// Stable JSON answer for the polling contract.
#[derive(Debug, Serialize)]
struct StatusPayload {
    ok: bool,
    ready: bool,
    video_id: String,
    state: CacheState,
    #[serde(skip_serializing_if = "Option::is_none")]
    video_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    audio_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thumbnail_url: Option<String>,
    watch_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    job_id: Option<String>,
}

fn status_payload(base: &str, readiness: &Readiness) -> StatusPayload {
    let vid = &readiness.video_id;
    let media_url = |kind: ArtifactKind| format!("{base}/media/{vid}/{}", kind.slug());
    let watch_url = format!("{base}/watch/{vid}");

    if readiness.ready {
        StatusPayload {
            ok: true,
            ready: true,
            video_id: vid.clone(),
            state: readiness.state,
            video_url: Some(media_url(ArtifactKind::Video)),
            audio_url: Some(media_url(ArtifactKind::Audio)),
            thumbnail_url: Some(media_url(ArtifactKind::Thumbnail)),
            watch_url,
            job_id: None,
        }
    } else {
        StatusPayload {
            ok: true,
            ready: false,
            video_id: vid.clone(),
            state: readiness.state,
            video_url: None,
            audio_url: None,
            thumbnail_url: None,
            watch_url,
            job_id: readiness.job_ref.clone(),
        }
    }
}

fn render_watch_page(base: &str, video_id: &str) -> String {
    WATCH_PAGE_TEMPLATE
        .replace("__BASE_URL__", base)
        .replace("__VIDEO_ID__", video_id)
}

impl AppState {
    /// Readiness plus single-flight scheduling, off the async path.
    async fn ensure_cached(&self, id: &VideoId) -> ApiResult<Readiness> {
        if self.ready_memo.contains(id.as_str()) {
            return Ok(Readiness::ready(id));
        }

        let orchestrator = self.orchestrator.clone();
        let vid = id.clone();
        let readiness = task::spawn_blocking(move || orchestrator.ensure_cached(&vid))
            .await
            .map_err(|err| ApiError::internal(format!("task join error: {err}")))?
            .map_err(ApiError::from)?;

        if readiness.ready {
            self.ready_memo.insert(id.as_str());
        }
        Ok(readiness)
    }

    /// Read-only status; never schedules work.
    async fn check_status(&self, id: &VideoId) -> ApiResult<Readiness> {
        if self.ready_memo.contains(id.as_str()) {
            return Ok(Readiness::ready(id));
        }

        let orchestrator = self.orchestrator.clone();
        let vid = id.clone();
        let readiness = task::spawn_blocking(move || orchestrator.check_status(&vid))
            .await
            .map_err(|err| ApiError::internal(format!("task join error: {err}")))?
            .map_err(ApiError::from)?;

        if readiness.ready {
            self.ready_memo.insert(id.as_str());
        }
        Ok(readiness)
    }

    /// HTML page or JSON payload depending on the Accept header. Both ensure
    /// a caching job is active when the media is missing.
    async fn watch_response(&self, id: &VideoId, headers: &HeaderMap) -> ApiResult<Response> {
        let readiness = self.ensure_cached(id).await?;

        if accepts_html(headers) {
            let page = render_watch_page(&self.public_base_url, id.as_str());
            Ok(Html(page).into_response())
        } else {
            Ok(Json(status_payload(&self.public_base_url, &readiness)).into_response())
        }
    }

    fn oembed_payload(&self, id: &VideoId) -> serde_json::Value {
        let base = self.public_base_url.as_str();
        let watch = format!("{base}/watch/{id}");
        serde_json::json!({
            "version": "1.0",
            "type": "video",
            "provider_name": "ytcache",
            "provider_url": base,
            "title": format!("ytcache {id}"),
            "author_name": "ytcache",
            "html": format!(
                "<iframe src=\"{watch}\" width=\"560\" height=\"315\" frameborder=\"0\" allowfullscreen></iframe>"
            ),
            "width": 560,
            "height": 315,
            "thumbnail_url": format!("{base}/media/{id}/thumbnail"),
        })
    }
}

async fn watch_by_root_id(
    State(state): State<AppState>,
    AxumPath(video_id): AxumPath<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let id = resolve_input(Some(&video_id), &WatchParams::default())?;
    state.watch_response(&id, &headers).await
}

async fn watch_path(
    State(state): State<AppState>,
    AxumPath(video_id): AxumPath<String>,
    headers: HeaderMap,
    Query(params): Query<WatchParams>,
) -> ApiResult<Response> {
    let id = resolve_input(Some(&video_id), &params)?;
    state.watch_response(&id, &headers).await
}

async fn watch_query(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<WatchParams>,
) -> ApiResult<Response> {
    let id = resolve_input(None, &params)?;
    state.watch_response(&id, &headers).await
}

/// Content-negotiated entry point: HTML player page, oEmbed document, or the
/// JSON status payload. `?format=` overrides the Accept header.
async fn play(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<WatchParams>,
) -> ApiResult<Response> {
    let id = resolve_input(None, &params)?;

    let format = params
        .format
        .as_deref()
        .map(|value| value.trim().to_ascii_lowercase());

    match format.as_deref() {
        Some("html") => {
            state.ensure_cached(&id).await?;
            let page = render_watch_page(&state.public_base_url, id.as_str());
            return Ok(Html(page).into_response());
        }
        Some("oembed") => {
            state.ensure_cached(&id).await?;
            return Ok(Json(state.oembed_payload(&id)).into_response());
        }
        Some("json") => {
            let readiness = state.ensure_cached(&id).await?;
            return Ok(Json(status_payload(&state.public_base_url, &readiness)).into_response());
        }
        _ => {}
    }

    if accepts_html(&headers) {
        return state.watch_response(&id, &headers).await;
    }
    if accepts_oembed(&headers) {
        state.ensure_cached(&id).await?;
        return Ok(Json(state.oembed_payload(&id)).into_response());
    }

    let readiness = state.ensure_cached(&id).await?;
    Ok(Json(status_payload(&state.public_base_url, &readiness)).into_response())
}

/// Pure status poll; tells "still working" from "failed" from "never asked".
async fn status(
    State(state): State<AppState>,
    Query(params): Query<WatchParams>,
) -> ApiResult<Json<StatusPayload>> {
    let id = resolve_input(None, &params)?;
    let readiness = state.check_status(&id).await?;
    Ok(Json(status_payload(&state.public_base_url, &readiness)))
}

/// oEmbed document; ensures caching is underway as a side effect.
async fn oembed_route(
    State(state): State<AppState>,
    Query(params): Query<WatchParams>,
) -> ApiResult<Json<serde_json::Value>> {
    let id = resolve_input(None, &params)?;
    state.ensure_cached(&id).await?;
    Ok(Json(state.oembed_payload(&id)))
}

/// Streams a finalized artifact. Missing video/audio schedules caching and
/// 404s; a missing thumbnail falls back to the remote image host.
async fn media(
    State(state): State<AppState>,
    AxumPath((video_id, kind)): AxumPath<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let kind =
        ArtifactKind::parse(&kind).ok_or_else(|| ApiError::not_found("unknown media kind"))?;
    let id = identity::resolve(&video_id).map_err(ApiError::from)?;

    if let Some(path) = state.store.find_artifact(&id, kind) {
        return stream_file(path, None, Some(&headers), true).await;
    }

    match kind {
        ArtifactKind::Thumbnail => {
            let store = state.store.clone();
            let vid = id.clone();
            let fetched =
                task::spawn_blocking(move || thumbs::fetch_remote_thumbnail(&store, &vid))
                    .await
                    .map_err(|err| ApiError::internal(format!("task join error: {err}")))?
                    .map_err(|err| ApiError::internal(err.to_string()))?;

            match fetched {
                Some(path) => stream_file(path, None, Some(&headers), true).await,
                None => Err(ApiError::not_found("thumbnail not available")),
            }
        }
        ArtifactKind::Video | ArtifactKind::Audio => {
            state.ensure_cached(&id).await?;
            Err(ApiError::not_found("media not cached yet"))
        }
    }
}

/// Byte-range-aware file streaming with immutable cache hints for media.
async fn stream_file(
    path: PathBuf,
    mime: Option<Mime>,
    headers: Option<&HeaderMap>,
    immutable: bool,
) -> ApiResult<Response> {
    let mut file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let metadata = file
        .metadata()
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let size = metadata.len();

    let guessed = mime.or_else(|| MimeGuess::from_path(&path).first());
    let range = headers
        .and_then(|headers| headers.get(header::RANGE))
        .and_then(|value| parse_range_header(value, size));

    let mut response = if let Some((start, end)) = range {
        if start >= size {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
            response.headers_mut().insert(
                header::CONTENT_RANGE,
                format!("bytes */{}", size).parse().unwrap(),
            );
            response
        } else {
            let end = end.min(size.saturating_sub(1));
            let length = end - start + 1;
            file.seek(std::io::SeekFrom::Start(start))
                .await
                .map_err(|_| ApiError::not_found("file not found"))?;
            let stream = ReaderStream::new(file.take(length));
            let body = Body::from_stream(stream);
            let mut response = body.into_response();
            *response.status_mut() = StatusCode::PARTIAL_CONTENT;
            response.headers_mut().insert(
                header::CONTENT_RANGE,
                format!("bytes {}-{}/{}", start, end, size).parse().unwrap(),
            );
            response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, length.to_string().parse().unwrap());
            response
        }
    } else {
        let stream = ReaderStream::new(file);
        let body = Body::from_stream(stream);
        body.into_response()
    };

    response
        .headers_mut()
        .insert(header::ACCEPT_RANGES, "bytes".parse().unwrap());
    if immutable {
        response.headers_mut().insert(
            header::CACHE_CONTROL,
            CACHE_CONTROL_IMMUTABLE.parse().unwrap(),
        );
    }
    if let Some(mime) = guessed
        && let Ok(value) = mime.to_string().parse()
    {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }

    Ok(response)
}

fn parse_range_header(value: &header::HeaderValue, size: u64) -> Option<(u64, u64)> {
    let value = value.to_str().ok()?;
    let value = value.trim();
    let mut parts = value.split('=');
    let unit = parts.next()?.trim();
    if unit != "bytes" {
        return None;
    }
    let range = parts.next()?.trim();
    if range.is_empty() {
        return None;
    }
    let (start_str, end_str) = range.split_once('-')?;

    if start_str.is_empty() {
        // Suffix range: "-N" means last N bytes.
        let suffix_len: u64 = end_str.parse().ok()?;
        if suffix_len == 0 {
            return None;
        }
        if suffix_len >= size {
            return Some((0, size.saturating_sub(1)));
        }
        return Some((size - suffix_len, size.saturating_sub(1)));
    }

    let start: u64 = start_str.parse().ok()?;
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
