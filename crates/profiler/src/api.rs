//! HTTP API: discovery listings, artifact listing, pprof sessions and the
//! reverse proxy onto their web UI

use axum::{
    extract::{Path, Query, RawQuery, State},
    http::{header, StatusCode},
    response::{IntoResponse, Redirect, Response},
    routing::get,
    Json, Router,
};
use profiler_lib::{
    artifacts::{list_artifacts, resolve_artifact, Artifact, ARTIFACT_SUFFIX},
    discovery::{HostRegistry, RegistryError},
    session::{SessionError, SessionInfo, SessionManager},
    ProfileKind, ProfileSource, DIAGNOSTIC_PATH,
};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Session lifetime when the request does not set one
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Sampling duration for live sources when the request does not set one
pub const DEFAULT_SAMPLE_SECONDS: u32 = 5;

const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(100);
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(60);
const HTML_CONTENT_TYPE: &str = "text/html; charset=utf-8";

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<HostRegistry>,
    pub sessions: Arc<SessionManager>,
    pub dest_root: PathBuf,
    client: reqwest::Client,
}

impl AppState {
    pub fn new(
        registry: Arc<HostRegistry>,
        sessions: Arc<SessionManager>,
        dest_root: PathBuf,
    ) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(UPSTREAM_TIMEOUT)
            .build()?;
        Ok(Self {
            registry,
            sessions,
            dest_root,
            client,
        })
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("{0}")]
    BadRequest(String),

    #[error("session on port {0} did not become ready")]
    SessionNotReady(u16),

    #[error("session on port {0} exited before serving")]
    SessionExited(u16),

    #[error("no active session on port {0}")]
    UnknownSession(u16),

    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("failed to list artifacts: {0}")]
    Artifacts(#[from] std::io::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Registry(_) | ApiError::Upstream(_) | ApiError::SessionExited(_) => {
                StatusCode::BAD_GATEWAY
            }
            ApiError::Session(SessionError::PortsExhausted) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Session(_) | ApiError::Artifacts(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::SessionNotReady(_) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::UnknownSession(_) => StatusCode::NOT_FOUND,
        };
        if status.is_server_error() {
            warn!(status = %status, error = %self, "Request failed");
        }
        (status, self.to_string()).into_response()
    }
}

/// Host as returned by the hosts listing
#[derive(Debug, Serialize, Deserialize)]
pub struct HostView {
    pub name: String,
    pub address: String,
    pub age_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct SessionParams {
    /// Session lifetime in seconds
    pub timeout: Option<u64>,
    /// Sampling duration for live sources
    pub seconds: Option<u32>,
}

async fn healthz() -> &'static str {
    "ok"
}

/// Prometheus metrics endpoint
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

async fn namespaces(State(state): State<Arc<AppState>>) -> Result<Json<Vec<String>>, ApiError> {
    Ok(Json(state.registry.list_namespaces().await?))
}

async fn hosts(
    State(state): State<Arc<AppState>>,
    Path(namespace): Path<String>,
) -> Result<Json<Vec<HostView>>, ApiError> {
    let hosts = state.registry.list_hosts(&namespace).await?;
    Ok(Json(
        hosts
            .into_iter()
            .map(|host| HostView {
                name: host.name,
                address: host.address,
                age_secs: host.age.as_secs(),
            })
            .collect(),
    ))
}

async fn files(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Artifact>>, ApiError> {
    Ok(Json(list_artifacts(&state.dest_root).await?))
}

async fn sessions(State(state): State<Arc<AppState>>) -> Json<Vec<SessionInfo>> {
    Json(state.sessions.active_sessions())
}

/// Forward the instance's diagnostic index page
async fn proxy_index(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
) -> Result<Response, ApiError> {
    let url = format!("http://{address}{DIAGNOSTIC_PATH}/");
    forward(&state.client, &url).await
}

/// Start a session for a live endpoint or a persisted artifact, wait until
/// its web UI accepts connections and redirect to it
async fn open_session(
    State(state): State<Arc<AppState>>,
    Path((source, kind)): Path<(String, String)>,
    Query(params): Query<SessionParams>,
) -> Result<Redirect, ApiError> {
    let kind = ProfileKind::parse(&kind)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown profile kind '{kind}'")))?;

    let source = if source.ends_with(ARTIFACT_SUFFIX) {
        let path = resolve_artifact(&state.dest_root, kind, &source)
            .ok_or_else(|| ApiError::BadRequest(format!("invalid artifact name '{source}'")))?;
        ProfileSource::Artifact(path)
    } else {
        ProfileSource::live(
            source,
            kind,
            params.seconds.unwrap_or(DEFAULT_SAMPLE_SECONDS),
        )
    };

    let timeout = params
        .timeout
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_SESSION_TIMEOUT);
    let port = state.sessions.proxy(timeout, &source)?;

    wait_until_ready(&state, port, timeout).await?;
    info!(port, source = %source, "Session ready");
    Ok(Redirect::to(&format!("/ports/{port}/")))
}

/// Poll the session port, retrying connection failures until `timeout` or
/// until the session's subprocess is gone
async fn wait_until_ready(state: &AppState, port: u16, timeout: Duration) -> Result<(), ApiError> {
    let url = format!("http://localhost:{port}");
    let deadline = Instant::now().checked_add(timeout);
    loop {
        match state.client.get(&url).send().await {
            Ok(_) => return Ok(()),
            Err(e) if e.is_connect() => {
                if !state.sessions.is_active(port) {
                    return Err(ApiError::SessionExited(port));
                }
                if deadline.is_some_and(|d| Instant::now() + READINESS_POLL_INTERVAL > d) {
                    return Err(ApiError::SessionNotReady(port));
                }
                debug!(port, "Session not accepting connections yet");
                tokio::time::sleep(READINESS_POLL_INTERVAL).await;
            }
            Err(e) => return Err(ApiError::Upstream(e)),
        }
    }
}

async fn ui_root(
    State(state): State<Arc<AppState>>,
    Path(port): Path<u16>,
    RawQuery(query): RawQuery,
) -> Result<Response, ApiError> {
    forward_ui(&state, port, "", query).await
}

async fn ui_path(
    State(state): State<Arc<AppState>>,
    Path((port, path)): Path<(u16, String)>,
    RawQuery(query): RawQuery,
) -> Result<Response, ApiError> {
    forward_ui(&state, port, &path, query).await
}

/// Reverse proxy onto a session's `/ui/` tree; only ports held by an
/// active session are reachable
async fn forward_ui(
    state: &AppState,
    port: u16,
    path: &str,
    query: Option<String>,
) -> Result<Response, ApiError> {
    if !state.sessions.is_active(port) {
        return Err(ApiError::UnknownSession(port));
    }
    let mut url = format!("http://localhost:{port}/ui/{}", path.trim_start_matches('/'));
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(&query);
    }
    forward(&state.client, &url).await
}

/// GET `url` and relay status, content type and body
async fn forward(client: &reqwest::Client, url: &str) -> Result<Response, ApiError> {
    let upstream = client.get(url).send().await?;
    let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = upstream
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or(HTML_CONTENT_TYPE)
        .to_string();
    let body = upstream.bytes().await?;

    Ok((status, [(header::CONTENT_TYPE, content_type)], body).into_response())
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/api/namespaces", get(namespaces))
        .route("/api/namespaces/:namespace/hosts", get(hosts))
        .route("/api/files", get(files))
        .route("/api/sessions", get(sessions))
        .route("/proxy/:source", get(proxy_index))
        .route("/proxy/:source/", get(proxy_index))
        .route("/proxy/:source/:kind", get(open_session))
        .route("/ports/:port/", get(ui_root))
        .route("/ports/:port/*path", get(ui_path))
        .with_state(state)
}

/// Start the API server, stopping when `shutdown` resolves
pub async fn serve(
    port: u16,
    state: Arc<AppState>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
