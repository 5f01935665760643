//! HTTP surface for environments, scoped reads and on-demand sync.
//!
//! Every handler that touches SQLite runs its work on the blocking pool.
//!
//! ```text
//! POST   /environments/:name        create   (201, 409, 400)
//! GET    /environments/:name        get      (200, 404)
//! GET    /environments              list live environments
//! DELETE /environments/:name        delete   (204, 410)
//! GET    /mirror/:kind?env=<name>   rows from production or an environment
//! POST   /sync?env=<name>           sync-all into that store (200, 502)
//! GET    /sync/progress             live progress entries and stats
//! GET    /health
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::env::{ContextResolver, DeleteOutcome, EnvironmentRecord, Scope, SeedMode};
use crate::error::{EnvError, ResolveError, StoreError};
use crate::sync::{DocumentApi, EntityKind, SyncOrchestrator, SyncReport};

const DEFAULT_ROW_LIMIT: usize = 100;
const MAX_ROW_LIMIT: usize = 1000;

/// Shared server state
pub struct AppState<A> {
    pub resolver: Arc<ContextResolver>,
    pub orchestrator: Arc<SyncOrchestrator<A>>,
    pub default_ttl_secs: i64,
    pub started_at: Instant,
}

impl<A> AppState<A> {
    pub fn new(
        resolver: Arc<ContextResolver>,
        orchestrator: Arc<SyncOrchestrator<A>>,
        default_ttl_secs: i64,
    ) -> Self {
        Self {
            resolver,
            orchestrator,
            default_ttl_secs,
            started_at: Instant::now(),
        }
    }
}

/// API response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    pub data: T,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data,
        })
    }
}

/// Error response with a stable machine-readable kind
#[derive(Debug)]
pub struct HttpError {
    status: StatusCode,
    kind: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    success: bool,
    error: ErrorDetail<'a>,
}

#[derive(Serialize)]
struct ErrorDetail<'a> {
    kind: &'a str,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<&'a serde_json::Value>,
}

impl HttpError {
    pub fn new(status: StatusCode, kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: message.into(),
            details: None,
        }
    }

    fn invalid(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request", message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!(kind = self.kind, message = %self.message, "request failed");
        }
        let body = ErrorBody {
            success: false,
            error: ErrorDetail {
                kind: self.kind,
                message: &self.message,
                details: self.details.as_ref(),
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<StoreError> for HttpError {
    fn from(err: StoreError) -> Self {
        if err.is_retryable() {
            Self::new(StatusCode::SERVICE_UNAVAILABLE, "busy", err.to_string())
        } else {
            Self::internal(err.to_string())
        }
    }
}

impl From<EnvError> for HttpError {
    fn from(err: EnvError) -> Self {
        let status = match err {
            EnvError::Store(e) => return Self::from(e),
            EnvError::Conflict(_) => StatusCode::CONFLICT,
            EnvError::NotFound(_) | EnvError::Expired(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::BAD_REQUEST,
        };
        Self::new(status, err.kind(), err.to_string())
    }
}

impl From<ResolveError> for HttpError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::UnknownEnvironment(_) => {
                Self::new(StatusCode::NOT_FOUND, "unknown_environment", err.to_string())
            }
            ResolveError::Store(e) => Self::from(e),
        }
    }
}

/// Run blocking store work on the blocking pool
async fn blocking<T, E, F>(job: F) -> Result<T, HttpError>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Into<HttpError> + Send + 'static,
{
    tokio::task::spawn_blocking(job)
        .await
        .map_err(|e| HttpError::internal(e.to_string()))?
        .map_err(Into::into)
}

/// Create the API router
pub fn create_router<A>(state: Arc<AppState<A>>) -> Router
where
    A: DocumentApi + 'static,
{
    Router::new()
        .route("/health", get(health_handler::<A>))
        .route("/environments", get(list_environments_handler::<A>))
        .route(
            "/environments/:name",
            post(create_environment_handler::<A>)
                .get(get_environment_handler::<A>)
                .delete(delete_environment_handler::<A>),
        )
        .route("/mirror/:kind", get(mirror_rows_handler::<A>))
        .route("/sync", post(sync_handler::<A>))
        .route("/sync/progress", get(progress_handler::<A>))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_seconds: u64,
    environments: usize,
}

async fn health_handler<A: DocumentApi + 'static>(
    State(state): State<Arc<AppState<A>>>,
) -> Result<impl IntoResponse, HttpError> {
    let registry = state.resolver.registry().clone();
    let environments = blocking(move || registry.list().map(|l| l.len())).await?;
    Ok(ApiResponse::ok(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        environments,
    }))
}

/// Body of `POST /environments/:name`; every field optional
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CreateEnvironment {
    pub seed_mode: SeedMode,
    pub ttl_seconds: Option<i64>,
}

#[derive(Debug, Serialize)]
struct EnvironmentView {
    #[serde(flatten)]
    record: EnvironmentRecord,
    expires_at: chrono::DateTime<chrono::Utc>,
}

impl From<EnvironmentRecord> for EnvironmentView {
    fn from(record: EnvironmentRecord) -> Self {
        Self {
            expires_at: record.expires_at(),
            record,
        }
    }
}

async fn create_environment_handler<A: DocumentApi + 'static>(
    State(state): State<Arc<AppState<A>>>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, HttpError> {
    let request: CreateEnvironment = if body.iter().all(u8::is_ascii_whitespace) {
        CreateEnvironment::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| HttpError::invalid(e.to_string()))?
    };
    let ttl = request.ttl_seconds.unwrap_or(state.default_ttl_secs);

    let registry = state.resolver.registry().clone();
    let record = blocking(move || registry.create(&name, request.seed_mode, ttl)).await?;
    Ok((StatusCode::CREATED, ApiResponse::ok(EnvironmentView::from(record))))
}

async fn get_environment_handler<A: DocumentApi + 'static>(
    State(state): State<Arc<AppState<A>>>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, HttpError> {
    let registry = state.resolver.registry().clone();
    let record = blocking(move || registry.get(&name)).await?;
    Ok(ApiResponse::ok(EnvironmentView::from(record)))
}

async fn list_environments_handler<A: DocumentApi + 'static>(
    State(state): State<Arc<AppState<A>>>,
) -> Result<impl IntoResponse, HttpError> {
    let registry = state.resolver.registry().clone();
    let records = blocking(move || registry.list()).await?;
    let views: Vec<EnvironmentView> = records.into_iter().map(Into::into).collect();
    Ok(ApiResponse::ok(views))
}

async fn delete_environment_handler<A: DocumentApi + 'static>(
    State(state): State<Arc<AppState<A>>>,
    Path(name): Path<String>,
) -> Result<StatusCode, HttpError> {
    let registry = state.resolver.registry().clone();
    let target = name.clone();
    match blocking(move || registry.delete(&target)).await? {
        DeleteOutcome::Deleted => Ok(StatusCode::NO_CONTENT),
        DeleteOutcome::AlreadyGone => Err(HttpError::new(
            StatusCode::GONE,
            "gone",
            format!("Environment already gone: {name}"),
        )),
    }
}

/// Query parameters for scoped operations
#[derive(Debug, Default, Deserialize)]
pub struct ScopeQuery {
    pub env: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct MirrorRows {
    scope: Scope,
    kind: EntityKind,
    count: usize,
    rows: Vec<serde_json::Value>,
}

async fn mirror_rows_handler<A: DocumentApi + 'static>(
    State(state): State<Arc<AppState<A>>>,
    Path(kind): Path<String>,
    Query(query): Query<ScopeQuery>,
) -> Result<impl IntoResponse, HttpError> {
    let kind: EntityKind = kind.parse().map_err(HttpError::invalid)?;
    let limit = query.limit.unwrap_or(DEFAULT_ROW_LIMIT).clamp(1, MAX_ROW_LIMIT);

    let resolver = state.resolver.clone();
    let rows = blocking(move || -> Result<MirrorRows, HttpError> {
        let scoped = resolver.resolve(query.env.as_deref())?;
        let count = scoped.store.count(kind)?;
        let rows = scoped.store.list_rows(kind, limit)?;
        Ok(MirrorRows {
            scope: scoped.scope,
            kind,
            count,
            rows,
        })
    })
    .await?;
    Ok(ApiResponse::ok(rows))
}

#[derive(Debug, Serialize)]
struct SyncResponse {
    scope: Scope,
    written: usize,
    failed: usize,
    report: SyncReport,
}

async fn sync_handler<A: DocumentApi + 'static>(
    State(state): State<Arc<AppState<A>>>,
    Query(query): Query<ScopeQuery>,
) -> Result<impl IntoResponse, HttpError> {
    let resolver = state.resolver.clone();
    let env = query.env.clone();
    let scoped = blocking(move || resolver.resolve(env.as_deref())).await?;

    info!(scope = ?scoped.scope, "on-demand sync requested");
    let report = state.orchestrator.sync_all(&scoped.store).await;
    let response = SyncResponse {
        scope: scoped.scope,
        written: report.written(),
        failed: report.failed(),
        report,
    };

    if response.failed > 0 {
        let mut err = HttpError::new(
            StatusCode::BAD_GATEWAY,
            "sync_failed",
            format!("{} of {} passes failed", response.failed, response.report.passes.len()),
        );
        err.details = serde_json::to_value(&response).ok();
        return Err(err);
    }
    Ok(ApiResponse::ok(response))
}

#[derive(Debug, Serialize)]
struct ProgressResponse {
    runs: Vec<crate::sync::SyncProgress>,
    stats: crate::sync::SyncStats,
}

async fn progress_handler<A: DocumentApi + 'static>(
    State(state): State<Arc<AppState<A>>>,
) -> impl IntoResponse {
    ApiResponse::ok(ProgressResponse {
        runs: state.orchestrator.progress().snapshot(),
        stats: state.orchestrator.stats(),
    })
}

/// Serve until `shutdown` resolves
pub async fn serve<A, F>(
    addr: SocketAddr,
    state: Arc<AppState<A>>,
    shutdown: F,
) -> std::io::Result<()>
where
    A: DocumentApi + 'static,
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("server stopped");
    Ok(())
}

/// Wait for Ctrl-C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received terminate signal, shutting down"),
    }
}
