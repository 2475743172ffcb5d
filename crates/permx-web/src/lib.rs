//! Axum HTTP surface for permit searches and run progress.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{rejection::JsonRejection, Path as AxumPath, State},
    http::{header, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::{stream, Stream};
use permx_core::Jurisdiction;
use permx_sync::{PipelineError, ProgressHandle, SearchPipeline, SearchRequest, XLSX_CONTENT_TYPE};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "permx-web";
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SearchPipeline>,
    pub progress: ProgressHandle,
    pub progress_interval: Duration,
}

impl AppState {
    pub fn new(pipeline: Arc<SearchPipeline>) -> Self {
        Self {
            pipeline,
            progress: ProgressHandle::new(),
            progress_interval: PROGRESS_INTERVAL,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    message: String,
}

/// Pipeline errors rendered as `{success: false, message}`.
#[derive(Debug)]
pub struct ApiError(PipelineError);

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            PipelineError::Input(_) => StatusCode::BAD_REQUEST,
            PipelineError::NoMatches(_) => StatusCode::NOT_FOUND,
            PipelineError::ProviderUnavailable(_) => StatusCode::BAD_GATEWAY,
            PipelineError::NoSnapshot(_) => StatusCode::SERVICE_UNAVAILABLE,
            PipelineError::Export(_) | PipelineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %self.0, "request failed");
        }
        let body = ErrorBody {
            success: false,
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JurisdictionRow {
    pub jurisdiction: Jurisdiction,
    pub name: &'static str,
    pub source: &'static str,
    pub detail_mode: permx_adapters::DetailMode,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshBody {
    success: bool,
    path: String,
    records: usize,
    sha256: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/search", post(search_handler))
        .route("/progress", get(progress_handler))
        .route("/jurisdictions", get(jurisdictions_handler))
        .route("/snapshots/{city}/refresh", post(refresh_handler))
        .route("/health", get(health_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "permx web listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let pipeline = Arc::new(SearchPipeline::from_env().await?);
    let port = pipeline.config().web_port;
    let scheduler = pipeline.maybe_build_refresh_scheduler().await?;
    if let Some(sched) = &scheduler {
        sched.start().await?;
        info!(cron = %pipeline.config().refresh_cron, "snapshot refresh scheduler started");
    }
    serve(AppState::new(pipeline), port).await
}

async fn search_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<SearchRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload.map_err(|e| PipelineError::Input(format!("invalid request body: {}", e.body_text())))?;
    let workbook = state.pipeline.search(&request, &state.progress).await?;
    info!(
        file = %workbook.file_name,
        permits = workbook.permits,
        failed = workbook.failed,
        bytes = workbook.bytes.len(),
        "workbook ready"
    );

    let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", workbook.file_name))
        .map_err(|e| PipelineError::Internal(e.into()))?;
    let mut resp = workbook.bytes.into_response();
    let headers = resp.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(XLSX_CONTENT_TYPE));
    headers.insert(header::CONTENT_DISPOSITION, disposition);
    Ok(resp)
}

/// One `progress` event per tick; the stream closes after a terminal status.
fn progress_events(
    progress: ProgressHandle,
    interval: Duration,
) -> impl Stream<Item = Result<Event, axum::Error>> {
    stream::unfold((Some(progress), true), move |(handle, first)| async move {
        let Some(handle) = handle else {
            return None;
        };
        if !first {
            tokio::time::sleep(interval).await;
        }
        let snapshot = handle.snapshot();
        let event = Event::default().event("progress").json_data(&snapshot);
        let next = if snapshot.status.is_terminal() { None } else { Some(handle) };
        Some((event, (next, false)))
    })
}

async fn progress_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    Sse::new(progress_events(state.progress.clone(), state.progress_interval)).keep_alive(KeepAlive::default())
}

async fn jurisdictions_handler(State(state): State<Arc<AppState>>) -> Json<Vec<JurisdictionRow>> {
    let rows = state
        .pipeline
        .registry()
        .jurisdictions
        .iter()
        .map(|c| JurisdictionRow {
            jurisdiction: c.jurisdiction,
            name: c.jurisdiction.display_name(),
            source: c.source.kind(),
            detail_mode: c.detail_mode(),
        })
        .collect();
    Json(rows)
}

async fn refresh_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(city): AxumPath<String>,
) -> Result<Json<RefreshBody>, ApiError> {
    let jurisdiction =
        Jurisdiction::parse(&city).ok_or_else(|| PipelineError::Input(format!("unsupported city `{city}`")))?;
    let stored = state.pipeline.refresh_snapshot(jurisdiction).await?;
    Ok(Json(RefreshBody {
        success: true,
        path: stored.path.display().to_string(),
        records: stored.record_count,
        sha256: stored.content_hash,
    }))
}

async fn health_handler() -> &'static str {
    "ok"
}
