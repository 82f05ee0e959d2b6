use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::job::{
    open_job_store, JobController, JobRegistry, JobView, PollStatus, RunnerSettings,
    StartJobError,
};
use crate::outputs::{self, ReportFile};
use crate::script::{self, ScriptKind, ScriptRequest};

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    controller: JobController,
    config: RwLock<AppConfig>,
    config_path: PathBuf,
    data_dir: PathBuf,
    output_dir: PathBuf,
}

impl AppState {
    /// Opens the job store, restores persisted jobs and wires the controller.
    pub fn new(config: AppConfig, config_path: PathBuf, data_dir: PathBuf) -> Result<Self> {
        let store = open_job_store(&config, &data_dir)?;
        let registry = Arc::new(JobRegistry::restored(store));

        let output_dir = config.output_dir(&data_dir);
        if let Err(err) = std::fs::create_dir_all(&output_dir) {
            warn!(
                error = %err,
                output_dir = %output_dir.display(),
                "Failed to create output directory; scripts will create it on demand"
            );
        }

        let settings = RunnerSettings {
            persist_interval: config.jobs.persist_interval(),
            settle_delay: config.jobs.settle_delay(),
            scripts_dir: config.scripts_dir(&data_dir),
        };

        info!(
            data_dir = %data_dir.display(),
            output_dir = %output_dir.display(),
            jobs = registry.len(),
            "Application state initialized"
        );

        Ok(Self {
            inner: Arc::new(AppStateInner {
                controller: JobController::new(registry, settings),
                config: RwLock::new(config),
                config_path,
                data_dir,
                output_dir,
            }),
        })
    }

    pub fn controller(&self) -> &JobController {
        &self.inner.controller
    }

    pub fn config_path(&self) -> &std::path::Path {
        &self.inner.config_path
    }

    pub fn data_dir(&self) -> &std::path::Path {
        &self.inner.data_dir
    }

    pub fn output_dir(&self) -> &std::path::Path {
        &self.inner.output_dir
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Debug, Serialize)]
pub struct CreateJobResponse {
    pub id: String,
    pub status: PollStatus,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// ─── Router ──────────────────────────────────────────────────────────────────

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/config", get(get_config))
        .route("/api/jobs", post(create_job).get(list_jobs))
        .route("/api/environment", post(check_environment))
        .route("/api/jobs/{id}", get(get_job))
        .route("/job-status/{id}", get(get_job))
        .route("/api/outputs", get(list_outputs))
        .route("/api/outputs/{filename}", get(download_output))
        .route("/api/{*path}", any(api_route_not_found))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn api_route_not_found(Path(path): Path<String>) -> AppError {
    AppError::NotFound(format!("api endpoint not found: /api/{path}"))
}

async fn get_config(State(state): State<AppState>) -> Json<AppConfig> {
    let config = state.inner.config.read().await.clone();
    Json(config)
}

async fn create_job(
    State(state): State<AppState>,
    Json(payload): Json<ScriptRequest>,
) -> Result<(StatusCode, Json<CreateJobResponse>), AppError> {
    start_script(&state, &payload).await
}

/// Starts a job that reports the PowerShell version and installed modules.
async fn check_environment(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<CreateJobResponse>), AppError> {
    start_script(&state, &ScriptRequest::new(ScriptKind::EnvironmentCheck)).await
}

async fn start_script(
    state: &AppState,
    payload: &ScriptRequest,
) -> Result<(StatusCode, Json<CreateJobResponse>), AppError> {
    let invocation = {
        let config = state.inner.config.read().await;
        script::build_invocation(payload, &config.jobs, &state.inner.output_dir)
            .map_err(|err| AppError::BadRequest(err.to_string()))?
    };

    let id = state.inner.controller.start(invocation)?;
    let view = state.inner.controller.status(&id);

    Ok((
        StatusCode::CREATED,
        Json(CreateJobResponse {
            id,
            status: view.status,
            created_at: view.created_at,
        }),
    ))
}

async fn list_jobs(State(state): State<AppState>) -> Json<Vec<JobView>> {
    Json(state.inner.controller.list())
}

/// Always 200: pollers read `status` to tell a finished job from an unknown one.
async fn get_job(State(state): State<AppState>, Path(id): Path<String>) -> Json<JobView> {
    Json(state.inner.controller.status(&id))
}

async fn list_outputs(State(state): State<AppState>) -> Result<Json<Vec<ReportFile>>, AppError> {
    Ok(Json(outputs::list_report_files(&state.inner.output_dir)?))
}

async fn download_output(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Response, AppError> {
    let file_path = outputs::resolve_report_file(&state.inner.output_dir, &filename)
        .map_err(|err| AppError::BadRequest(err.to_string()))?;

    // Only what the listing shows can be downloaded.
    if !outputs::is_report_file(&file_path) || !file_path.is_file() {
        return Err(AppError::NotFound(format!("report not found: {filename}")));
    }

    let bytes = tokio::fs::read(&file_path)
        .await
        .map_err(|e| AppError::Internal(format!("failed to read report: {e}")))?;

    let mime = mime_guess::from_path(&file_path).first_or_octet_stream();
    let disposition = format!(
        "attachment; filename=\"{}\"",
        filename.replace(['"', '\\'], "_")
    );

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, mime.to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse { error: message });
        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{:#}", err))
    }
}

impl From<StartJobError> for AppError {
    fn from(err: StartJobError) -> Self {
        match err {
            StartJobError::InvalidInvocation(msg) => AppError::BadRequest(msg),
            err @ StartJobError::Spawn { .. } => AppError::Internal(err.to_string()),
        }
    }
}

/// Builds state for a data directory, creating it and its config on first use.
pub fn app_state_with_config(
    config: AppConfig,
    config_path: PathBuf,
    data_dir: PathBuf,
) -> Result<AppState> {
    crate::config::initialize_data_dir(&data_dir)?;
    AppState::new(config, config_path, data_dir)
}
