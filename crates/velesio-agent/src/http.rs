use std::collections::BTreeMap;

use axum::{
    Json, Router,
    extract::{
        Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::{HeaderName, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use velesio_process::{InstanceConfig, InstanceInfo, StartedInstance, StatusMap, StopOutcome};

use crate::{
    error::SupervisorError,
    error_payload::ErrorPayload,
    logs::{self, LogTail, TailError},
    middleware as mw, models,
    state::AppState,
};

/// Everything a handler can fail with, rendered as an [`ErrorPayload`].
#[derive(Debug)]
pub enum ApiError {
    Supervisor(SupervisorError),
    BadRequest { code: &'static str, message: String },
    NotFound { code: &'static str, message: String },
    Internal(anyhow::Error),
}

impl From<SupervisorError> for ApiError {
    fn from(err: SupervisorError) -> Self {
        Self::Supervisor(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rej: JsonRejection) -> Self {
        Self::BadRequest {
            code: "invalid_body",
            message: rej.body_text(),
        }
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rej: QueryRejection) -> Self {
        Self::BadRequest {
            code: "invalid_query",
            message: rej.body_text(),
        }
    }
}

pub fn status_for(err: &SupervisorError) -> StatusCode {
    match err {
        SupervisorError::InvalidPort { .. } | SupervisorError::InvalidParams { .. } => {
            StatusCode::BAD_REQUEST
        }
        SupervisorError::ModelNotFound { .. } => StatusCode::NOT_FOUND,
        SupervisorError::PortBusy { .. } | SupervisorError::AlreadyRunning { .. } => {
            StatusCode::CONFLICT
        }
        SupervisorError::SpawnFailed { .. } | SupervisorError::StopFailed { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, payload) = match self {
            Self::Supervisor(err) => (status_for(&err), ErrorPayload::from(&err)),
            Self::BadRequest { code, message } => {
                (StatusCode::BAD_REQUEST, ErrorPayload::new(code, message, None))
            }
            Self::NotFound { code, message } => {
                (StatusCode::NOT_FOUND, ErrorPayload::new(code, message, None))
            }
            Self::Internal(err) => {
                tracing::error!(error = %format!("{err:#}"), "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorPayload::new("internal", format!("{err:#}"), None),
                )
            }
        };
        (status, Json(payload)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Start body as sent by callers. Ports are read as plain integers so an out
/// of range value is reported as `invalid_port`, not as a malformed body.
#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub model: String,
    pub external_port: i64,
    pub host: Option<String>,
    pub ngl: Option<i32>,
    pub template: Option<String>,
    pub custom_params: Option<String>,
}

impl StartRequest {
    fn into_config(self, external_port: u16) -> InstanceConfig {
        let mut config = InstanceConfig::new(self.model, external_port);
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(ngl) = self.ngl {
            config.ngl = ngl;
        }
        if let Some(template) = self.template {
            config.template = template;
        }
        if let Some(custom_params) = self.custom_params {
            config.custom_params = custom_params;
        }
        config
    }
}

#[derive(Debug, Serialize)]
pub struct StartResponse {
    pub status: &'static str,
    #[serde(flatten)]
    pub instance: StartedInstance,
}

async fn start_instance(
    State(state): State<AppState>,
    body: Result<Json<StartRequest>, JsonRejection>,
) -> ApiResult<StartResponse> {
    let Json(req) = body?;
    let external_port = state.supervisor.mapped_external_port(req.external_port)?;
    let config = req.into_config(external_port);
    tracing::info!(
        external_port = config.external_port,
        model = %config.model,
        "start requested"
    );
    let instance = state.supervisor.start(config).await?;
    Ok(Json(StartResponse {
        status: "started",
        instance,
    }))
}

#[derive(Debug, Deserialize)]
pub struct StopRequest {
    pub external_port: i64,
}

#[derive(Debug, Serialize)]
pub struct StopResponse {
    pub status: &'static str,
    pub outcome: StopOutcome,
}

async fn stop_instance(
    State(state): State<AppState>,
    body: Result<Json<StopRequest>, JsonRejection>,
) -> ApiResult<StopResponse> {
    let Json(req) = body?;
    let external_port = state.supervisor.mapped_external_port(req.external_port)?;
    let outcome = state.supervisor.stop(external_port).await?;
    Ok(Json(StopResponse {
        status: "stopped",
        outcome,
    }))
}

async fn list_instances(State(state): State<AppState>) -> Json<BTreeMap<u16, InstanceInfo>> {
    Json(state.supervisor.list().await)
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub cpu: f64,
    pub ram: f64,
    pub gpu: u32,
    pub llm_instances: StatusMap,
    pub sd_running: bool,
}

async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let host = state.telemetry.snapshot().await;
    Json(StatsResponse {
        cpu: host.cpu,
        ram: host.ram,
        gpu: host.gpu,
        llm_instances: state.supervisor.status_map().await,
        sd_running: state.sd.is_running().await,
    })
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub external_port: i64,
    /// Without a cursor the tail is returned as plain text.
    pub cursor: Option<String>,
    #[serde(default)]
    pub limit_bytes: u32,
    #[serde(default)]
    pub max_lines: u32,
}

fn tail_failure(err: TailError, path: &std::path::Path) -> ApiError {
    match err {
        TailError::NotFound => ApiError::NotFound {
            code: "log_not_found",
            message: format!("no log at {}", path.display()),
        },
        e @ TailError::InvalidCursor(_) => ApiError::BadRequest {
            code: "invalid_cursor",
            message: e.to_string(),
        },
        TailError::Io(e) => {
            ApiError::Internal(anyhow::Error::new(e).context(format!("tail {}", path.display())))
        }
    }
}

async fn instance_logs(
    State(state): State<AppState>,
    query: Result<Query<LogsQuery>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(q) = query?;
    let supervisor = &state.supervisor;
    let external_port = supervisor.mapped_external_port(q.external_port)?;
    let internal_port = supervisor.internal_port(external_port)?;
    let path = supervisor.settings().log_path(internal_port);

    let read = match &q.cursor {
        Some(cursor) => logs::tail_file(&path, cursor, q.limit_bytes, q.max_lines)
            .await
            .map(|tail| Json(tail).into_response()),
        None => logs::tail_text(&path, q.limit_bytes)
            .await
            .map(|text| text.into_response()),
    };
    match read {
        Ok(resp) => return Ok(resp),
        Err(TailError::NotFound) => {}
        Err(e) => return Err(tail_failure(e, &path)),
    }
    if supervisor.instance(external_port).await?.is_none() {
        return Err(ApiError::NotFound {
            code: "log_not_found",
            message: format!("no log for external port {external_port}"),
        });
    }
    // Running but nothing written yet.
    Ok(match q.cursor {
        Some(_) => Json(LogTail {
            lines: Vec::new(),
            next_cursor: "0".to_string(),
        })
        .into_response(),
        None => String::new().into_response(),
    })
}

#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub models: Vec<String>,
}

async fn list_models(State(state): State<AppState>) -> ApiResult<ModelsResponse> {
    let dir = &state.supervisor.settings().models_dir;
    match models::list_dir_names(dir).await {
        Ok(models) => Ok(Json(ModelsResponse { models })),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ApiError::NotFound {
            code: "models_dir_not_found",
            message: format!("models directory not found: {}", dir.display()),
        }),
        Err(e) => Err(ApiError::Internal(
            anyhow::Error::new(e).context(format!("list {}", dir.display())),
        )),
    }
}

#[derive(Debug, Serialize)]
pub struct SdStartResponse {
    pub status: &'static str,
    pub pid: u32,
    pub log_file: String,
}

async fn start_sd(State(state): State<AppState>) -> ApiResult<SdStartResponse> {
    let started = state.sd.start().await?;
    Ok(Json(SdStartResponse {
        status: "started",
        pid: started.pid,
        log_file: started.log_file,
    }))
}

async fn stop_sd(State(state): State<AppState>) -> ApiResult<StopResponse> {
    let outcome = state.sd.stop().await?;
    Ok(Json(StopResponse {
        status: "stopped",
        outcome,
    }))
}

#[derive(Debug, Serialize)]
pub struct SdStatusResponse {
    pub running: bool,
}

async fn sd_status(State(state): State<AppState>) -> Json<SdStatusResponse> {
    Json(SdStatusResponse {
        running: state.sd.is_running().await,
    })
}

async fn sd_logs(State(state): State<AppState>) -> Result<String, ApiError> {
    state
        .sd
        .logs()
        .await
        .map_err(|e| tail_failure(e, &state.sd.settings().log_file))
}

async fn list_sd_models(State(state): State<AppState>) -> ApiResult<ModelsResponse> {
    match state.sd.list_models().await {
        Ok(models) => Ok(Json(ModelsResponse { models })),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ApiError::NotFound {
            code: "models_dir_not_found",
            message: format!(
                "stable diffusion models directory not found: {}",
                state.sd.settings().models_dir.display()
            ),
        }),
        Err(e) => Err(ApiError::Internal(anyhow::Error::new(e).context(format!(
            "list {}",
            state.sd.settings().models_dir.display()
        )))),
    }
}

#[derive(Debug, Serialize)]
pub struct WebUiResponse {
    pub available: bool,
}

async fn check_sd_webui(State(state): State<AppState>) -> Json<WebUiResponse> {
    Json(WebUiResponse {
        available: state.sd.web_ui_available().await,
    })
}

#[derive(Debug, Serialize)]
pub struct HealthzResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub worker_present: bool,
    pub models_dir_present: bool,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthzResponse> {
    let settings = state.supervisor.settings();
    Json(HealthzResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        worker_present: tokio::fs::try_exists(&settings.worker_bin)
            .await
            .unwrap_or(false),
        models_dir_present: tokio::fs::metadata(&settings.models_dir)
            .await
            .is_ok_and(|m| m.is_dir()),
    })
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/start-llm-instance/", post(start_instance))
        .route("/stop-llm-instance/", post(stop_instance))
        .route("/list-llm-instances/", get(list_instances))
        .route("/stats/", get(stats))
        .route("/llm-logs/", get(instance_logs))
        .route("/list-models/", get(list_models))
        .route("/start-stable-diffusion/", post(start_sd))
        .route("/stop-stable-diffusion/", post(stop_sd))
        .route("/sd-status/", get(sd_status))
        .route("/sd-logs/", get(sd_logs))
        .route("/list-sd-models/", get(list_sd_models))
        .route("/check-sd-webui/", get(check_sd_webui))
        .layer(
            // The dashboard is served from a different origin than the API.
            CorsLayer::permissive()
                .expose_headers([HeaderName::from_static(mw::REQUEST_ID_HEADER)]),
        )
        .layer(middleware::from_fn(mw::request_id))
        .with_state(state)
}
