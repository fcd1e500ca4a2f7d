use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use nl2sql_core::{CompileError, CompilePipeline, Dialect, SchemaRegistry, ValidationReport};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use utoipa::{OpenApi, ToSchema};

use crate::{
    config::AppConfig,
    llm::{GenerationRequest, ModelClient, ModelError, OllamaClient},
};

pub const SERVICE_NAME: &str = "nl2sql-daemon";
const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");
const MIN_QUESTION_CHARS: usize = 3;
const FALLBACK_DIALECT: &str = "mysql";

pub async fn run(config: AppConfig) -> Result<()> {
    let schema = SchemaRegistry::open(&config.schema_path)
        .with_context(|| format!("failed to load schema {}", config.schema_path.display()))?;
    let model = OllamaClient::new(config.ollama_base_url.clone(), config.ollama_timeout)
        .context("failed to build model client")?;

    let listen_addr = config.listen_addr;
    let state = Arc::new(AppState::new(config, schema, Arc::new(model)));
    let app = build_router(state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .context("failed to bind listen socket")?;

    info!(addr = %listen_addr, "nl2sql-daemon listening");
    axum::serve(listener, app)
        .await
        .context("HTTP server exited")?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/version", get(version))
        .route("/schema", get(schema_info))
        .route("/nl2sql/compile", post(compile_sql))
        .with_state(state)
}

pub struct AppState {
    config: AppConfig,
    schema: SchemaRegistry,
    model: Arc<dyn ModelClient>,
    pipeline: CompilePipeline,
}

impl AppState {
    pub fn new(config: AppConfig, schema: SchemaRegistry, model: Arc<dyn ModelClient>) -> Self {
        let pipeline = CompilePipeline::new(config.limit_max);
        Self {
            config,
            schema,
            model,
            pipeline,
        }
    }

    /// Picks up schema edits; a broken file keeps the last good catalog.
    fn refresh_schema(&self) {
        if let Err(err) = self.schema.reload_if_changed(false) {
            warn!(error = %err, "schema reload failed; serving previous catalog");
        }
    }
}

#[utoipa::path(
    get,
    path = "/healthz",
    responses((status = 200, description = "Service is healthy", body = HealthResponse))
)]
async fn healthz(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    state.refresh_schema();
    Json(HealthResponse {
        status: "ok".to_string(),
        service: SERVICE_NAME.to_string(),
        version: SERVICE_VERSION.to_string(),
    })
}

#[utoipa::path(
    get,
    path = "/version",
    responses((status = 200, description = "Service version", body = VersionResponse))
)]
async fn version() -> Json<VersionResponse> {
    Json(VersionResponse {
        version: SERVICE_VERSION.to_string(),
    })
}

#[utoipa::path(
    get,
    path = "/schema",
    responses(
        (status = 200, description = "Loaded schema catalog", body = SchemaResponse),
        (status = 500, description = "Schema file could not be loaded", body = ErrorBody)
    )
)]
async fn schema_info(State(state): State<Arc<AppState>>) -> Result<Json<SchemaResponse>, ApiError> {
    state
        .schema
        .reload_if_changed(false)
        .map_err(ApiError::internal)?;

    Ok(Json(SchemaResponse {
        path: state.schema.path().display().to_string(),
        dialect: state.schema.dialect(),
        tables: state.schema.tables().into_iter().collect(),
    }))
}

#[utoipa::path(
    post,
    path = "/nl2sql/compile",
    request_body = CompileBody,
    responses(
        (status = 200, description = "Compiled statement with policy report", body = CompileResponse),
        (status = 400, description = "Invalid question or unsupported model", body = ErrorBody),
        (status = 502, description = "Model failed or produced no SQL", body = ErrorBody)
    )
)]
async fn compile_sql(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CompileBody>,
) -> Result<Json<CompileResponse>, ApiError> {
    state.refresh_schema();

    let question = payload.question.trim();
    if question.chars().count() < MIN_QUESTION_CHARS {
        return Err(ApiError::bad_request(format!(
            "question must be at least {MIN_QUESTION_CHARS} characters"
        )));
    }

    let model = non_empty(payload.model.as_deref())
        .unwrap_or(&state.config.default_model)
        .to_string();
    if !state.config.is_model_allowed(&model) {
        let allowed: Vec<&str> = state.config.allowed_models.iter().map(String::as_str).collect();
        return Err(ApiError::bad_request(format!(
            "Unsupported model. Allowed: {}",
            allowed.join(", ")
        )));
    }

    let catalog = state.schema.snapshot();
    let dialect_tag = non_empty(payload.dialect.as_deref())
        .or_else(|| non_empty(Some(&catalog.dialect)))
        .unwrap_or(FALLBACK_DIALECT)
        .to_lowercase();

    let request = GenerationRequest {
        model: model.clone(),
        question: question.to_string(),
        dialect: dialect_tag.clone(),
        schema_text: catalog.prompt.clone(),
        limit_max: state.pipeline.limit_max(),
    };
    let raw = state.model.generate_sql(&request).await?;
    if raw.trim().is_empty() {
        return Err(ApiError::new(StatusCode::BAD_GATEWAY, "Empty output from model."));
    }

    let compiled = state
        .pipeline
        .compile(&raw, Dialect::from_tag(&dialect_tag), &catalog.tables)?;

    info!(
        model = %model,
        dialect = %dialect_tag,
        passes = compiled.report.passes(),
        retry_adopted = compiled.retry_adopted,
        "compiled SQL"
    );

    Ok(Json(CompileResponse {
        sql: compiled.sql,
        model,
        validators: ValidatorsResponse::from(compiled.report),
        explanation: None,
    }))
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CompileBody {
    /// Natural language question or task.
    question: String,
    /// SQL dialect such as `mysql` or `postgres`; defaults to the schema's.
    #[serde(default)]
    dialect: Option<String>,
    /// Model tag; must be on the configured allow-list.
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CompileResponse {
    sql: String,
    model: String,
    validators: ValidatorsResponse,
    explanation: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ValidatorsResponse {
    parse_ok: bool,
    select_only: bool,
    no_star: bool,
    limit_ok: bool,
    tables_ok: bool,
    tables_used: Vec<String>,
}

impl From<ValidationReport> for ValidatorsResponse {
    fn from(report: ValidationReport) -> Self {
        Self {
            parse_ok: report.parse_ok,
            select_only: report.select_only,
            no_star: report.no_star,
            limit_ok: report.limit_ok,
            tables_ok: report.tables_ok,
            tables_used: report.tables_used.into_iter().collect(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    status: String,
    service: String,
    version: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct VersionResponse {
    version: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SchemaResponse {
    path: String,
    dialect: String,
    tables: Vec<String>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn internal<E: std::fmt::Display>(err: E) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

impl From<ModelError> for ApiError {
    fn from(err: ModelError) -> Self {
        let message = match &err {
            ModelError::Status { status, body } => format!("Ollama returned {status}: {body}"),
            ModelError::Transport(inner) => format!("Ollama request error: {inner}"),
            ModelError::Decode(inner) => format!("Upstream model error: {inner}"),
        };
        ApiError::new(StatusCode::BAD_GATEWAY, message)
    }
}

impl From<CompileError> for ApiError {
    fn from(err: CompileError) -> Self {
        match err {
            CompileError::EmptyExtraction => ApiError::new(
                StatusCode::BAD_GATEWAY,
                "Failed to extract SQL from model output.",
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!(status = %self.status, message = %self.message, "api error");
        let body = Json(ErrorBody {
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    error: String,
}

pub mod docs {
    use super::*;

    #[derive(OpenApi)]
    #[openapi(
        info(title = "NL2SQL Daemon API", version = "0.1.0"),
        paths(healthz, version, schema_info, compile_sql),
        components(schemas(
            CompileBody,
            CompileResponse,
            ValidatorsResponse,
            HealthResponse,
            VersionResponse,
            SchemaResponse,
            ErrorBody
        ))
    )]
    pub struct ApiDoc;
}
