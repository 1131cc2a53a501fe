//! Local HTTP service for the Cyclo growth tracker.
//!
//! One POST route per resource/action, all speaking the same JSON envelope:
//! `{success: true, data}` on success, `{error, details?}` on failure with
//! status 400, 401, 404, or 500. Browser callers get permissive CORS on
//! every response, preflights included.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use clap::Parser;
use cyclo_api::{
    CreateGrowthSystemRequest, CreateGrowthTaskRequest, CreateKnowledgeItemRequest,
    CreateReflectionRequest, CycloApi, ListActivitiesRequest, ListGrowthTasksRequest,
    UpdateCycloStageRequest, UpdateGrowthSystemRequest,
};
use cyclo_core::{
    Activity, ApiError, CycloEvolution, GrowthSystem, GrowthTask, KnowledgeItem, Reflection,
    UserId,
};
use cyclo_store_sqlite::{SchemaStatus, TableOwnership};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;

const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

/// The exact allow-headers value the browser clients were built against.
const ALLOW_HEADERS: &str = "authorization, x-client-info, apikey, content-type";

#[derive(Debug, Clone)]
struct ServiceState {
    api: CycloApi,
    env: EnvReport,
}

/// Booleans only; the diagnostics endpoint never exposes the values.
#[derive(Debug, Clone, Serialize)]
struct EnvReport {
    database_url_set: bool,
    anon_key_set: bool,
    service_role_key_set: bool,
    project_id_set: bool,
}

impl EnvReport {
    fn from_env() -> Self {
        Self {
            database_url_set: env_is_set("CYCLO_DATABASE_URL"),
            anon_key_set: env_is_set("CYCLO_ANON_KEY"),
            service_role_key_set: env_is_set("CYCLO_SERVICE_ROLE_KEY"),
            project_id_set: env_is_set("CYCLO_PROJECT_ID"),
        }
    }
}

fn env_is_set(name: &str) -> bool {
    std::env::var(name).is_ok_and(|value| !value.trim().is_empty())
}

#[derive(Debug, Clone, Serialize)]
struct SuccessEnvelope<T>
where
    T: Serialize,
{
    success: bool,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ErrorEnvelope {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

#[derive(Debug)]
struct ServiceError(ApiError);

impl From<ApiError> for ServiceError {
    fn from(err: ApiError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        let body = ErrorEnvelope {
            error: self.0.to_string(),
            details: self.0.details().map(str::to_string),
        };
        (status, Json(body)).into_response()
    }
}

fn success<T>(data: T) -> Json<SuccessEnvelope<T>>
where
    T: Serialize,
{
    Json(SuccessEnvelope { success: true, data })
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Debug, Serialize)]
struct DiagnosticsReport {
    environment: EnvReport,
    schema: SchemaStatus,
    ownership: Vec<TableOwnership>,
}

#[derive(Debug, Parser)]
#[command(name = "cyclo-service")]
#[command(about = "Local HTTP service for the Cyclo growth tracker")]
struct Args {
    /// Database path; falls back to CYCLO_DATABASE_URL.
    #[arg(long)]
    db: Option<PathBuf>,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
}

fn app(state: ServiceState) -> Router {
    let protected = Router::new()
        .route("/v1/create-growth-system", post(create_growth_system))
        .route("/v1/update-growth-system", post(update_growth_system))
        .route("/v1/create-growth-task", post(create_growth_task))
        .route("/v1/create-knowledge-item", post(create_knowledge_item))
        .route("/v1/create-reflection", post(create_reflection))
        .route("/v1/update-cyclo-stage", post(update_cyclo_stage))
        .route("/v1/get-cyclo-evolution", post(get_cyclo_evolution))
        .route("/v1/list-growth-systems", post(list_growth_systems))
        .route("/v1/list-growth-tasks", post(list_growth_tasks))
        .route("/v1/list-knowledge-items", post(list_knowledge_items))
        .route("/v1/list-reflections", post(list_reflections))
        .route("/v1/list-activities", post(list_activities))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_user));

    // The header-pinning layers sit outside the CORS layer so preflight
    // responses carry the exact values the original clients expect.
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/diagnostics", get(diagnostics))
        .merge(protected)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(SetResponseHeaderLayer::overriding(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static(ALLOW_HEADERS),
        ))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing();
    let db_path = resolve_db_path(args.db)?;
    let state = ServiceState {
        api: CycloApi::new(db_path),
        env: EnvReport::from_env(),
    };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "cyclo service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn resolve_db_path(flag: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = flag {
        return Ok(path);
    }
    match std::env::var("CYCLO_DATABASE_URL") {
        Ok(value) if !value.trim().is_empty() => Ok(PathBuf::from(value)),
        _ => anyhow::bail!("no database path: pass --db or set CYCLO_DATABASE_URL"),
    }
}

/// Resolves the bearer token to a user and stashes it in request extensions.
/// Requests without a resolvable user never reach a handler.
async fn require_user(
    State(state): State<ServiceState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ServiceError> {
    let token = bearer_token(request.headers()).ok_or(ServiceError(ApiError::Unauthorized))?;
    let user_id = state
        .api
        .resolve_token(token)?
        .ok_or(ServiceError(ApiError::Unauthorized))?;
    request.extensions_mut().insert(user_id);
    Ok(next.run(request).await)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

async fn health() -> Json<SuccessEnvelope<HealthResponse>> {
    success(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn openapi() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "application/yaml; charset=utf-8")],
        OPENAPI_YAML,
    )
}

async fn diagnostics(
    State(state): State<ServiceState>,
) -> Result<Json<SuccessEnvelope<DiagnosticsReport>>, ServiceError> {
    let store = state.api.diagnostics()?;
    Ok(success(DiagnosticsReport {
        environment: state.env.clone(),
        schema: store.schema,
        ownership: store.ownership,
    }))
}

async fn create_growth_system(
    State(state): State<ServiceState>,
    Extension(user_id): Extension<UserId>,
    body: Option<Json<CreateGrowthSystemRequest>>,
) -> Result<Json<SuccessEnvelope<GrowthSystem>>, ServiceError> {
    let request = body.map(|Json(request)| request).unwrap_or_default();
    let system = state.api.create_growth_system(user_id, request)?;
    Ok(success(system))
}

async fn update_growth_system(
    State(state): State<ServiceState>,
    Extension(user_id): Extension<UserId>,
    body: Option<Json<UpdateGrowthSystemRequest>>,
) -> Result<Json<SuccessEnvelope<GrowthSystem>>, ServiceError> {
    let request = body.map(|Json(request)| request).unwrap_or_default();
    let system = state.api.update_growth_system(user_id, request)?;
    Ok(success(system))
}

async fn create_growth_task(
    State(state): State<ServiceState>,
    Extension(user_id): Extension<UserId>,
    body: Option<Json<CreateGrowthTaskRequest>>,
) -> Result<Json<SuccessEnvelope<GrowthTask>>, ServiceError> {
    let request = body.map(|Json(request)| request).unwrap_or_default();
    let task = state.api.create_growth_task(user_id, request)?;
    Ok(success(task))
}

async fn create_knowledge_item(
    State(state): State<ServiceState>,
    Extension(user_id): Extension<UserId>,
    body: Option<Json<CreateKnowledgeItemRequest>>,
) -> Result<Json<SuccessEnvelope<KnowledgeItem>>, ServiceError> {
    let request = body.map(|Json(request)| request).unwrap_or_default();
    let item = state.api.create_knowledge_item(user_id, request)?;
    Ok(success(item))
}

async fn create_reflection(
    State(state): State<ServiceState>,
    Extension(user_id): Extension<UserId>,
    body: Option<Json<CreateReflectionRequest>>,
) -> Result<Json<SuccessEnvelope<Reflection>>, ServiceError> {
    let request = body.map(|Json(request)| request).unwrap_or_default();
    let reflection = state.api.create_reflection(user_id, request)?;
    Ok(success(reflection))
}

async fn update_cyclo_stage(
    State(state): State<ServiceState>,
    Extension(user_id): Extension<UserId>,
    body: Option<Json<UpdateCycloStageRequest>>,
) -> Result<Json<SuccessEnvelope<CycloEvolution>>, ServiceError> {
    let request = body.map(|Json(request)| request).unwrap_or_default();
    let evolution = state.api.update_cyclo_stage(user_id, request)?;
    Ok(success(evolution))
}

async fn get_cyclo_evolution(
    State(state): State<ServiceState>,
    Extension(user_id): Extension<UserId>,
) -> Result<Json<SuccessEnvelope<CycloEvolution>>, ServiceError> {
    let evolution = state.api.get_cyclo_evolution(user_id)?;
    Ok(success(evolution))
}

async fn list_growth_systems(
    State(state): State<ServiceState>,
    Extension(user_id): Extension<UserId>,
) -> Result<Json<SuccessEnvelope<Vec<GrowthSystem>>>, ServiceError> {
    let systems = state.api.list_growth_systems(user_id)?;
    Ok(success(systems))
}

async fn list_growth_tasks(
    State(state): State<ServiceState>,
    Extension(user_id): Extension<UserId>,
    body: Option<Json<ListGrowthTasksRequest>>,
) -> Result<Json<SuccessEnvelope<Vec<GrowthTask>>>, ServiceError> {
    let request = body.map(|Json(request)| request).unwrap_or_default();
    let tasks = state.api.list_growth_tasks(user_id, request)?;
    Ok(success(tasks))
}

async fn list_knowledge_items(
    State(state): State<ServiceState>,
    Extension(user_id): Extension<UserId>,
) -> Result<Json<SuccessEnvelope<Vec<KnowledgeItem>>>, ServiceError> {
    let items = state.api.list_knowledge_items(user_id)?;
    Ok(success(items))
}

async fn list_reflections(
    State(state): State<ServiceState>,
    Extension(user_id): Extension<UserId>,
) -> Result<Json<SuccessEnvelope<Vec<Reflection>>>, ServiceError> {
    let reflections = state.api.list_reflections(user_id)?;
    Ok(success(reflections))
}

async fn list_activities(
    State(state): State<ServiceState>,
    Extension(user_id): Extension<UserId>,
    body: Option<Json<ListActivitiesRequest>>,
) -> Result<Json<SuccessEnvelope<Vec<Activity>>>, ServiceError> {
    let request = body.map(|Json(request)| request).unwrap_or_default();
    let activities = state.api.list_activities(user_id, request)?;
    Ok(success(activities))
}
