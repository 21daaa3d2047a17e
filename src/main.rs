mod http;
mod listing;
mod llm;
mod metrics;
mod models;
mod pipeline;
mod security;
mod sessions;

use axum::{
    Json, Router,
    extract::{Extension, Path, State},
    http::{HeaderMap, StatusCode, header},
    middleware,
    response::{Html, IntoResponse, Response},
    routing::{get, patch, post},
};
use eyre::WrapErr;
use listing::{AttributePatch, FullListing, MatchVerdict};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{
    ApiError, ImagesRequest, PruneRequest, ResearchStageRequest, RunAccepted, SessionCreated,
    StageReport, StageResponse, SynthesizeStageRequest,
};
use pipeline::{
    ConsensusOutcome, Pipeline, PipelineError, PipelineErrorKind, RunSnapshot, RunStage,
    STAGE_GENERATION, STAGE_INPUT, STAGE_RESEARCH, STAGE_VERIFICATION,
};
use security::{AuthContext, AuthState, require_api_auth};
use serde_json::json;
use sessions::SessionRegistry;
use std::{net::SocketAddr, sync::Arc, time::Instant};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "atelier.api", "server crashed: {err:#}");
    }
}

async fn run() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .wrap_err("install prometheus recorder")?;
    let state = AppState {
        sessions: SessionRegistry::new(Pipeline::from_env()),
        openapi: Arc::new(load_openapi()),
        prometheus_handle,
    };
    let app = build_router(state, AuthState::from_env());

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "atelier.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("bind {addr}"))?;
    axum::serve(listener, app.into_make_service())
        .await
        .wrap_err("serve")?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    sessions: SessionRegistry,
    openapi: Arc<serde_json::Value>,
    prometheus_handle: PrometheusHandle,
}

fn build_router(state: AppState, auth_state: AuthState) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .route("/sessions", post(create_session))
        .route("/sessions/{id}", get(get_session).delete(delete_session))
        .route("/sessions/{id}/images", post(submit_images))
        .route("/sessions/{id}/images/prune", post(prune_images))
        .route("/sessions/{id}/attributes", patch(update_attributes))
        .route("/sessions/{id}/generate", post(generate_listing))
        .route("/sessions/{id}/cancel", post(cancel_run))
        .nest(
            "/stages",
            Router::new()
                .route("/verify", post(stage_verify))
                .route("/research", post(stage_research))
                .route("/synthesize", post(stage_synthesize)),
        )
        .route_layer(middleware::from_fn_with_state(auth_state, require_api_auth));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .route("/docs", get(swagger_ui))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()))
}

fn load_openapi() -> serde_json::Value {
    serde_yaml::from_str(include_str!("../docs/openapi.yaml"))
        .unwrap_or_else(|_| json!({"openapi": "3.0.3"}))
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "atelier-api-rs",
    }))
}

async fn openapi_json(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    if let Ok(key) = std::env::var("OPENAPI_KEY")
        && header_value(&headers, "X-Docs-Key") != key
    {
        return Err(AppError::Unauthorized);
    }
    Ok(Json((*state.openapi).clone()))
}

async fn swagger_ui() -> Html<&'static str> {
    Html(
        r#"<!doctype html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>Atelier API Docs</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
  <script>
    window.onload = () => {
      window.ui = SwaggerUIBundle({ url: '/openapi.json', dom_id: '#swagger-ui' });
    };
  </script>
</body>
</html>"#,
    )
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Ok(secret) = std::env::var("METRICS_KEY")
        && header_value(&headers, "X-Metrics-Key") != secret
    {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(25 * 1024 * 1024)
}

// -------- Sessions --------

/// Open a new listing session for the calling tenant.
///
/// - Method: `POST`
/// - Path: `/sessions`
/// - Auth: `Authorization: Bearer <key>` or `X-Atelier-Key: <key>`
async fn create_session(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
) -> (StatusCode, Json<SessionCreated>) {
    crate::metrics::inc_requests("/sessions");
    let id = state.sessions.create(&context).await;
    (
        StatusCode::CREATED,
        Json(SessionCreated {
            session_id: id.to_string(),
        }),
    )
}

async fn get_session(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<RunSnapshot>, AppError> {
    crate::metrics::inc_requests("/sessions/{id}");
    Ok(Json(state.sessions.snapshot(&context, &id).await?))
}

async fn delete_session(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    crate::metrics::inc_requests("/sessions/{id}");
    state.sessions.remove(&context, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Submit 1-5 photos and start verification in the background. Poll `GET /sessions/{id}`
/// for progress.
async fn submit_images(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(payload): Json<ImagesRequest>,
) -> Result<(StatusCode, Json<RunAccepted>), AppError> {
    crate::metrics::inc_requests("/sessions/{id}/images");
    let images = payload.into_assets()?;
    info!(
        target = "atelier.api",
        session_id = %id,
        tenant = %context.tenant,
        images = images.len(),
        "images_submitted"
    );
    let run_id = state.sessions.submit(&context, &id, images).await?;
    Ok(accepted(id, run_id, RunStage::Verifying))
}

async fn prune_images(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(payload): Json<PruneRequest>,
) -> Result<(StatusCode, Json<RunAccepted>), AppError> {
    crate::metrics::inc_requests("/sessions/{id}/images/prune");
    let run_id = state.sessions.prune(&context, &id, &payload.indices).await?;
    Ok(accepted(id, run_id, RunStage::Verifying))
}

async fn update_attributes(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(patch): Json<AttributePatch>,
) -> Result<Json<RunSnapshot>, AppError> {
    crate::metrics::inc_requests("/sessions/{id}/attributes");
    let orchestrator = state.sessions.get(&context, &id).await?;
    Ok(Json(orchestrator.update_attributes(patch).await?))
}

async fn generate_listing(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<RunAccepted>), AppError> {
    crate::metrics::inc_requests("/sessions/{id}/generate");
    let run_id = state.sessions.generate(&context, &id).await?;
    Ok(accepted(id, run_id, RunStage::Synthesizing))
}

async fn cancel_run(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<RunSnapshot>, AppError> {
    crate::metrics::inc_requests("/sessions/{id}/cancel");
    let orchestrator = state.sessions.get(&context, &id).await?;
    Ok(Json(orchestrator.cancel().await))
}

fn accepted(session_id: String, run_id: uuid::Uuid, stage: RunStage) -> (StatusCode, Json<RunAccepted>) {
    (
        StatusCode::ACCEPTED,
        Json(RunAccepted {
            session_id,
            run_id: run_id.to_string(),
            stage,
        }),
    )
}

// -------- Stage endpoints (single component, no session) --------

async fn stage_verify(
    State(state): State<AppState>,
    Json(payload): Json<ImagesRequest>,
) -> Result<Json<StageResponse<MatchVerdict>>, AppError> {
    crate::metrics::inc_requests("/stages/verify");
    let pipeline = state.sessions.pipeline();
    let images = payload.into_assets()?;
    pipeline.validate_images(&images)?;
    let started = Instant::now();
    let outcome = pipeline.verifier().verify(&images).await?;
    Ok(Json(StageResponse {
        result: outcome.value,
        report: StageReport::new(STAGE_VERIFICATION, started.elapsed().as_millis(), outcome.output),
    }))
}

async fn stage_research(
    State(state): State<AppState>,
    Json(payload): Json<ResearchStageRequest>,
) -> Result<Json<StageResponse<ConsensusOutcome>>, AppError> {
    crate::metrics::inc_requests("/stages/research");
    let missing = payload.attributes.missing_required();
    if !missing.is_empty() {
        return Err(PipelineError::invalid_input(
            STAGE_INPUT,
            format!("missing attributes: {}", missing.join(", ")),
        )
        .into());
    }
    let pipeline = state.sessions.pipeline();
    let started = Instant::now();
    let outcome = pipeline
        .resolver(pipeline.aggregator())
        .resolve(&payload.attributes)
        .await?;
    let output = json!({
        "iterations": outcome.iterations,
        "reached": outcome.reached,
        "listings": outcome.round.listings.len(),
    });
    Ok(Json(StageResponse {
        result: outcome,
        report: StageReport::new(STAGE_RESEARCH, started.elapsed().as_millis(), output),
    }))
}

async fn stage_synthesize(
    State(state): State<AppState>,
    Json(payload): Json<SynthesizeStageRequest>,
) -> Result<Json<StageResponse<FullListing>>, AppError> {
    crate::metrics::inc_requests("/stages/synthesize");
    let missing = payload.attributes.missing_required();
    if !missing.is_empty() {
        return Err(PipelineError::invalid_input(
            STAGE_INPUT,
            format!("missing attributes: {}", missing.join(", ")),
        )
        .into());
    }
    let started = Instant::now();
    let outcome = state
        .sessions
        .pipeline()
        .synthesizer()
        .synthesize(&payload.attributes, payload.master_text.as_deref())
        .await?;
    Ok(Json(StageResponse {
        result: outcome.value,
        report: StageReport::new(STAGE_GENERATION, started.elapsed().as_millis(), outcome.output),
    }))
}

// -------- Errors --------

#[derive(Debug)]
enum AppError {
    Pipeline(PipelineError),
    Unauthorized,
}

impl From<PipelineError> for AppError {
    fn from(value: PipelineError) -> Self {
        Self::Pipeline(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Pipeline(err) => {
                let (status, code) = match err.kind() {
                    PipelineErrorKind::InvalidInput => (StatusCode::BAD_REQUEST, "invalid_input"),
                    PipelineErrorKind::NotFound => (StatusCode::NOT_FOUND, "not_found"),
                    PipelineErrorKind::Conflict => (StatusCode::CONFLICT, "conflict"),
                    PipelineErrorKind::Cancelled => (StatusCode::CONFLICT, "cancelled"),
                    PipelineErrorKind::Inference => (StatusCode::BAD_GATEWAY, "inference_failure"),
                    PipelineErrorKind::Internal => {
                        (StatusCode::INTERNAL_SERVER_ERROR, "internal")
                    }
                };
                if status.is_server_error() {
                    error!(target = "atelier.api", stage = err.stage(), error = %err, "request_failed");
                }
                let payload = ApiError {
                    error: code.to_string(),
                    detail: Some(err.to_string()),
                };
                (status, Json(payload)).into_response()
            }
            AppError::Unauthorized => {
                let payload = ApiError {
                    error: "unauthorized".to_string(),
                    detail: None,
                };
                (StatusCode::UNAUTHORIZED, Json(payload)).into_response()
            }
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
