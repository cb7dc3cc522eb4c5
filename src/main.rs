mod alerts;
mod carrier;
mod catalog;
mod http;
mod idempotency;
mod jobs;
mod market;
mod metrics;
mod models;
mod negotiation;
mod pipeline;
mod pricing;
mod security;

use alerts::{AlertSink, ChannelTalkNotifier, LogAlerts};
use axum::{
    Json, Router,
    extract::{Extension, Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use catalog::RestCatalog;
use market::ElevenStClient;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ApiError, StageReport, SyncRequest, SyncResponse};
use pipeline::{Pipeline, PipelineConfig, PipelineError, PipelineErrorKind};
use security::{AuthContext, AuthState, require_api_auth};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use tokio::sync::Mutex;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "sync.api", "server crashed: {err}");
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let auth_state = AuthState::from_env();
    let pipeline = build_pipeline()?;
    let (queue, _worker) = jobs::JobQueue::spawn(pipeline.clone());
    let openapi: serde_json::Value = serde_yaml::from_str(include_str!("../docs/openapi.yaml"))
        .unwrap_or(json!({"openapi": "3.0.3"}));
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|err| format!("prometheus recorder: {err}"))?;
    let redis = std::env::var("REDIS_URL")
        .ok()
        .and_then(|u| redis::Client::open(u).ok());
    let state = AppState {
        pipeline,
        queue,
        openapi: Arc::new(openapi),
        idempotency: Arc::new(Mutex::new(HashMap::new())),
        prometheus_handle,
        redis,
    };

    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .route("/sync", post(run_sync))
        .nest(
            "/stages",
            Router::new()
                .route("/clear_options", post(stage_clear_options))
                .route("/negotiate_price", post(stage_negotiate_price))
                .route("/apply_options", post(stage_apply_options)),
        )
        .nest(
            "/jobs",
            Router::new()
                .route("/sync", post(enqueue_sync_job))
                .route("/{id}", get(get_job_status)),
        )
        .route_layer(middleware::from_fn_with_state(auth_state, require_api_auth));

    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .route("/docs", get(swagger_ui))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()));

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "sync.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

fn build_pipeline() -> Result<Pipeline, String> {
    let catalog = RestCatalog::from_env()
        .ok_or_else(|| "CATALOG_URL and CATALOG_SERVICE_KEY must be set".to_string())?;
    let alerts: Arc<dyn AlertSink> = match ChannelTalkNotifier::from_env() {
        Some(notifier) => Arc::new(notifier),
        None => {
            info!(
                target = "sync.api",
                "channel talk credentials missing; failures will only be logged"
            );
            Arc::new(LogAlerts)
        }
    };
    Ok(Pipeline::new(
        PipelineConfig::from_env(),
        Arc::new(ElevenStClient::new()),
        Arc::new(catalog),
        alerts,
    ))
}

#[derive(Clone)]
struct AppState {
    pipeline: Pipeline,
    queue: jobs::JobQueue,
    openapi: Arc<serde_json::Value>,
    idempotency: Arc<Mutex<HashMap<String, SyncResponse>>>,
    prometheus_handle: PrometheusHandle,
    redis: Option<redis::Client>,
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "openmarket-sync-rs",
    }))
}

async fn openapi_json(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    if let Ok(key) = std::env::var("OPENAPI_KEY") {
        let presented = headers
            .get("X-Docs-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != key {
            return Err(AppError::bad_request("unauthorized", None));
        }
    }
    Ok(Json((*state.openapi).clone()))
}

async fn swagger_ui() -> axum::http::Response<String> {
    let html = r#"<!doctype html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>Open Market Sync API Docs</title>
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
</html>"#;
    axum::http::Response::builder()
        .header("Content-Type", "text/html; charset=utf-8")
        .body(html.to_string())
        .unwrap_or_default()
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(256 * 1024)
}

async fn metrics_endpoint(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> axum::http::Response<String> {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return axum::http::Response::builder()
                .status(StatusCode::UNAUTHORIZED)
                .body("unauthorized".into())
                .unwrap_or_default();
        }
    }
    let body = state.prometheus_handle.render();
    axum::http::Response::builder()
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(body)
        .unwrap_or_default()
}

/// Run the full clear → price → options chain for one listing.
///
/// - Method: `POST`
/// - Path: `/sync`
/// - Auth: `Authorization: Bearer <key>` or `X-Sync-Key: <key>`
/// - Body: `SyncRequest`
/// - Response: `SyncResponse` (accepted price + per-stage transcript)
///
/// An `Idempotency-Key` header replays the stored response instead of
/// re-running the chain.
async fn run_sync(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    headers: axum::http::HeaderMap,
    Json(payload): Json<SyncRequest>,
) -> Result<Json<SyncResponse>, AppError> {
    crate::metrics::inc_requests("/sync");
    info!(
        target = "sync.api",
        caller = %context.caller_id,
        listing_id = payload.listing_id,
        target_price = payload.target_price,
        "sync invoked",
    );

    if let Some(key) = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
    {
        if let Some(client) = &state.redis {
            if let Some(existing) = idempotency::redis_get(client, &key).await {
                return Ok(Json(existing));
            }
            let response = state.pipeline.run(payload).await?;
            let ttl = std::env::var("IDEMPOTENCY_TTL_SECS")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(3600);
            idempotency::redis_set(client, &key, &response, ttl).await;
            return Ok(Json(response));
        }
        if let Some(existing) = state.idempotency.lock().await.get(&key).cloned() {
            return Ok(Json(existing));
        }
        let response = state.pipeline.run(payload).await?;
        state.idempotency.lock().await.insert(key, response.clone());
        return Ok(Json(response));
    }

    let response = state.pipeline.run(payload).await?;
    Ok(Json(response))
}

// -------- Stage endpoints (manual re-triggers after a failed run) --------

#[derive(Debug, Deserialize)]
struct ClearOptionsRequest {
    listing_id: i64,
}

#[derive(Debug, Deserialize)]
struct NegotiatePriceRequest {
    listing_id: i64,
    target_price: u32,
}

#[derive(Debug, Deserialize)]
struct ApplyOptionsRequest {
    listing_id: i64,
    #[serde(default)]
    margin: Option<u32>,
}

#[derive(Debug, Serialize)]
struct StageRunResponse {
    listing_id: i64,
    stages: Vec<StageReport>,
}

async fn stage_clear_options(
    State(state): State<AppState>,
    Json(req): Json<ClearOptionsRequest>,
) -> Result<Json<StageRunResponse>, AppError> {
    crate::metrics::inc_requests("/stages/clear_options");
    let stages = state.pipeline.run_clear_stage(req.listing_id).await?;
    Ok(Json(StageRunResponse {
        listing_id: req.listing_id,
        stages,
    }))
}

async fn stage_negotiate_price(
    State(state): State<AppState>,
    Json(req): Json<NegotiatePriceRequest>,
) -> Result<Json<StageRunResponse>, AppError> {
    crate::metrics::inc_requests("/stages/negotiate_price");
    let stages = state
        .pipeline
        .run_price_stage(req.listing_id, req.target_price)
        .await?;
    Ok(Json(StageRunResponse {
        listing_id: req.listing_id,
        stages,
    }))
}

async fn stage_apply_options(
    State(state): State<AppState>,
    Json(req): Json<ApplyOptionsRequest>,
) -> Result<Json<StageRunResponse>, AppError> {
    crate::metrics::inc_requests("/stages/apply_options");
    let stages = state
        .pipeline
        .run_options_stage(req.listing_id, req.margin)
        .await?;
    Ok(Json(StageRunResponse {
        listing_id: req.listing_id,
        stages,
    }))
}

// -------- Job queue endpoints --------

#[derive(Debug, Serialize)]
struct EnqueueResponse {
    job_id: String,
}

async fn enqueue_sync_job(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Json(payload): Json<SyncRequest>,
) -> Result<Json<EnqueueResponse>, AppError> {
    crate::metrics::inc_requests("/jobs/sync");
    info!(
        target = "sync.api",
        caller = %context.caller_id,
        listing_id = payload.listing_id,
        "sync job enqueued",
    );
    let id = state
        .queue
        .enqueue_sync(payload)
        .await
        .map_err(|err| AppError::bad_request(&err.error, err.detail.as_deref()))?;
    Ok(Json(EnqueueResponse {
        job_id: id.to_string(),
    }))
}

async fn get_job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<jobs::JobInfo>, AppError> {
    let Ok(uuid) = uuid::Uuid::parse_str(&id) else {
        return Err(AppError::bad_request("invalid_job_id", None));
    };
    if let Some(info) = state.queue.get(uuid).await {
        Ok(Json(info))
    } else {
        Err(AppError::not_found("job not found"))
    }
}

#[derive(Debug)]
enum AppError {
    Pipeline(PipelineError),
    BadRequest { error: String, detail: Option<String> },
    NotFound { detail: String },
}

impl AppError {
    fn bad_request(error: &str, detail: Option<&str>) -> Self {
        Self::BadRequest {
            error: error.to_string(),
            detail: detail.map(str::to_string),
        }
    }

    fn not_found(detail: &str) -> Self {
        Self::NotFound {
            detail: detail.to_string(),
        }
    }
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
                crate::metrics::inc_failures(err.stage().as_str());
                let status = match err.kind() {
                    PipelineErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
                    PipelineErrorKind::UnresolvedCarrier => StatusCode::UNPROCESSABLE_ENTITY,
                    PipelineErrorKind::MarketplaceCall => StatusCode::BAD_GATEWAY,
                    PipelineErrorKind::NegotiationDidNotConverge => StatusCode::CONFLICT,
                    PipelineErrorKind::Persistence | PipelineErrorKind::Internal => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                let payload = ApiError {
                    error: err.stage().to_string(),
                    detail: Some(err.detail().to_string()),
                };
                (status, Json(payload)).into_response()
            }
            AppError::BadRequest { error, detail } => {
                let payload = ApiError { error, detail };
                (StatusCode::BAD_REQUEST, Json(payload)).into_response()
            }
            AppError::NotFound { detail } => {
                let payload = ApiError {
                    error: "not_found".to_string(),
                    detail: Some(detail),
                };
                (StatusCode::NOT_FOUND, Json(payload)).into_response()
            }
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
