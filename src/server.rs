//! HTTP surface of the SafeTrace service.
//!
//! Routes:
//!
//! ```text
//! GET  /health                        liveness
//! POST /v1/heartbeat                  structured heartbeat ingest
//! POST /v1/sms/webhook                form-encoded SMS ingress (TwiML out)
//! GET  /v1/user/:id/status            current UserState or UNKNOWN
//! POST /v1/alert/:id/resolve          mark alert resolved
//! POST /v1/blackbox/upload            offline trail summary
//! GET  /v1/blackbox/trails/:user_id   list recent trails
//! ```
//!
//! The SMS webhook always answers 200 so the provider does not retry;
//! problems are reported in the message body instead of the status code.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::alert::{AlertError, AlertOrchestrator};
use crate::cache::StateCache;
use crate::clock::SharedClock;
use crate::config::Config;
use crate::evaluator::SafetyEvaluator;
use crate::ingress::{HeartbeatRequest, Ingress, IngressError, SmsOutcome};
use crate::lastgasp::LastGaspTracker;
use crate::model::BlackboxEntry;
use crate::notify::Notifier;
use crate::signer::Signer;
use crate::store::Store;

const SERVICE_NAME: &str = "safetrace-api";

/// How many trails the listing endpoint returns.
const TRAIL_LIST_LIMIT: usize = 10;

/// Shared state behind every handler.
pub struct AppState {
    ingress: Ingress,
    orchestrator: Arc<AlertOrchestrator>,
    store: Arc<dyn Store>,
    cache: Arc<dyn StateCache>,
    clock: SharedClock,
}

impl AppState {
    /// Wire the full pipeline from a configuration and the injected
    /// collaborators.
    pub fn new(
        config: &Config,
        store: Arc<dyn Store>,
        cache: Arc<dyn StateCache>,
        notifier: Arc<dyn Notifier>,
        clock: SharedClock,
    ) -> Self {
        let signer = Signer::new(config.hmac_secret.clone());
        let lastgasp = Arc::new(LastGaspTracker::new(
            store.clone(),
            clock.clone(),
            config.lastgasp_timeout,
        ));
        let orchestrator = Arc::new(AlertOrchestrator::new(
            store.clone(),
            cache.clone(),
            notifier,
            clock.clone(),
            config.mapbox_token.clone(),
        ));
        let evaluator = Arc::new(SafetyEvaluator::new(
            store.clone(),
            cache.clone(),
            lastgasp.clone(),
            orchestrator.clone(),
            clock.clone(),
            config.heartbeat_window,
        ));
        let ingress = Ingress::new(
            store.clone(),
            cache.clone(),
            signer,
            lastgasp,
            evaluator,
            clock.clone(),
        );

        Self {
            ingress,
            orchestrator,
            store,
            cache,
            clock,
        }
    }
}

/// Error payload returned by JSON endpoints.
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

fn error_response(status: StatusCode, code: &str, error: String) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error,
            code: code.to_string(),
        }),
    )
}

fn ingress_error_response(e: IngressError) -> (StatusCode, Json<ErrorResponse>) {
    let message = e.to_string();
    match e {
        IngressError::BadRequest(_) => error_response(StatusCode::BAD_REQUEST, "BAD_REQUEST", message),
        IngressError::Unauthorized => {
            error_response(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
        }
        IngressError::UserNotFound => error_response(StatusCode::NOT_FOUND, "NOT_FOUND", message),
        IngressError::RateLimited => {
            error_response(StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED", message)
        }
        IngressError::Unavailable(_) => {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", message)
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    service: String,
    time: String,
}

/// GET /health
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: SERVICE_NAME.to_string(),
        time: state.clock.now().to_rfc3339(),
    })
}

#[derive(Serialize)]
struct HeartbeatResponse {
    status: String,
    message: String,
    id: Uuid,
}

/// POST /v1/heartbeat
async fn create_heartbeat(
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<HeartbeatResponse>, (StatusCode, Json<ErrorResponse>)> {
    // Decode explicitly so every shape problem maps to 400, not a mix of
    // extractor rejections.
    let request: HeartbeatRequest = serde_json::from_value(body)
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, "BAD_REQUEST", e.to_string()))?;

    let heartbeat = state
        .ingress
        .ingest_http(request)
        .await
        .map_err(ingress_error_response)?;

    Ok(Json(HeartbeatResponse {
        status: "success".to_string(),
        message: "heartbeat received".to_string(),
        id: heartbeat.id,
    }))
}

/// Form fields the SMS provider posts to the webhook.
#[derive(Deserialize)]
struct SmsWebhookForm {
    #[serde(rename = "Body", default)]
    body: String,
}

fn twiml(message: &str) -> Response {
    let xml = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?><Response><Message>{message}</Message></Response>"
    );
    (
        StatusCode::OK,
        [("Content-Type", "application/xml")],
        xml,
    )
        .into_response()
}

/// POST /v1/sms/webhook
async fn sms_webhook(
    State(state): State<Arc<AppState>>,
    Form(form): Form<SmsWebhookForm>,
) -> Response {
    match state.ingress.ingest_sms(&form.body).await {
        SmsOutcome::Accepted(_) => twiml("Heartbeat received"),
        SmsOutcome::Rejected(note) => twiml(note),
    }
}

#[derive(Serialize)]
struct UnknownStateResponse {
    user_id: Uuid,
    state: String,
    message: String,
}

/// GET /v1/user/:id/status
async fn user_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, (StatusCode, Json<ErrorResponse>)> {
    let user_id = Uuid::parse_str(&id).map_err(|_| {
        error_response(
            StatusCode::BAD_REQUEST,
            "BAD_REQUEST",
            "invalid user_id".to_string(),
        )
    })?;

    let current = state.cache.user_state(user_id).await.map_err(|e| {
        error_response(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", e.to_string())
    })?;

    match current {
        Some(user_state) => Ok(Json(user_state).into_response()),
        None => Ok(Json(UnknownStateResponse {
            user_id,
            state: "UNKNOWN".to_string(),
            message: "No data available".to_string(),
        })
        .into_response()),
    }
}

#[derive(Serialize)]
struct ResolveResponse {
    status: String,
    message: String,
}

/// POST /v1/alert/:id/resolve
async fn resolve_alert(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ResolveResponse>, (StatusCode, Json<ErrorResponse>)> {
    let alert_id = Uuid::parse_str(&id).map_err(|_| {
        error_response(
            StatusCode::BAD_REQUEST,
            "BAD_REQUEST",
            "invalid alert_id".to_string(),
        )
    })?;

    state.orchestrator.resolve(alert_id).await.map_err(|e| match e {
        AlertError::AlertNotFound => {
            error_response(StatusCode::NOT_FOUND, "NOT_FOUND", e.to_string())
        }
        other => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL",
            other.to_string(),
        ),
    })?;

    Ok(Json(ResolveResponse {
        status: "success".to_string(),
        message: "alert resolved".to_string(),
    }))
}

#[derive(Deserialize)]
struct BlackboxUploadRequest {
    user_id: String,
    start_ts: DateTime<Utc>,
    end_ts: DateTime<Utc>,
    data_points: Vec<BlackboxEntry>,
}

#[derive(Serialize)]
struct BlackboxUploadResponse {
    status: String,
    trail_id: Uuid,
    data_points: usize,
    message: String,
}

/// POST /v1/blackbox/upload
async fn upload_trail(
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<BlackboxUploadResponse>, (StatusCode, Json<ErrorResponse>)> {
    let request: BlackboxUploadRequest = serde_json::from_value(body)
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, "BAD_REQUEST", e.to_string()))?;

    let user_id = Uuid::parse_str(&request.user_id).map_err(|_| {
        error_response(
            StatusCode::BAD_REQUEST,
            "BAD_REQUEST",
            "invalid user_id".to_string(),
        )
    })?;

    let user = state.store.user_by_id(user_id).await.map_err(|e| {
        error_response(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", e.to_string())
    })?;
    if user.is_none() {
        return Err(error_response(
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            "user not found".to_string(),
        ));
    }

    // Bulk samples live in object storage in production; the summary row
    // carries a data URI stand-in.
    let data_json = serde_json::to_vec(&request.data_points).map_err(|e| {
        error_response(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", e.to_string())
    })?;
    let file_url = format!("data:application/json;base64,{}", BASE64.encode(&data_json));

    let trail = crate::model::BlackboxTrail {
        id: Uuid::new_v4(),
        user_id,
        start_ts: request.start_ts,
        end_ts: request.end_ts,
        data_points: request.data_points.len() as u32,
        file_url,
        uploaded_at: state.clock.now(),
    };

    state.store.create_trail(&trail).await.map_err(|e| {
        error_response(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", e.to_string())
    })?;

    tracing::info!(
        user_id = %user_id,
        trail_id = %trail.id,
        data_points = trail.data_points,
        "blackbox trail uploaded"
    );

    Ok(Json(BlackboxUploadResponse {
        status: "success".to_string(),
        trail_id: trail.id,
        data_points: request.data_points.len(),
        message: "blackbox trail uploaded successfully".to_string(),
    }))
}

#[derive(Serialize)]
struct TrailListResponse {
    user_id: Uuid,
    trails: Vec<crate::model::BlackboxTrail>,
}

/// GET /v1/blackbox/trails/:user_id
async fn user_trails(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TrailListResponse>, (StatusCode, Json<ErrorResponse>)> {
    let user_id = Uuid::parse_str(&id).map_err(|_| {
        error_response(
            StatusCode::BAD_REQUEST,
            "BAD_REQUEST",
            "invalid user_id".to_string(),
        )
    })?;

    let trails = state
        .store
        .trails_for_user(user_id, TRAIL_LIST_LIMIT)
        .await
        .map_err(|e| {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", e.to_string())
        })?;

    Ok(Json(TrailListResponse { user_id, trails }))
}

/// Build the router over the shared state.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/heartbeat", post(create_heartbeat))
        .route("/v1/sms/webhook", post(sms_webhook))
        .route("/v1/user/:id/status", get(user_status))
        .route("/v1/alert/:id/resolve", post(resolve_alert))
        .route("/v1/blackbox/upload", post(upload_trail))
        .route("/v1/blackbox/trails/:user_id", get(user_trails))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Run the HTTP server.
///
/// Binds immediately and serves on a spawned task. Dropping a `()` into
/// the returned sender starts a graceful shutdown; the join handle
/// completes once in-flight requests have drained.
pub async fn run(
    port: u16,
    state: Arc<AppState>,
) -> anyhow::Result<(SocketAddr, tokio::sync::oneshot::Sender<()>, JoinHandle<()>)> {
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    tracing::info!("SafeTrace API listening on http://{}", actual_addr);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                tracing::info!("Server shutdown signal received");
            })
            .await
        {
            tracing::error!("Server error: {e}");
        }
    });

    Ok((actual_addr, shutdown_tx, task))
}
