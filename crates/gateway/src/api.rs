// HTTP Read API
//
// Query endpoints over persisted data and live relay state, plus a
// single-shot ingest endpoint for devices without a WebSocket client.

use crate::handlers::RelayHandlers;
use crate::protocol::clamp_limit;
use crate::server::validate_device_id;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use farmrelay_core::{now_timestamp, RelayError, SensorPayload, SensorReading};
use farmrelay_storage::StorageError;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

#[derive(Clone)]
pub struct ApiState {
    pub handlers: Arc<RelayHandlers>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

/// Error body returned by every endpoint
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "status": "error", "message": self.message }));
        (self.status, body).into_response()
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self {
            status: rejection.status(),
            message: rejection.body_text(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self {
            status: rejection.status(),
            message: rejection.body_text(),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        tracing::error!("API storage call failed: {}", err);
        Self::internal("Storage unavailable")
    }
}

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        if err.is_malformed_input() {
            Self::bad_request(err.to_string())
        } else {
            tracing::error!("API request failed: {}", err);
            Self::internal(err.to_string())
        }
    }
}

type ApiResult = Result<Json<JsonValue>, ApiError>;

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if allowed_origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!("Ignoring invalid CORS origin {:?}", origin);
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}

/// Build the API router
pub fn build_router(handlers: Arc<RelayHandlers>, allowed_origins: &[String]) -> Router {
    Router::new()
        .route("/api", get(index))
        .route("/api/status", get(status))
        .route("/api/devices", get(devices))
        .route("/api/devices/{device_id}/data", get(device_data))
        .route("/api/data/recent", get(recent_data))
        .route("/api/data", post(ingest))
        .route("/api/statistics", get(statistics))
        .with_state(ApiState { handlers })
        .layer(cors_layer(allowed_origins))
}

/// Serve the API until the listener fails
pub async fn serve_api(listener: tokio::net::TcpListener, router: Router) -> anyhow::Result<()> {
    tracing::info!("HTTP API listening on {}", listener.local_addr()?);
    axum::serve(listener, router).await?;
    Ok(())
}

async fn index() -> Json<JsonValue> {
    Json(json!({
        "service": "farmrelay",
        "version": env!("CARGO_PKG_VERSION"),
        "websocket": {
            "device": "/ws/device/{device_id}",
            "device_legacy": "/ws/esp32/{device_id}",
            "dashboard": "/ws/dashboard",
        },
    }))
}

async fn status(State(state): State<ApiState>) -> Json<JsonValue> {
    let registry = state.handlers.registry();
    Json(json!({
        "status": "running",
        "connected_devices": registry.connected_device_ids().await,
        "statistics": registry.relay_statistics().await,
        "timestamp": now_timestamp(),
    }))
}

async fn devices(State(state): State<ApiState>) -> ApiResult {
    let devices = state.handlers.registry().storage().devices().await?;
    Ok(Json(json!({ "count": devices.len(), "devices": devices })))
}

async fn device_data(
    State(state): State<ApiState>,
    Path(device_id): Path<String>,
    query: Result<Query<LimitQuery>, QueryRejection>,
) -> ApiResult {
    let Query(query) = query?;
    let data = state
        .handlers
        .registry()
        .storage()
        .device_readings(&device_id, clamp_limit(query.limit))
        .await?;
    Ok(Json(json!({
        "device_id": device_id,
        "count": data.len(),
        "data": data,
    })))
}

async fn recent_data(
    State(state): State<ApiState>,
    query: Result<Query<LimitQuery>, QueryRejection>,
) -> ApiResult {
    let Query(query) = query?;
    let data = state
        .handlers
        .registry()
        .storage()
        .recent_readings(clamp_limit(query.limit))
        .await?;
    Ok(Json(json!({ "count": data.len(), "data": data })))
}

async fn statistics(State(state): State<ApiState>) -> ApiResult {
    let stats = state.handlers.registry().storage().statistics().await?;
    Ok(Json(serde_json::to_value(stats).map_err(RelayError::from)?))
}

async fn ingest(
    State(state): State<ApiState>,
    body: Result<Json<JsonValue>, JsonRejection>,
) -> ApiResult {
    let Json(body) = body?;
    let device_id = body
        .get("device_id")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| ApiError::bad_request("device_id is required"))?
        .to_string();
    validate_device_id(&device_id).map_err(ApiError::bad_request)?;

    let payload = SensorPayload::from_value(body)?;
    let reading = state
        .handlers
        .ingest(SensorReading::stamp_now(device_id, payload))
        .await?;

    Ok(Json(json!({
        "status": "ok",
        "message": "Data received",
        "device_id": reading.device_id,
        "timestamp": reading.timestamp,
    })))
}
