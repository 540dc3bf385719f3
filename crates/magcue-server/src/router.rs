//! HTTP routes of the relay.
//!
//! | Method | Path | Response |
//! |---|---|---|
//! | `GET` | `/status`, `/api/status` | `200 {connected, timestamp}` |
//! | `POST` | `/actuator`, `/api/magnet` | `200 {level}` or `400 {error}` |
//! | `POST` | `/connect` | `200 {connected, timestamp}` after a connect attempt |
//! | `GET` + `Upgrade: websocket` | any other path | WebSocket bridge |
//!
//! CORS is fully open; preflights are answered by the CORS layer.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use magcue_hub::BroadcastHub;
use magcue_types::{ActuatorRequest, ActuatorResponse, ErrorResponse, StatusResponse};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::server::handle_socket;

/// Body of the `400` returned for a rejected actuator level.
pub const INVALID_LEVEL: &str = "Invalid level. Must be 0-5.";

/// Build the relay router around `hub`.
pub fn create_router(hub: Arc<BroadcastHub>) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/api/status", get(status))
        .route("/actuator", post(set_actuator))
        .route("/api/magnet", post(set_actuator))
        .route("/connect", post(connect))
        .fallback(websocket_or_not_found)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(hub)
}

/// Errors surfaced as `{ "error": ... }` bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiError {
    InvalidLevel,
    NotFound,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::InvalidLevel => (StatusCode::BAD_REQUEST, INVALID_LEVEL),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "Not found"),
        };
        let body = Json(ErrorResponse {
            error: message.to_string(),
        });
        (status, body).into_response()
    }
}

fn status_body(connected: bool) -> Json<StatusResponse> {
    Json(StatusResponse {
        connected,
        timestamp: Utc::now(),
    })
}

async fn status(State(hub): State<Arc<BroadcastHub>>) -> Json<StatusResponse> {
    status_body(hub.connected())
}

async fn connect(State(hub): State<Arc<BroadcastHub>>) -> Json<StatusResponse> {
    status_body(hub.connect_device().await)
}

async fn set_actuator(
    State(hub): State<Arc<BroadcastHub>>,
    body: Result<Json<ActuatorRequest>, JsonRejection>,
) -> Result<Json<ActuatorResponse>, ApiError> {
    let Json(request) = body.map_err(|e| {
        debug!(error = %e, "unreadable actuator request");
        ApiError::InvalidLevel
    })?;
    // Rejections are logged by the hub.
    let command = hub
        .request_command(request.level)
        .map_err(|_| ApiError::InvalidLevel)?;
    Ok(Json(ActuatorResponse {
        level: command.level(),
    }))
}

async fn websocket_or_not_found(
    State(hub): State<Arc<BroadcastHub>>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    match upgrade {
        Ok(ws) => ws.on_upgrade(move |socket| handle_socket(socket, hub)),
        Err(_) => ApiError::NotFound.into_response(),
    }
}
