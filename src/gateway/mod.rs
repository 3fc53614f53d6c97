//! Axum gateway: agent WebSockets, normalized thread events and health.
//!
//! Plain HTTP routes get a body limit and a request timeout. WebSocket
//! sessions outlive the upgrade request and are not subject to the timeout.

pub mod ws;

use crate::config::GatewayConfig;
use crate::error::{is_conflict, is_not_found, is_validation};
use crate::orchestrator::{Coordinator, ThreadEvent};
use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
}

pub fn router(state: AppState, config: &GatewayConfig) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/events", post(handle_events))
        .route("/ws/agent", get(ws::handle_ws_agent))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(config.max_body_bytes))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(config.request_timeout_secs),
        ))
}

pub async fn run_gateway(config: GatewayConfig, coordinator: Arc<Coordinator>) -> Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind gateway on {addr}"))?;
    let actual_port = listener.local_addr()?.port();
    tracing::info!(host = %config.host, port = actual_port, "Gateway listening");

    let app = router(AppState { coordinator }, &config);
    axum::serve(listener, app).await?;
    Ok(())
}

/// GET /health
async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": state.coordinator.hub().len(),
    }))
}

/// POST /events: accept one normalized thread message
async fn handle_events(
    State(state): State<AppState>,
    Json(event): Json<ThreadEvent>,
) -> Response {
    match state.coordinator.handle_thread_event(&event) {
        Ok(dispatch) => (StatusCode::ACCEPTED, Json(dispatch)).into_response(),
        Err(e) => error_response(&e),
    }
}

fn error_response(err: &anyhow::Error) -> Response {
    let status = if is_validation(err) {
        StatusCode::BAD_REQUEST
    } else if is_not_found(err) {
        StatusCode::NOT_FOUND
    } else if is_conflict(err) {
        StatusCode::CONFLICT
    } else {
        tracing::error!("Event handling failed: {err:#}");
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(serde_json::json!({ "error": err.to_string() }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;

    #[test]
    fn error_kinds_map_to_status_codes() {
        let cases = [
            (anyhow::Error::from(CoreError::validation("bad")), StatusCode::BAD_REQUEST),
            (
                anyhow::Error::from(CoreError::not_found("job", "j_1")),
                StatusCode::NOT_FOUND,
            ),
            (anyhow::Error::from(CoreError::conflict("taken")), StatusCode::CONFLICT),
            (anyhow::anyhow!("disk on fire"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            assert_eq!(error_response(&err).status(), expected);
        }
    }
}
