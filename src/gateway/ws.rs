//! Persistent agent connections.
//!
//! ```text
//! Agent  -> GET /ws/agent?organization_id=org_1&runtime_id=claude
//! Server -> {"id":"msg_...","type":"start_conversation","payload":{...}}
//! Agent  -> {"type":"acknowledgement","payload":{"message_id":"msg_..."}}
//! ```

use super::AppState;
use crate::error::is_validation;
use crate::ids::{new_id, CONNECTION_PREFIX};
use crate::transport::FrameSink;
use anyhow::Result;
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Deserialize)]
pub struct AgentQuery {
    pub organization_id: Option<String>,
    pub runtime_id: Option<String>,
}

/// Write half of the socket. Only the connection's dispatch lane writes to it.
struct WsSink {
    inner: Mutex<SplitSink<WebSocket, Message>>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send_text(&self, text: String) -> Result<()> {
        self.inner.lock().await.send(Message::Text(text.into())).await?;
        Ok(())
    }
}

/// GET /ws/agent: WebSocket upgrade for a coding agent
pub async fn handle_ws_agent(
    State(state): State<AppState>,
    Query(params): Query<AgentQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let organization_id = params
        .organization_id
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    let runtime_id = params
        .runtime_id
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    let (Some(organization_id), Some(runtime_id)) = (organization_id, runtime_id) else {
        return (
            StatusCode::BAD_REQUEST,
            "organization_id and runtime_id query parameters are required",
        )
            .into_response();
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, organization_id, runtime_id))
        .into_response()
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    organization_id: String,
    runtime_id: String,
) {
    let connection_id = match new_id(CONNECTION_PREFIX) {
        Ok(id) => id,
        Err(e) => {
            tracing::error!("Failed to allocate connection id: {e}");
            return;
        }
    };
    let (sender, mut receiver) = socket.split();
    let sink: Arc<dyn FrameSink> = Arc::new(WsSink {
        inner: Mutex::new(sender),
    });

    if let Err(e) = state
        .coordinator
        .connect_agent(&connection_id, &organization_id, &runtime_id, sink)
        .await
    {
        tracing::warn!(connection_id = %connection_id, "Rejecting agent connection: {e:#}");
        return;
    }

    while let Some(msg) = receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            _ => continue,
        };
        if let Err(e) = state
            .coordinator
            .handle_agent_frame(&connection_id, text.as_str())
        {
            if is_validation(&e) {
                tracing::debug!(connection_id = %connection_id, "Rejected agent frame: {e}");
            } else {
                tracing::warn!(
                    connection_id = %connection_id,
                    "Failed to handle agent frame: {e:#}"
                );
            }
        }
    }

    if let Err(e) = state.coordinator.disconnect_agent(&connection_id).await {
        tracing::warn!(connection_id = %connection_id, "Disconnect cleanup failed: {e:#}");
    }
}
