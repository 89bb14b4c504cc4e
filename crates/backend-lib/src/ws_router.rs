// ============================
// crates/backend-lib/src/ws_router.rs
// ============================
//! WebSocket router and connection handling.
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use meetroom_common::ServerMessage;
use metrics::{counter, gauge};
use serde_json::json;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, info_span, Instrument};

use crate::coordinator::SessionCoordinator;
use crate::metrics::{WS_ACTIVE, WS_CONNECTION};
use crate::AppState;

/// Create the router: `/ws` for the relay, `/health` for probes.
///
/// Serve it with `into_make_service_with_connect_info::<SocketAddr>()`; the
/// client address feeds the join throttle.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "rooms": state.registry.room_count(),
    }))
}

/// Handler for WebSocket connections
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    counter!(WS_CONNECTION).increment(1);
    ws.on_upgrade(move |socket| handle_connection(socket, state, addr))
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>, addr: SocketAddr) {
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerMessage>();
    let mut coordinator = SessionCoordinator::new(state.registry.clone(), addr.ip(), out_tx);
    let span = info_span!("ws", conn_id = %coordinator.conn_id(), peer = %addr);

    async move {
        gauge!(WS_ACTIVE).increment(1.0);
        info!("connection opened");
        let (mut ws_tx, mut ws_rx) = socket.split();

        // Forward the outbound queue to the socket, in order
        let send_task = tokio::spawn(
            async move {
                while let Some(message) = out_rx.recv().await {
                    let text = match serde_json::to_string(&message) {
                        Ok(text) => text,
                        Err(e) => {
                            error!(error = %e, "failed to serialize server message");
                            continue;
                        },
                    };
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
            }
            .in_current_span(),
        );

        while let Some(frame) = ws_rx.next().await {
            match frame {
                Ok(Message::Text(text)) => coordinator.handle_text(text.as_str()).await,
                Ok(Message::Close(_)) => break,
                // pings are answered by axum; binary frames are not part of the protocol
                Ok(_) => {},
                Err(e) => {
                    debug!(error = %e, "websocket read failed");
                    break;
                },
            }
        }

        // Cleanup: the dropped socket counts as a disconnect
        coordinator.disconnect().await;
        send_task.abort();

        gauge!(WS_ACTIVE).decrement(1.0);
        info!("connection closed");
    }
    .instrument(span)
    .await;
}
