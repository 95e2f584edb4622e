//! WebSocket event relay
//!
//! Streams every bus event to connected clients as `{topic, payload}` JSON
//! frames. Backpressure: the broadcast ring holds 256 events; a client that
//! lags past that is disconnected rather than allowed to stall publishers.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::events::SystemEvent;
use crate::state::AppState;

/// WebSocket upgrade handler for `/ws/events`
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut event_rx = state.events.subscribe();
    // event sockets are long-lived; without this they would stall the
    // server's graceful shutdown until every client hung up on its own
    let mut shutdown_rx = state.shutdown_signal();

    info!("WebSocket client connected");
    let mut heartbeat = tokio::time::interval(tokio::time::Duration::from_secs(30));

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => {
                        info!("WebSocket client disconnected");
                        break;
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(_)) => {
                        // inbound payloads are ignored, this is a one-way feed
                        debug!("Ignoring client message on event socket");
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket receive error: {}", e);
                        break;
                    }
                }
            }

            event = event_rx.recv() => {
                match event {
                    Ok(event) => {
                        if let Err(e) = forward_event(&mut sender, &event).await {
                            warn!("Failed to send event, disconnecting: {}", e);
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        // slow subscriber: drop it, per backpressure policy
                        warn!("WebSocket client lagged by {} events, dropping", n);
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("Event bus closed");
                        break;
                    }
                }
            }

            _ = heartbeat.tick() => {
                if sender.send(Message::Ping(vec![])).await.is_err() {
                    warn!("Heartbeat failed, disconnecting");
                    break;
                }
            }

            _ = shutdown_rx.recv() => {
                info!("Shutting down, closing event socket");
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
        }
    }

    info!("WebSocket handler exiting");
}

async fn forward_event(
    sender: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    event: &SystemEvent,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(event)
        .map_err(|e| axum::Error::new(std::io::Error::other(e)))?;
    sender.send(Message::Text(json)).await
}
