//! WebSocket and HTTP handlers
//!
//! One task per socket. The first frame must be a join; after that the
//! socket pumps the room's fan-out channel outward and published events
//! inward until the client leaves or the connection drops.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use jamroom_core::sync::{ClientFrame, Participant, RelayFrame, RoomSnapshot};

use crate::state::AppState;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

pub async fn healthz() -> &'static str {
    "ok"
}

pub async fn stats(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let metrics = state.metrics.read();
    Json(serde_json::json!({
        "uptime": metrics.uptime(),
        "connected_clients": metrics.connected_clients,
        "total_connections": metrics.total_connections,
        "peak_connections": metrics.peak_connections,
        "active_rooms": metrics.active_rooms,
        "total_rooms": metrics.total_rooms,
        "events_sequenced": metrics.events_sequenced,
    }))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    state.metrics.write().client_connected();

    let (mut sender, mut receiver) = socket.split();

    // The first frame must be a join.
    let Some((room_id, identity)) = await_join(&mut receiver).await else {
        let _ = send_frame(
            &mut sender,
            &RelayFrame::Error {
                message: "expected a join frame".to_string(),
            },
        )
        .await;
        state.metrics.write().client_disconnected();
        return;
    };

    let client_id = identity.client_id.clone();
    let (snapshot, mut room_rx) = state.join_room(&room_id, identity);
    if send_frame(&mut sender, &RelayFrame::Snapshot(snapshot))
        .await
        .is_err()
    {
        state.leave_room(&room_id, &client_id);
        state.metrics.write().client_disconnected();
        return;
    }

    loop {
        tokio::select! {
            fanned = room_rx.recv() => {
                match fanned {
                    Ok(json) => {
                        if sender.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(client_id, skipped = n, "client lagged behind room fan-out");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            inbound = receiver.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientFrame>(&text) {
                            Ok(ClientFrame::Publish { event }) => {
                                state.publish(&room_id, &client_id, event);
                            }
                            Ok(ClientFrame::Join { room_id: requested, .. }) => {
                                match rejoin_snapshot(&state, &room_id, &requested) {
                                    Ok(snapshot) => {
                                        if send_frame(&mut sender, &RelayFrame::Snapshot(snapshot))
                                            .await
                                            .is_err()
                                        {
                                            break;
                                        }
                                    }
                                    Err(message) => {
                                        warn!(client_id, requested, "rejected re-join: {message}");
                                        let _ = send_frame(
                                            &mut sender,
                                            &RelayFrame::Error { message },
                                        )
                                        .await;
                                        break;
                                    }
                                }
                            }
                            Ok(ClientFrame::Leave) => break,
                            Err(e) => {
                                debug!(client_id, "undecodable client frame: {e}");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.leave_room(&room_id, &client_id);
    state.metrics.write().client_disconnected();
}

/// Resolve an in-socket re-join. Re-joining the same room refreshes the
/// snapshot; switching rooms on a live socket is a protocol error.
fn rejoin_snapshot(
    state: &AppState,
    current: &str,
    requested: &str,
) -> Result<RoomSnapshot, String> {
    if requested != current {
        return Err(format!("already joined room {current}"));
    }
    state
        .snapshot(current)
        .ok_or_else(|| format!("room {current} is gone"))
}

/// Read frames until the join arrives; anything else before it is a
/// protocol violation.
async fn await_join(
    receiver: &mut (impl Stream<Item = Result<Message, axum::Error>> + Unpin),
) -> Option<(String, Participant)> {
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => {
                return match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(ClientFrame::Join { room_id, identity }) => Some((room_id, identity)),
                    _ => None,
                };
            }
            Message::Close(_) => return None,
            _ => {}
        }
    }
    None
}

async fn send_frame(
    sender: &mut (impl Sink<Message, Error = axum::Error> + Unpin),
    frame: &RelayFrame,
) -> Result<(), ()> {
    let json = serde_json::to_string(frame).map_err(|_| ())?;
    sender.send(Message::Text(json)).await.map_err(|_| ())
}
