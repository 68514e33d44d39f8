use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::response::Response;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::api::AppState;
use crate::auth::{self, Claims};
use crate::error::{Error, Result};
use crate::hub::Connection;
use crate::protocol::{ClientFrame, Envelope, MessageKind, RouteClass};

// ---------------------------------------------------------------------------
// Upgrade handler
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct WsQuery {
    token: String,
}

/// `GET /ws/:room_id?token=...` — validate the participant token, then hand
/// the socket to the connection actor.
pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response> {
    let claims = auth::verify_token(&state.config.jwt_secret, &query.token)?;
    if claims.room_id != room_id {
        return Err(Error::forbidden("token does not match room"));
    }

    let max_frame = state.config.max_frame_bytes;
    Ok(ws
        .max_message_size(max_frame)
        .max_frame_size(max_frame)
        .on_upgrade(move |socket| handle_socket(socket, state, claims)))
}

// ---------------------------------------------------------------------------
// Connection actor
// ---------------------------------------------------------------------------

/// Owns one transport connection: an inbound loop classifying frames and an
/// outbound loop draining the bounded queue with a heartbeat probe.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, claims: Claims) {
    let connection_id = uuid::Uuid::new_v4().to_string();
    let (outbound_tx, outbound_rx) = mpsc::channel(state.config.outbound_queue_capacity);
    let (sink, stream) = socket.split();

    debug!(
        room_id = %claims.room_id,
        participant_id = %claims.sub,
        is_host = claims.host,
        "websocket connected"
    );

    state.hub.register(Connection {
        connection_id: connection_id.clone(),
        room_id: claims.room_id.clone(),
        participant_id: claims.sub.clone(),
        display_name: claims.name.clone(),
        is_host: claims.host,
        outbound: outbound_tx,
    });

    let writer = tokio::spawn(write_loop(
        sink,
        outbound_rx,
        state.config.heartbeat_interval(),
        state.config.write_timeout,
    ));

    // Blocks until the peer disconnects, goes idle, or misbehaves.
    read_loop(stream, &state, &claims, &connection_id).await;

    // Teardown runs exactly once: this is the only exit path, whichever of
    // the close causes (peer close, idle timeout, malformed frame) fired.
    state.hub.unregister(&claims.room_id, &connection_id);
    writer.abort();

    // Trim the roster; a failure here is harmless because the room record
    // expires on its own.
    if let Err(e) = state
        .sessions
        .remove_participant(&claims.room_id, &claims.sub)
        .await
    {
        debug!(error = %e, room_id = %claims.room_id, "roster trim on disconnect failed");
    }

    debug!(
        room_id = %claims.room_id,
        participant_id = %claims.sub,
        "websocket disconnected"
    );
}

/// Drain the outbound queue to the wire; probe the peer between frames.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<String>,
    heartbeat_interval: std::time::Duration,
    write_timeout: std::time::Duration,
) {
    let mut ticker = tokio::time::interval(heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    let write = tokio::time::timeout(write_timeout, sink.send(Message::Text(frame)));
                    if !matches!(write.await, Ok(Ok(()))) {
                        break;
                    }
                }
                // The hub released this connection.
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            _ = ticker.tick() => {
                let write = tokio::time::timeout(write_timeout, sink.send(Message::Ping(Vec::new())));
                if !matches!(write.await, Ok(Ok(()))) {
                    break;
                }
            }
        }
    }
}

/// Deserialize and route inbound frames until the connection dies.
async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    state: &AppState,
    claims: &Claims,
    connection_id: &str,
) {
    loop {
        let message = match tokio::time::timeout(state.config.heartbeat_timeout, stream.next()).await
        {
            Err(_) => {
                debug!(participant_id = %claims.sub, "read idle timeout, closing");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!(participant_id = %claims.sub, error = %e, "websocket read error");
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Text(text) => {
                if !route_frame(&text, state, claims, connection_id) {
                    break;
                }
            }
            Message::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => {
                    if !route_frame(&text, state, claims, connection_id) {
                        break;
                    }
                }
                Err(_) => {
                    warn!(participant_id = %claims.sub, "non-UTF8 binary frame, closing");
                    break;
                }
            },
            // Any traffic (pongs included) already reset the idle timer.
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => break,
        }
    }
}

// ---------------------------------------------------------------------------
// Frame routing
// ---------------------------------------------------------------------------

/// Where one inbound frame should go.
#[derive(Debug, PartialEq, Eq)]
enum Delivery {
    /// Everyone in the room, sender included.
    BroadcastAll,
    /// Everyone except the sender.
    BroadcastOthers,
    /// Exactly one participant.
    Direct(String),
    /// Dropped without notice.
    Discard,
}

/// Pure classification of an inbound frame.
///
/// Privileged kinds from a non-host and hub-generated kinds from any client
/// are discarded, not errored: the sender gets no feedback by design.
fn classify(kind: MessageKind, target_id: Option<&str>, is_host: bool) -> Delivery {
    match kind.route() {
        RouteClass::Chat => Delivery::BroadcastAll,
        RouteClass::Signal => match target_id {
            Some(target) => Delivery::Direct(target.to_string()),
            None => Delivery::BroadcastOthers,
        },
        RouteClass::HostControl if is_host => Delivery::BroadcastOthers,
        RouteClass::HostControl => Delivery::Discard,
        RouteClass::ServerEvent => Delivery::Discard,
    }
}

/// Route a raw inbound frame. Returns `false` when the frame is malformed
/// and the connection must be torn down.
fn route_frame(text: &str, state: &AppState, claims: &Claims, connection_id: &str) -> bool {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(participant_id = %claims.sub, error = %e, "malformed frame, closing");
            return false;
        }
    };

    let kind = frame.kind;
    let delivery = classify(kind, frame.target_id.as_deref(), claims.host);
    if delivery == Delivery::Discard {
        debug!(participant_id = %claims.sub, ?kind, "frame discarded");
        return true;
    }

    let envelope = Envelope::from_client(frame, &claims.room_id, &claims.sub);
    let serialized = match envelope.to_json() {
        Ok(serialized) => serialized,
        Err(e) => {
            warn!(error = %e, "failed to re-serialize frame");
            return true;
        }
    };

    match delivery {
        Delivery::BroadcastAll => {
            if kind == MessageKind::Chat {
                state.hub.save_chat(&claims.room_id, serialized.clone());
            }
            state.hub.broadcast(&claims.room_id, serialized, None);
        }
        Delivery::BroadcastOthers => {
            state
                .hub
                .broadcast(&claims.room_id, serialized, Some(connection_id.to_string()));
        }
        Delivery::Direct(target) => {
            state.hub.direct(&claims.room_id, &target, serialized);
        }
        Delivery::Discard => unreachable!(),
    }
    true
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
