// =============================================================================
// Telemetry WebSocket — channel subscriptions over JSON frames
// =============================================================================
//
// Wire protocol:
//   client -> server: {"action": "subscribe"|"unsubscribe",
//                      "channels": [...], "replay"?: bool}
//   server -> client: {"type": "welcome"|"event"|"heartbeat",
//                      "channel"?, "data"?, "replay"?}
//
// Auth: shared key via the `X-API-Key` header or the `apiKey` query
// parameter, checked before the upgrade. A write that makes no progress for
// 15 s closes the connection with a policy-violation reason, as does an
// admin disconnect.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::api::auth::{validate_key, API_KEY_HEADER};
use crate::app_state::AppState;
use crate::telemetry::{
    BusMessage, Subscriber, TelemetryChannel, TelemetryEvent, HEARTBEAT_INTERVAL_SECS,
};

/// A send that cannot complete within this window is a protocol violation.
const WRITE_STALL_TIMEOUT: Duration = Duration::from_secs(HEARTBEAT_INTERVAL_SECS);
/// WebSocket close code for policy violations.
const CLOSE_POLICY_VIOLATION: u16 = 1008;

// =============================================================================
// Frames
// =============================================================================

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ServerFrame {
    Welcome {
        connection_id: u64,
        channels: Vec<&'static str>,
    },
    Event {
        channel: TelemetryChannel,
        data: TelemetryEvent,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        replay: bool,
    },
    Heartbeat {
        timestamp: i64,
    },
}

#[derive(Debug, Deserialize)]
struct ClientCommand {
    action: String,
    #[serde(default)]
    channels: Vec<String>,
    #[serde(default)]
    replay: bool,
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(rename = "apiKey")]
    api_key: Option<String>,
}

// =============================================================================
// Upgrade handler
// =============================================================================

/// Validates the shared key (header or query) before upgrading.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let header_key = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let presented = header_key.or(query.api_key);

    if !validate_key(presented.as_deref()) {
        warn!("WebSocket connection rejected: invalid API key");
        return (
            axum::http::StatusCode::UNAUTHORIZED,
            "Invalid or missing API key",
        )
            .into_response();
    }

    ws.on_upgrade(move |socket| handle_connection(socket, state))
        .into_response()
}

// =============================================================================
// Connection loop
// =============================================================================

async fn handle_connection(socket: WebSocket, state: Arc<AppState>) {
    let subscriber = state.bus.register("ws-client");
    let connection_id = subscriber.id();
    info!(connection_id, "telemetry client connected");

    let (mut sender, mut receiver) = socket.split();

    // Welcome frame with the available channel set.
    let welcome = ServerFrame::Welcome {
        connection_id,
        channels: TelemetryChannel::ALL
            .iter()
            .map(TelemetryChannel::as_str)
            .collect(),
    };
    if send_frame(&mut sender, &subscriber, &welcome).await.is_err() {
        state.bus.unregister(connection_id);
        return;
    }

    loop {
        tokio::select! {
            // ── Outbound: drain the bus queue ───────────────────────────
            message = subscriber.next_message() => {
                match message {
                    Some(BusMessage::Event { channel, replay, event }) => {
                        let frame = ServerFrame::Event { channel, data: event, replay };
                        if send_frame(&mut sender, &subscriber, &frame).await.is_err() {
                            break;
                        }
                    }
                    Some(BusMessage::Heartbeat { timestamp }) => {
                        let frame = ServerFrame::Heartbeat { timestamp };
                        if send_frame(&mut sender, &subscriber, &frame).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        // Closed by admin or violation: tell the client why.
                        let reason = subscriber
                            .close_reason()
                            .unwrap_or_else(|| "connection closed".to_string());
                        let _ = sender
                            .send(Message::Close(Some(CloseFrame {
                                code: CLOSE_POLICY_VIOLATION,
                                reason: reason.into(),
                            })))
                            .await;
                        break;
                    }
                }
            }

            // ── Inbound: subscription commands ──────────────────────────
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_command(&state, &subscriber, &text);
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if sender.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Binary(_))) => {}
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(connection_id, "client closed the connection");
                        break;
                    }
                    Some(Err(e)) => {
                        debug!(connection_id, error = %e, "receive error");
                        break;
                    }
                }
            }
        }
    }

    state.bus.unregister(connection_id);
    info!(connection_id, "telemetry client disconnected");
}

/// Apply a subscribe/unsubscribe command. Mutations are visible to the next
/// event dispatch; `replay=true` queues snapshots ahead of live events.
fn handle_command(state: &Arc<AppState>, subscriber: &Subscriber, text: &str) {
    let command: ClientCommand = match serde_json::from_str(text) {
        Ok(command) => command,
        Err(e) => {
            debug!(error = %e, "ignoring malformed client command");
            return;
        }
    };

    let channels: Vec<TelemetryChannel> = command
        .channels
        .iter()
        .filter_map(|name| match name.parse() {
            Ok(channel) => Some(channel),
            Err(_) => {
                debug!(channel = %name, "unknown channel in command");
                None
            }
        })
        .collect();

    match command.action.as_str() {
        "subscribe" => {
            subscriber.subscribe(&channels);
            if command.replay {
                state.bus.replay(subscriber, &channels);
            }
            debug!(
                connection_id = subscriber.id(),
                channels = ?channels,
                replay = command.replay,
                "channels subscribed"
            );
        }
        "unsubscribe" => {
            subscriber.unsubscribe(&channels);
            debug!(
                connection_id = subscriber.id(),
                channels = ?channels,
                "channels unsubscribed"
            );
        }
        other => debug!(action = %other, "unknown client action"),
    }
}

/// Serialise and send one frame with stall detection: no write progress for
/// 15 s closes the connection with a violation reason.
async fn send_frame<S>(
    sender: &mut S,
    subscriber: &Subscriber,
    frame: &ServerFrame,
) -> Result<(), ()>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    let json = match serde_json::to_string(frame) {
        Ok(json) => json,
        Err(e) => {
            warn!(error = %e, "frame serialisation failed");
            return Ok(()); // not a transport failure
        }
    };

    match tokio::time::timeout(WRITE_STALL_TIMEOUT, sender.send(Message::Text(json))).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            debug!(connection_id = subscriber.id(), error = %e, "send failed");
            Err(())
        }
        Err(_) => {
            warn!(
                connection_id = subscriber.id(),
                "no write progress for {}s — closing connection", WRITE_STALL_TIMEOUT.as_secs()
            );
            subscriber.close(format!(
                "no write progress for {} s",
                WRITE_STALL_TIMEOUT.as_secs()
            ));
            Err(())
        }
    }
}
