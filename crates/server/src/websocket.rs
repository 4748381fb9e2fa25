//! WebSocket handling
//!
//! One connection may watch several projects. Each subscribe performs a
//! catch-up read before attaching to the live channel, and the ack carries
//! that batch so the client can merge push and history by event id.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use driftbox_protocol::{ClientMessage, ServerMessage};

use crate::persistence;
use crate::routes::trigger_build;
use crate::state::AppContext;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Catch-up window when the client sends no cursor.
const DEFAULT_CATCH_UP_MINUTES: i64 = 15;
const CATCH_UP_LIMIT: usize = 500;

/// Messages that can be sent through the WebSocket
enum OutboundMessage {
    Json(ServerMessage),
    Pong(Bytes),
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(ctx): State<Arc<AppContext>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, ctx))
}

/// Handle a WebSocket connection
async fn handle_socket(socket: WebSocket, ctx: Arc<AppContext>) {
    let conn_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    info!(
        component = "websocket",
        event = "ws.connection.opened",
        connection_id = conn_id,
        "WebSocket connection opened"
    );

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Channel carrying both direct replies and broadcast fan-out.
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundMessage>(256);

    let send_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let result = match msg {
                OutboundMessage::Json(server_msg) => match serde_json::to_string(&server_msg) {
                    Ok(json) => ws_tx.send(Message::Text(json.into())).await,
                    Err(e) => {
                        error!(
                            component = "websocket",
                            event = "ws.send.serialize_failed",
                            connection_id = conn_id,
                            error = %e,
                            "Failed to serialize server message"
                        );
                        continue;
                    }
                },
                OutboundMessage::Pong(data) => ws_tx.send(Message::Pong(data)).await,
            };

            if result.is_err() {
                debug!(
                    component = "websocket",
                    event = "ws.send.disconnected",
                    connection_id = conn_id,
                    "WebSocket send failed, client disconnected"
                );
                break;
            }
        }
    });

    // Broadcast deliveries ride a ServerMessage channel that a forwarder
    // drains into the outbound pump.
    let (broadcast_tx, mut broadcast_rx) = mpsc::channel::<ServerMessage>(256);
    let forwarder_outbound = outbound_tx.clone();
    let forward_task = tokio::spawn(async move {
        while let Some(msg) = broadcast_rx.recv().await {
            if forwarder_outbound
                .send(OutboundMessage::Json(msg))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    // Projects this connection subscribed to, for teardown.
    let mut subscriptions: Vec<String> = Vec::new();

    while let Some(result) = ws_rx.next().await {
        let msg = match result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Ping(data)) => {
                let _ = outbound_tx.send(OutboundMessage::Pong(data)).await;
                continue;
            }
            Ok(Message::Close(_)) => {
                info!(
                    component = "websocket",
                    event = "ws.connection.close_frame",
                    connection_id = conn_id,
                    "Client sent close frame"
                );
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(
                    component = "websocket",
                    event = "ws.connection.error",
                    connection_id = conn_id,
                    error = %e,
                    "WebSocket error"
                );
                break;
            }
        };

        let client_msg: ClientMessage = match serde_json::from_str(&msg) {
            Ok(m) => m,
            Err(e) => {
                warn!(
                    component = "websocket",
                    event = "ws.message.parse_failed",
                    connection_id = conn_id,
                    error = %e,
                    payload_bytes = msg.len(),
                    "Failed to parse client message"
                );
                send_json(
                    &outbound_tx,
                    ServerMessage::Error {
                        code: "parse_error".into(),
                        message: "Malformed client message".into(),
                        project_id: None,
                    },
                )
                .await;
                continue;
            }
        };

        handle_client_message(
            client_msg,
            &outbound_tx,
            &broadcast_tx,
            &ctx,
            &mut subscriptions,
            conn_id,
        )
        .await;
    }

    for project_id in &subscriptions {
        ctx.registry.unsubscribe(project_id, &broadcast_tx);
    }

    info!(
        component = "websocket",
        event = "ws.connection.closed",
        connection_id = conn_id,
        subscriptions = subscriptions.len(),
        "WebSocket connection closed"
    );
    send_task.abort();
    forward_task.abort();
}

async fn send_json(tx: &mpsc::Sender<OutboundMessage>, msg: ServerMessage) {
    let _ = tx.send(OutboundMessage::Json(msg)).await;
}

async fn handle_client_message(
    msg: ClientMessage,
    outbound_tx: &mpsc::Sender<OutboundMessage>,
    broadcast_tx: &mpsc::Sender<ServerMessage>,
    ctx: &Arc<AppContext>,
    subscriptions: &mut Vec<String>,
    conn_id: u64,
) {
    match msg {
        ClientMessage::Subscribe { project_id, since } => {
            let cursor = since
                .unwrap_or_else(|| Utc::now() - ChronoDuration::minutes(DEFAULT_CATCH_UP_MINUTES));

            // Attach to the live channel first so nothing falls between the
            // catch-up read and the first push; the client dedups overlap.
            if !subscriptions.contains(&project_id) {
                ctx.registry.subscribe(&project_id, broadcast_tx.clone());
                subscriptions.push(project_id.clone());
            }

            let events = match persistence::select_events_since(
                ctx.registry.db_path(),
                &project_id,
                Some(cursor),
                CATCH_UP_LIMIT,
            )
            .await
            {
                Ok(events) => events,
                Err(e) => {
                    warn!(
                        component = "websocket",
                        event = "ws.catch_up.failed",
                        connection_id = conn_id,
                        project_id = %project_id,
                        error = %e,
                        "Catch-up read failed"
                    );
                    Vec::new()
                }
            };

            debug!(
                component = "websocket",
                event = "ws.subscribed",
                connection_id = conn_id,
                project_id = %project_id,
                catch_up_events = events.len(),
                "Subscribed to project"
            );

            send_json(
                outbound_tx,
                ServerMessage::Subscribed { project_id, events },
            )
            .await;
        }

        ClientMessage::Unsubscribe { project_id } => {
            subscriptions.retain(|p| p != &project_id);
            ctx.registry.unsubscribe(&project_id, broadcast_tx);
            send_json(outbound_tx, ServerMessage::Unsubscribed { project_id }).await;
        }

        ClientMessage::StartBuild {
            project_id,
            prompt,
            resume_session_id,
        } => {
            // Auth is terminated at the gateway; over the socket we only
            // know the connection.
            let user = format!("ws-{}", conn_id);
            if let Err(e) = trigger_build(
                ctx,
                &project_id,
                &user,
                &prompt,
                resume_session_id.as_deref(),
            )
            .await
            {
                send_json(
                    outbound_tx,
                    ServerMessage::Error {
                        code: "build_failed".into(),
                        message: e.message,
                        project_id: Some(project_id),
                    },
                )
                .await;
            }
        }

        ClientMessage::StopAgent { project_id } => {
            let _ = ctx.executor.stop(&project_id).await;
        }

        ClientMessage::StopSandbox { project_id } => {
            let _ = ctx.executor.stop(&project_id).await;
            let record = persistence::load_sandbox(ctx.registry.db_path(), &project_id)
                .await
                .ok()
                .flatten();
            let status = record
                .as_ref()
                .map(|r| r.status)
                .unwrap_or(driftbox_protocol::SandboxStatus::Idle);
            ctx.registry.abort_health_task(&project_id);
            if let Err(e) = ctx
                .controller
                .stop(
                    &project_id,
                    record.and_then(|r| r.sandbox_id).as_deref(),
                    status,
                )
                .await
            {
                send_json(
                    outbound_tx,
                    ServerMessage::Error {
                        code: "stop_failed".into(),
                        message: "Could not stop the sandbox".into(),
                        project_id: Some(project_id),
                    },
                )
                .await;
                warn!(
                    component = "websocket",
                    event = "ws.stop_sandbox.failed",
                    connection_id = conn_id,
                    error = %e,
                    "Sandbox stop failed"
                );
            }
        }

        ClientMessage::CheckHealth {
            project_id,
            auto_restart,
        } => {
            let report = ctx.monitor.check(&project_id, auto_restart).await;
            send_json(
                outbound_tx,
                ServerMessage::HealthChanged { project_id, report },
            )
            .await;
        }
    }
}
