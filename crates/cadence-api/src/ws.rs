//! Per-account WebSocket observer channel.
//!
//! Outbound: the subscription snapshot, then every sequenced delta published
//! by the account worker. Inbound: `CommandFrame`s, answered with a
//! `command_result` addressed to this socket only. Command results are not
//! part of the broadcast order and therefore carry no sequence number.
//!
//! When the hub disconnects an observer (buffer overflow or missed
//! heartbeats) the socket is closed; the client reconnects and re-snapshots.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use cadence_core::events::{ClientCommand, CommandFrame, ServerMessage};
use cadence_scheduler::{AccountHandle, Subscription};

use crate::error::ApiError;
use crate::state::AppState;

const REPLY_BUFFER: usize = 32;

/// GET /ws/automation/{account_id} - upgrade to the observer channel.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(account_id): Path<String>,
) -> Result<Response, ApiError> {
    let handle = state.account(&account_id)?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, handle)))
}

async fn handle_socket(socket: WebSocket, handle: AccountHandle) {
    let account_id = handle.account_id().to_string();
    let Subscription {
        observer_id,
        mut receiver,
        liveness,
    } = match handle.subscribe().await {
        Ok(subscription) => subscription,
        Err(e) => {
            warn!(%account_id, error = %e, "Could not attach WebSocket observer");
            return;
        }
    };
    info!(%account_id, observer_id, "WebSocket observer connected");

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (reply_tx, mut reply_rx) = mpsc::channel::<String>(REPLY_BUFFER);

    let mut writer = tokio::spawn(async move {
        loop {
            let text = tokio::select! {
                envelope = receiver.recv() => match envelope {
                    Some(envelope) => envelope.to_json(),
                    // Hub dropped us; the client must re-snapshot.
                    None => break,
                },
                reply = reply_rx.recv() => match reply {
                    Some(text) => text,
                    None => break,
                },
            };
            if ws_sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    loop {
        let frame = tokio::select! {
            _ = &mut writer => break,
            frame = ws_receiver.next() => frame,
        };
        let message = match frame {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                debug!(%account_id, observer_id, error = %e, "WebSocket read failed");
                break;
            }
            None => break,
        };
        liveness.touch();

        let reply = match message {
            Message::Text(text) => handle_text(&handle, text.as_str()).await,
            Message::Binary(_) => Some(ServerMessage::Error {
                message: "binary frames are not supported".to_string(),
            }),
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => None,
        };

        if let Some(reply) = reply {
            let text = serde_json::to_string(&reply).unwrap_or_else(|e| {
                format!(r#"{{"type":"error","message":"serialization failed: {}"}}"#, e)
            });
            if reply_tx.send(text).await.is_err() {
                break;
            }
        }
    }

    writer.abort();
    handle.detach(observer_id).await;
    info!(%account_id, observer_id, "WebSocket observer disconnected");
}

/// Parse and apply one inbound frame. Heartbeat acks produce no reply.
async fn handle_text(handle: &AccountHandle, text: &str) -> Option<ServerMessage> {
    let frame: CommandFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            return Some(ServerMessage::Error {
                message: format!("invalid command: {}", e),
            })
        }
    };

    if frame.command == ClientCommand::HeartbeatAck {
        return None;
    }

    let request_id = frame.request_id;
    match handle.execute(frame.command).await {
        Ok(data) => Some(ServerMessage::CommandResult {
            request_id,
            ok: true,
            error: None,
            code: None,
            data,
        }),
        Err(e) => {
            debug!(account_id = handle.account_id(), error = %e, "Observer command rejected");
            let message = e.to_string();
            let code = ApiError::from(e).code();
            Some(ServerMessage::CommandResult {
                request_id,
                ok: false,
                error: Some(message),
                code: Some(code.to_string()),
                data: None,
            })
        }
    }
}
