use std::{sync::Arc, time::Duration};

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{HeaderMap, Uri},
    response::IntoResponse,
    routing::get,
    Router,
};
use murmur_common::protocol::ws::{ClientEvent, SendMessageErrorCode, ServerEvent};
use serde::Deserialize;
use tokio::{sync::mpsc, time::Instant};
use tracing::{debug, info, warn};

use super::{
    authorizer::{handshake_token, Authorization, ConnectionAuthorizer, RejectReason},
    controller::{RoomSession, RoomSessionController},
    protocol as ws_protocol,
};
use crate::error::{request_id_from_headers_or_generate, with_request_id_scope};

pub(crate) const HEARTBEAT_INTERVAL_MS: u64 = 15_000;
pub(crate) const HEARTBEAT_TIMEOUT_MS: u64 = 10_000;
pub(crate) const MAX_FRAME_BYTES: usize = 65_536;

#[derive(Clone)]
pub struct ChatSocketState {
    pub authorizer: Arc<ConnectionAuthorizer>,
    pub controller: RoomSessionController,
}

#[derive(Debug, Default, Deserialize)]
struct HandshakeQuery {
    token: Option<String>,
}

pub fn router(state: ChatSocketState) -> Router {
    Router::new().route("/chat", get(ws_upgrade)).with_state(state)
}

async fn ws_upgrade(
    State(state): State<ChatSocketState>,
    uri: Uri,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    // An undecodable query string is treated like a missing token.
    let query_token =
        Query::<HandshakeQuery>::try_from_uri(&uri).ok().and_then(|Query(query)| query.token);
    let token = handshake_token(query_token.as_deref(), &headers);
    let request_id = request_id_from_headers_or_generate(&headers);

    ws.max_frame_size(MAX_FRAME_BYTES).max_message_size(MAX_FRAME_BYTES).on_upgrade(
        move |socket| async move {
            with_request_id_scope(request_id, handle_socket(state, token, socket)).await;
        },
    )
}

async fn handle_socket(state: ChatSocketState, token: Option<String>, mut socket: WebSocket) {
    let binding = match state.authorizer.authorize(token.as_deref()).await {
        Authorization::Authorized(binding) => binding,
        Authorization::Rejected(reason) => {
            reject(&mut socket, reason).await;
            return;
        }
    };

    let (outbound_sender, mut outbound_receiver) = mpsc::unbounded_channel::<ServerEvent>();
    let mut session = RoomSession::new(binding);
    let connection_success = match state.controller.open(&mut session, outbound_sender).await {
        Ok(event) => event,
        Err(reason) => {
            reject(&mut socket, reason).await;
            return;
        }
    };

    if ws_protocol::send_event(&mut socket, &connection_success).await.is_ok() {
        info!(
            connection_id = %binding.connection_id,
            user_id = %binding.user_id,
            room_id = %binding.room_id,
            "chat connection opened"
        );
        serve_session(&state.controller, &session, &mut socket, &mut outbound_receiver).await;
    }

    state.controller.close(&mut session).await;
    info!(connection_id = %binding.connection_id, room_id = %binding.room_id, "chat connection closed");
}

async fn serve_session(
    controller: &RoomSessionController,
    session: &RoomSession,
    socket: &mut WebSocket,
    outbound_receiver: &mut mpsc::UnboundedReceiver<ServerEvent>,
) {
    let connection_id = session.binding().connection_id;

    // Server pings every HEARTBEAT_INTERVAL_MS and drops the connection when
    // a ping stays unanswered for HEARTBEAT_TIMEOUT_MS.
    let mut heartbeat_interval =
        tokio::time::interval(Duration::from_millis(HEARTBEAT_INTERVAL_MS));
    heartbeat_interval.reset();
    let mut pong_deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = heartbeat_interval.tick() => {
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                pong_deadline.get_or_insert_with(|| {
                    Instant::now() + Duration::from_millis(HEARTBEAT_TIMEOUT_MS)
                });
            }
            _ = wait_for_deadline(pong_deadline) => {
                warn!(connection_id = %connection_id, "heartbeat timeout, disconnecting");
                break;
            }
            maybe_outbound = outbound_receiver.recv() => {
                let Some(event) = maybe_outbound else {
                    break;
                };
                if ws_protocol::send_event(socket, &event).await.is_err() {
                    break;
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break;
                };

                match message {
                    Ok(Message::Text(raw_message)) => {
                        if raw_message.len() > MAX_FRAME_BYTES {
                            close_frame_too_large(socket).await;
                            break;
                        }

                        let outcome = match ws_protocol::decode_client_event(raw_message.as_str()) {
                            Ok(ClientEvent::SendMessage(payload)) => {
                                controller.send_message(session, &payload).await
                            }
                            Err(error) => {
                                debug!(connection_id = %connection_id, %error, "undecodable chat frame");
                                Err(SendMessageErrorCode::InvalidMessage)
                            }
                        };

                        if let Err(code) = outcome {
                            let reply = ServerEvent::SendMessageError { message: code };
                            if ws_protocol::send_event(socket, &reply).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Message::Binary(_)) => {
                        let reply = ServerEvent::SendMessageError {
                            message: SendMessageErrorCode::InvalidMessage,
                        };
                        if ws_protocol::send_event(socket, &reply).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        pong_deadline = None;
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(error) => {
                        if is_frame_size_violation(&error) {
                            close_frame_too_large(socket).await;
                        }
                        break;
                    }
                }
            }
        }
    }
}

async fn wait_for_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn reject(socket: &mut WebSocket, reason: RejectReason) {
    debug!(?reason, "rejecting chat connection");
    let code = reason.code();
    let _ = ws_protocol::send_event(socket, &ServerEvent::ConnectionError { message: code }).await;
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: code.as_str().to_owned().into(),
        })))
        .await;
}

fn is_frame_size_violation(error: &axum::Error) -> bool {
    let message = error.to_string().to_ascii_lowercase();
    message.contains("message too long")
        || message.contains("frame too long")
        || message.contains("too large")
        || message.contains("too big")
        || message.contains("size limit")
}

async fn close_frame_too_large(socket: &mut WebSocket) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::SIZE,
            reason: format!("websocket frame exceeds maximum size of {MAX_FRAME_BYTES} bytes")
                .into(),
        })))
        .await;
}
