//! `GET /v1/market/stream` — the client websocket endpoint
//!
//! Authentication happens before the upgrade; failures still complete
//! the handshake and then close with an application code (4401 bad or
//! missing token, 4403 origin, 4408 ping timeout) so browser clients
//! can distinguish them.
//!
//! Each connection runs three loops: receive (client control frames),
//! send (drain the hub queue), and heartbeat. All writes go through one
//! lock so frames never interleave. The first loop to finish tears the
//! other two down, then the connection is unregistered from the hub.

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::Response,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use market_stream::queue::OutboundQueue;
use market_stream::session::{parse_stream_action, StreamSession};
use serde::Deserialize;
use std::borrow::Cow;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::debug;
use types::errors::StreamErrorCode;
use types::stream::BusMessage;
use uuid::Uuid;

use crate::auth::{extract_ws_token, WsAuthError};
use crate::state::AppState;

const CLOSE_UNAUTHORIZED: u16 = 4401;
const CLOSE_ORIGIN_NOT_ALLOWED: u16 = 4403;
const CLOSE_PING_TIMEOUT: u16 = 4408;

type WsSender = Arc<tokio::sync::Mutex<SplitSink<WebSocket, Message>>>;

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub token: Option<String>,
}

pub async fn stream_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let auth = match extract_ws_token(&headers, query.token.as_deref(), &state.allowed_origins) {
        Ok(token) => state
            .verifier
            .verify(&token)
            .map_err(|_| (CLOSE_UNAUTHORIZED, "invalid token")),
        Err(WsAuthError::MissingToken) => Err((CLOSE_UNAUTHORIZED, "missing token")),
        Err(WsAuthError::OriginNotAllowed) => {
            Err((CLOSE_ORIGIN_NOT_ALLOWED, "origin not allowed"))
        }
    };

    ws.protocols(["bearer"])
        .on_upgrade(move |socket| handle_socket(socket, state, auth))
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    auth: Result<String, (u16, &'static str)>,
) {
    let (sender, receiver) = socket.split();
    let sender: WsSender = Arc::new(tokio::sync::Mutex::new(sender));

    let user_id = match auth {
        Ok(user_id) => user_id,
        Err((code, reason)) => {
            send_close(&sender, code, reason).await;
            return;
        }
    };

    let connection_id = Uuid::now_v7().to_string();
    let queue = state.hub.register_connection(&connection_id, &user_id).await;
    let allowed_symbols = state.symbols.allowed_symbols(&user_id).await;
    let session = Arc::new(Mutex::new(StreamSession::new(
        state.session_config.clone(),
        Instant::now(),
    )));
    debug!(%connection_id, %user_id, "stream connection opened");

    // Tell the client which latency mode it is in before any data.
    let initial = BusMessage::system_status(
        &state.hub.current_latency(),
        "connected",
        state.hub.current_status_message().as_deref(),
    );
    if !send_envelope(&sender, &initial).await {
        state.hub.unregister_connection(&connection_id).await;
        return;
    }

    let mut recv_task = tokio::spawn(run_receive_loop(
        receiver,
        sender.clone(),
        session.clone(),
        state.clone(),
        connection_id.clone(),
        allowed_symbols,
    ));
    let mut send_task = tokio::spawn(run_send_loop(queue, sender.clone()));
    let mut heartbeat_task = tokio::spawn(run_heartbeat_loop(sender.clone(), session.clone()));

    tokio::select! {
        _ = &mut recv_task => {}
        _ = &mut send_task => {}
        _ = &mut heartbeat_task => {}
    }
    recv_task.abort();
    send_task.abort();
    heartbeat_task.abort();
    let _ = recv_task.await;
    let _ = send_task.await;
    let _ = heartbeat_task.await;

    state.hub.unregister_connection(&connection_id).await;
    debug!(%connection_id, "stream connection closed");
}

async fn run_receive_loop(
    mut receiver: SplitStream<WebSocket>,
    sender: WsSender,
    session: Arc<Mutex<StreamSession>>,
    state: AppState,
    connection_id: String,
    allowed_symbols: BTreeSet<String>,
) {
    while let Some(frame) = receiver.next().await {
        let Ok(frame) = frame else {
            break;
        };
        match frame {
            Message::Text(text) => {
                let Some(action) = parse_stream_action(&text) else {
                    let error = BusMessage::system_error(
                        StreamErrorCode::InvalidAction.as_str(),
                        "unparseable control frame",
                    );
                    if !send_envelope(&sender, &error).await {
                        break;
                    }
                    continue;
                };

                let outcome = {
                    let mut session = session.lock().unwrap_or_else(|e| e.into_inner());
                    session.apply_action(&action, &allowed_symbols, Instant::now())
                };
                if let Some(error) = outcome.error {
                    let envelope =
                        BusMessage::system_error(error.code.as_str(), &error.message);
                    if !send_envelope(&sender, &envelope).await {
                        break;
                    }
                    continue;
                }
                if outcome.changed {
                    if let Err(error) = state
                        .hub
                        .set_connection_subscription(
                            &connection_id,
                            &outcome.symbols,
                            &outcome.channels,
                        )
                        .await
                    {
                        let envelope =
                            BusMessage::system_error(error.code.as_str(), &error.message);
                        if !send_envelope(&sender, &envelope).await {
                            break;
                        }
                    }
                }
            }
            Message::Ping(_) | Message::Pong(_) => {
                session
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .touch_client_ping(Instant::now());
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
}

async fn run_send_loop(queue: Arc<OutboundQueue>, sender: WsSender) {
    while let Some(message) = queue.recv().await {
        if !send_envelope(&sender, &message).await {
            break;
        }
    }
}

async fn run_heartbeat_loop(sender: WsSender, session: Arc<Mutex<StreamSession>>) {
    loop {
        let decision = {
            let mut session = session.lock().unwrap_or_else(|e| e.into_inner());
            session.heartbeat_decision(Instant::now())
        };
        if decision.should_close {
            send_close(&sender, CLOSE_PING_TIMEOUT, "ping timeout").await;
            return;
        }
        if decision.should_send_ping {
            if !send_envelope(&sender, &BusMessage::system_ping()).await {
                return;
            }
            session
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .mark_ping_sent(Instant::now());
        }
        tokio::time::sleep(decision.sleep).await;
    }
}

async fn send_envelope(sender: &WsSender, message: &BusMessage) -> bool {
    let Ok(text) = serde_json::to_string(message) else {
        return false;
    };
    sender
        .lock()
        .await
        .send(Message::Text(text))
        .await
        .is_ok()
}

async fn send_close(sender: &WsSender, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: Cow::Borrowed(reason),
    };
    let _ = sender.lock().await.send(Message::Close(Some(frame))).await;
}
