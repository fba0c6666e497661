use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use lectern_core::types::DbId;
use tokio::sync::mpsc;

use crate::config::HubConfig;
use crate::middleware::auth::WsAuthUser;
use crate::state::AppState;
use crate::ws::connection::ClientHandle;
use crate::ws::messages::ServerMessage;
use crate::ws::session::ClientSession;

/// HTTP handler that upgrades an authenticated request to WebSocket.
///
/// `WsAuthUser` runs first, so a missing or invalid token is answered with
/// 401 and no upgrade happens.
pub async fn ws_handler(
    WsAuthUser(user): WsAuthUser,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, user.user_id))
}

/// Manage a single WebSocket connection after upgrade.
///
/// Registers with the hub, sends the handshake, then runs the write loop
/// on a spawned task and the read loop on this one. Whichever side stops
/// first closes the connection and the session is torn down.
async fn handle_socket(socket: WebSocket, state: AppState, user_id: DbId) {
    let (client, outbound) = match state.hub.connect(user_id).await {
        Ok(connection) => connection,
        Err(e) => {
            tracing::warn!(user_id, error = %e, "Rejecting WebSocket connection");
            return;
        }
    };
    let conn_id = client.conn_id();
    tracing::info!(conn_id = %conn_id, user_id, "WebSocket connected");

    state
        .hub
        .send_to(
            conn_id,
            ServerMessage::connected(state.config.server_version.clone()),
        )
        .await;

    let session = ClientSession::new(
        Arc::clone(&client),
        Arc::clone(&state.hub),
        Arc::clone(&state.queue),
        Arc::clone(&state.authorizers),
    );
    let config = state.hub.config().clone();
    let (sink, stream) = socket.split();

    let writer = tokio::spawn(write_loop(
        sink,
        outbound,
        Arc::clone(&client),
        config.clone(),
    ));

    read_loop(stream, &session, &config).await;

    session.close().await;
    if tokio::time::timeout(config.write_timeout, writer).await.is_err() {
        tracing::debug!(conn_id = %conn_id, "WebSocket writer did not stop in time");
    }
    tracing::info!(conn_id = %conn_id, "WebSocket disconnected");
}

/// Process inbound frames until the peer leaves, goes silent for longer
/// than the pong wait, or the connection is closed server-side.
async fn read_loop(mut stream: SplitStream<WebSocket>, session: &ClientSession, config: &HubConfig) {
    let client = session.client();
    let conn_id = client.conn_id();

    loop {
        let next = tokio::select! {
            _ = client.closed() => break,
            next = tokio::time::timeout(config.pong_wait, stream.next()) => next,
        };

        match next {
            Err(_) => {
                tracing::info!(conn_id = %conn_id, "WebSocket peer timed out");
                break;
            }
            Ok(None) | Ok(Some(Ok(Message::Close(_)))) => break,
            Ok(Some(Ok(Message::Text(text)))) => session.handle_text(text.as_str()).await,
            Ok(Some(Ok(Message::Pong(_)))) => {
                tracing::trace!(conn_id = %conn_id, "Pong received");
            }
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(e))) => {
                tracing::debug!(conn_id = %conn_id, error = %e, "WebSocket receive error");
                break;
            }
        }
    }
}

/// Drain the outbound queue into the socket and ping periodically.
///
/// Every write is bounded by the write timeout. On close the peer gets a
/// Close frame.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<ServerMessage>,
    client: Arc<ClientHandle>,
    config: HubConfig,
) {
    let conn_id = client.conn_id();
    let mut ping = tokio::time::interval(config.ping_interval);
    ping.tick().await;

    loop {
        let frame = tokio::select! {
            biased;
            _ = client.closed() => {
                let _ = tokio::time::timeout(config.write_timeout, sink.send(Message::Close(None))).await;
                break;
            }
            message = outbound.recv() => match message {
                Some(message) => match serde_json::to_string(&message) {
                    Ok(text) => Message::Text(text.into()),
                    Err(e) => {
                        tracing::error!(conn_id = %conn_id, error = %e, "Failed to encode WebSocket message");
                        continue;
                    }
                },
                None => break,
            },
            _ = ping.tick() => Message::Ping(Bytes::new()),
        };

        match tokio::time::timeout(config.write_timeout, sink.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(conn_id = %conn_id, error = %e, "WebSocket sink closed");
                break;
            }
            Err(_) => {
                tracing::warn!(conn_id = %conn_id, "WebSocket write timed out");
                break;
            }
        }
    }

    // Stops the read loop if the writer gave up first.
    client.close();
}
