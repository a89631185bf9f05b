// crates/relay/src/ws.rs
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info};

use crate::protocol::ClientMessage;
use crate::state::RelayState;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<RelayState>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: RelayState) {
    let (mut sink, mut stream) = socket.split();

    let (conn_id, mut rx) = state.register();
    info!(conn_id, "client connected");

    // Frames queued for this socket (snapshot, updates) go out in order.
    let forward_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sink.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(text.as_str()) {
                Ok(ClientMessage::SubscribeToTeam(request)) => {
                    state.subscribe(conn_id, request).await;
                }
                Err(e) => debug!(conn_id, error = %e, "ignoring unrecognized frame"),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.unregister(conn_id);
    forward_task.abort();
    info!(conn_id, "client disconnected");
}
