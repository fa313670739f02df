//! WebSocket live tail over a store subscription.

use crate::api::{parse_store, ApiState};
use crate::store::MessageStore;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use tracing::debug;

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<ApiState>,
    Path((store, key)): Path<(String, String)>,
) -> Response {
    let kind = match parse_store(&store) {
        Ok(kind) => kind,
        Err(response) => return response,
    };
    let store = state.coordinator.stores().get(kind);
    ws.on_upgrade(move |socket| handle_connection(socket, store, key))
        .into_response()
}

async fn handle_connection(mut socket: WebSocket, store: Arc<dyn MessageStore>, key: String) {
    let subscriber_id = uuid::Uuid::new_v4().to_string();
    let mut queue = store.sub_chan(&key, &subscriber_id);
    debug!(store = %store.kind(), key = %key, subscriber_id = %subscriber_id, "Tail opened");

    loop {
        tokio::select! {
            envelope = queue.recv() => match envelope {
                Some(envelope) => {
                    if socket.send(Message::Text(envelope.render())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    store.release_sub_chan(&key, &subscriber_id);
    debug!(key = %key, subscriber_id = %subscriber_id, "Tail closed");
}
