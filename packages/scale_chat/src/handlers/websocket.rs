use axum::{
    extract::{Path, State, WebSocketUpgrade},
    response::Response,
};
use std::sync::Arc;

use crate::relay::{Relay, handle_connection};

/// `GET /ws`: the unnamed room.
pub async fn lobby_websocket_handler(
    State(relay): State<Arc<Relay>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, String::new(), relay))
}

/// `GET /ws/{room}`
pub async fn room_websocket_handler(
    State(relay): State<Arc<Relay>>,
    Path(room): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, room, relay))
}
