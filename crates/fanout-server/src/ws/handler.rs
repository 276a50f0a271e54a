use axum::{
    extract::{State, WebSocketUpgrade, ws::WebSocket},
    response::Response,
};
use futures_util::StreamExt;

use crate::relay::{SignalChannel, session};
use crate::state::AppState;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (sink, stream) = socket.split();
    let channel = SignalChannel::new(sink);

    let (id, pc, events) = match state.relay.join(channel.clone()).await {
        Ok(joined) => joined,
        Err(e) => {
            tracing::error!("failed to set up relay session: {e}");
            return;
        }
    };

    session::run(state.relay, id, pc, channel, stream, events).await;
}
