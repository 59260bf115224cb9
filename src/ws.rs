//! WebSocket transport: frames client messages off the socket, drives one
//! `Session` per connection, and writes whatever `Session`/`DispatchCore`
//! push onto the connection's outbound channel back onto the wire.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use relay_sdk::config::Config;
use relay_sdk::session::Session;
use relay_sdk::store_trait::{EventStore, StatsStore};
use relay_sdk::subscription::ConnId;
use relay_sdk::wire::ClientMessage;
use relay_sdk::DispatchCore;
use tokio::sync::mpsc;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub dispatch: DispatchCore,
    pub events: Arc<dyn EventStore>,
    pub stats: Arc<dyn StatsStore>,
}

pub async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    let conn = ConnId::next();

    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if sink.send(Message::Text(message.to_frame())).await.is_err() {
                break;
            }
        }
    });

    let mut session = Session::new(conn);
    while let Some(Ok(message)) = stream.next().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let parsed: Result<ClientMessage, _> = serde_json::from_str(&text);
        match parsed {
            Ok(client_message) => {
                if let Err(err) = session.handle_message(
                    client_message,
                    &state.dispatch,
                    &out_tx,
                    state.events.as_ref(),
                    state.stats.as_ref(),
                ) {
                    log::warn!("dispatch error on connection {conn:?}: {err}");
                }
            }
            Err(err) => {
                let _ = out_tx.send(relay_sdk::wire::ServerMessage::notice(format!("invalid frame: {err}")));
            }
        }
    }

    state.dispatch.subscriptions().remove_all(conn);
    writer.abort();
}
