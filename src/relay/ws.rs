use axum::{
    debug_handler,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message as WsMessage, WebSocket},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, warn};

use super::{ClientEvent, ConnectionId, RelayHandle};

/// Lifecycle of one websocket as seen by the listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Joined(String),
    Closed,
}

impl ConnectionState {
    /// Most recent join wins. A closed connection stays closed.
    pub fn join(&mut self, user_id: &str) {
        if *self != ConnectionState::Closed && !user_id.is_empty() {
            *self = ConnectionState::Joined(user_id.to_owned());
        }
    }

    pub fn close(&mut self) {
        *self = ConnectionState::Closed;
    }

    pub fn is_joined(&self) -> bool {
        matches!(self, ConnectionState::Joined(_))
    }

    pub fn user_id(&self) -> Option<&str> {
        match self {
            ConnectionState::Joined(user_id) => Some(user_id),
            _ => None,
        }
    }
}

#[debug_handler(state = crate::AppState)]
pub async fn relay_ws(
    State(relay): State<RelayHandle>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_connection(socket, relay))
}

async fn serve_connection(socket: WebSocket, relay: RelayHandle) {
    let Some((connection, mut events)) = relay.open().await else {
        warn!("relay is not running, refusing connection");
        return;
    };

    let (mut sender, mut receiver) = socket.split();

    let mut writer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(err) => {
                    warn!(%connection, error = %err, "could not encode outbound event");
                    continue;
                }
            };
            if sender.send(WsMessage::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let mut state = ConnectionState::Connected;
    loop {
        tokio::select! {
            frame = receiver.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => dispatch(&relay, connection, &mut state, text.as_str().as_bytes()).await,
                Some(Ok(WsMessage::Binary(data))) => dispatch(&relay, connection, &mut state, &data).await,
                Some(Ok(WsMessage::Close(_))) | None => break,
                // ping/pong is answered by axum
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(%connection, error = %err, "transport error");
                    break;
                }
            },
            _ = &mut writer => {
                debug!(%connection, "writer stopped");
                break;
            }
        }
    }

    debug!(%connection, user_id = ?state.user_id(), "closing");
    state.close();
    relay.disconnect(connection).await;
    writer.abort();
}

async fn dispatch(relay: &RelayHandle, connection: ConnectionId, state: &mut ConnectionState, frame: &[u8]) {
    match ClientEvent::parse(frame) {
        Ok(ClientEvent::Join(user_id)) => {
            state.join(&user_id);
            relay.join(connection, user_id).await;
        }
        Ok(ClientEvent::Message(payload)) => {
            if !state.is_joined() {
                warn!(%connection, sender_id = ?payload.sender_id, "message before join");
            }
            relay.message(connection, payload).await;
        }
        Err(err) => warn!(%connection, error = %err, "dropping malformed frame"),
    }
}
