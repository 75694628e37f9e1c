use std::collections::HashSet;

use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

use crate::store::Message;

use super::{
    engine::{RelayCommand, RelayEngine},
    error::RelayError,
    event::{ChatPayload, ServerEvent},
    registry::ConnectionId,
};

/// Cloneable entry point into the relay task. Once the relay has stopped,
/// the fire-and-forget methods return `false` and the rest return `None`.
#[derive(Clone)]
pub struct RelayHandle {
    commands: mpsc::Sender<RelayCommand>,
    send_queue: usize,
}

impl RelayHandle {
    /// Starts the relay task. It runs until the last handle is dropped.
    pub fn spawn(engine: RelayEngine, queue: usize, send_queue: usize) -> (RelayHandle, JoinHandle<()>) {
        let (commands, rx) = mpsc::channel(queue);
        let task = tokio::spawn(engine.run(rx));
        (RelayHandle { commands, send_queue }, task)
    }

    /// Registers a new connection and hands back the stream of events to write to it.
    pub async fn open(&self) -> Option<(ConnectionId, mpsc::Receiver<ServerEvent>)> {
        let connection = ConnectionId::new();
        let (outbox, events) = mpsc::channel(self.send_queue);

        self.send(RelayCommand::Connect { connection, outbox })
            .await
            .then_some((connection, events))
    }

    pub async fn join(&self, connection: ConnectionId, user_id: String) -> bool {
        self.send(RelayCommand::Join { connection, user_id }).await
    }

    pub async fn message(&self, connection: ConnectionId, payload: ChatPayload) -> bool {
        self.send(RelayCommand::Message { connection, payload }).await
    }

    pub async fn disconnect(&self, connection: ConnectionId) -> bool {
        self.send(RelayCommand::Disconnect { connection }).await
    }

    /// Persists and relays a message that did not arrive over a websocket,
    /// waiting for the outcome.
    pub async fn submit(&self, payload: ChatPayload) -> Option<Result<Message, RelayError>> {
        let (reply, outcome) = oneshot::channel();
        if !self.send(RelayCommand::Submit { payload, reply }).await {
            return None;
        }
        outcome.await.ok()
    }

    /// Connections currently bound to `user_id`.
    pub async fn connections_for(&self, user_id: &str) -> Option<HashSet<ConnectionId>> {
        let (reply, connections) = oneshot::channel();
        let user_id = user_id.to_owned();
        if !self.send(RelayCommand::Connections { user_id, reply }).await {
            return None;
        }
        connections.await.ok()
    }

    async fn send(&self, command: RelayCommand) -> bool {
        self.commands.send(command).await.is_ok()
    }
}
