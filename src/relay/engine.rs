use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use tokio::sync::{
    mpsc::{self, error::TrySendError},
    oneshot,
};
use tracing::{debug, error, info, warn};

use crate::store::{Message, MessageStore, PersistenceError};

use super::{
    error::{RelayError, ValidationError},
    event::{ChatPayload, ServerEvent},
    registry::{ConnectionId, ConnectionRegistry},
};

/// How a persisted message reaches its recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPolicy {
    /// One push to each connection bound at the moment the message is stored.
    /// Failed inserts and pushes into a full outbox are never retried;
    /// offline recipients catch up through history.
    AtMostOnce,
}

pub const DELIVERY_POLICY: DeliveryPolicy = DeliveryPolicy::AtMostOnce;

/// One inbound transport event, as queued for the relay task.
#[derive(Debug)]
pub enum RelayCommand {
    Connect {
        connection: ConnectionId,
        outbox: mpsc::Sender<ServerEvent>,
    },
    Join {
        connection: ConnectionId,
        user_id: String,
    },
    Message {
        connection: ConnectionId,
        payload: ChatPayload,
    },
    Disconnect {
        connection: ConnectionId,
    },
    /// A message created outside any websocket, e.g. over REST.
    Submit {
        payload: ChatPayload,
        reply: oneshot::Sender<Result<Message, RelayError>>,
    },
    Connections {
        user_id: String,
        reply: oneshot::Sender<HashSet<ConnectionId>>,
    },
}

/// Persists chat messages and fans them out to the recipient's connections.
///
/// The engine is driven by a single task (see [`RelayEngine::run`]); every
/// command is handled to completion before the next one is taken, so the
/// registry is mutated by exactly one handler at a time.
pub struct RelayEngine {
    store: Arc<dyn MessageStore>,
    registry: ConnectionRegistry,
    outboxes: HashMap<ConnectionId, mpsc::Sender<ServerEvent>>,
    persist_timeout: Duration,
}

impl RelayEngine {
    pub fn new(store: Arc<dyn MessageStore>, persist_timeout: Duration) -> Self {
        Self {
            store,
            registry: ConnectionRegistry::new(),
            outboxes: HashMap::new(),
            persist_timeout,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn on_connect(&mut self, connection: ConnectionId, outbox: mpsc::Sender<ServerEvent>) {
        self.outboxes.insert(connection, outbox);
        info!(%connection, "connection opened");
    }

    pub fn on_join(&mut self, connection: ConnectionId, user_id: &str) -> Result<(), RelayError> {
        if user_id.is_empty() {
            return Err(self.reject(connection, ValidationError::MissingUser.into()));
        }

        match self.registry.bind(connection, user_id) {
            Some(previous) => info!(%connection, user_id, %previous, "connection rejoined"),
            None => info!(%connection, user_id, "connection joined"),
        }
        Ok(())
    }

    /// Stores the message, then pushes it to every live connection of the
    /// receiver. Nothing is pushed unless the insert succeeded; failures are
    /// reported to `connection` alone.
    pub async fn on_message(&mut self, connection: ConnectionId, payload: ChatPayload) -> Result<Message, RelayError> {
        match self.persist(payload, self.registry.user_of(connection)).await {
            Ok(message) => {
                self.fan_out(&message);
                Ok(message)
            }
            Err(err) => Err(self.reject(connection, err)),
        }
    }

    /// Same pipeline as [`on_message`](Self::on_message) without an
    /// originating connection: the payload must name its sender, and
    /// failures go back to the caller only.
    pub async fn on_submit(&mut self, payload: ChatPayload) -> Result<Message, RelayError> {
        let message = self
            .persist(payload, None)
            .await
            .inspect_err(|err| warn!(code = err.code(), reason = %err, "submitted message dropped"))?;
        self.fan_out(&message);
        Ok(message)
    }

    pub fn on_disconnect(&mut self, connection: ConnectionId) {
        self.outboxes.remove(&connection);
        match self.registry.unbind(connection) {
            Some(user_id) => info!(%connection, %user_id, "connection closed"),
            None => info!(%connection, "connection closed before joining"),
        }
    }

    pub async fn handle(&mut self, command: RelayCommand) {
        match command {
            RelayCommand::Connect { connection, outbox } => self.on_connect(connection, outbox),
            RelayCommand::Join { connection, user_id } => {
                let _ = self.on_join(connection, &user_id);
            }
            RelayCommand::Message { connection, payload } => {
                let _ = self.on_message(connection, payload).await;
            }
            RelayCommand::Disconnect { connection } => self.on_disconnect(connection),
            RelayCommand::Submit { payload, reply } => {
                let _ = reply.send(self.on_submit(payload).await);
            }
            RelayCommand::Connections { user_id, reply } => {
                let _ = reply.send(self.registry.connections_for(&user_id));
            }
        }
    }

    /// Consumes commands until every sender is gone.
    pub async fn run(mut self, mut commands: mpsc::Receiver<RelayCommand>) {
        while let Some(command) = commands.recv().await {
            self.handle(command).await;
        }
        info!(connections = self.registry.len(), "relay stopped");
    }

    async fn persist(&self, payload: ChatPayload, joined_as: Option<&str>) -> Result<Message, RelayError> {
        let (sender_id, receiver_id, content) = validate(payload, joined_as)?;

        let message = tokio::time::timeout(
            self.persist_timeout,
            self.store.create_message(&sender_id, &receiver_id, &content),
        )
        .await
        .map_err(|_| PersistenceError::TimedOut(self.persist_timeout))??;

        Ok(message)
    }

    fn fan_out(&self, message: &Message) {
        let recipients = self.registry.connections_for(&message.receiver_id);
        let delivered = recipients
            .iter()
            .filter(|connection| self.push(**connection, ServerEvent::Message(message.clone())))
            .count();

        debug!(
            message_id = %message.id,
            receiver_id = %message.receiver_id,
            recipients = recipients.len(),
            delivered,
            "message relayed"
        );
    }

    fn reject(&self, connection: ConnectionId, err: RelayError) -> RelayError {
        match &err {
            RelayError::Validation(reason) => warn!(%connection, %reason, "dropping event"),
            RelayError::Persistence(reason) => error!(%connection, %reason, "message not persisted, nothing relayed"),
        }
        self.push(connection, ServerEvent::from(&err));
        err
    }

    fn push(&self, connection: ConnectionId, event: ServerEvent) -> bool {
        let Some(outbox) = self.outboxes.get(&connection) else {
            return false;
        };

        match outbox.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(%connection, "outbox full, dropping event");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// Resolves `(sender, receiver, content)`. An absent sender falls back to the
/// identity the connection joined as.
fn validate(
    ChatPayload { sender_id, receiver_id, content }: ChatPayload,
    joined_as: Option<&str>,
) -> Result<(String, String, String), ValidationError> {
    let receiver_id = receiver_id
        .filter(|id| !id.is_empty())
        .ok_or(ValidationError::MissingReceiver)?;
    let content = content
        .filter(|text| !text.is_empty())
        .ok_or(ValidationError::EmptyContent)?;
    let sender_id = sender_id
        .filter(|id| !id.is_empty())
        .or_else(|| joined_as.map(str::to_owned))
        .ok_or(ValidationError::MissingSender)?;

    Ok((sender_id, receiver_id, content))
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    };

    use async_trait::async_trait;
    use time::OffsetDateTime;
    use uuid::Uuid;

    use super::*;

    #[derive(Default)]
    struct FakeStore {
        saved: Mutex<Vec<Message>>,
        calls: AtomicUsize,
        failing: AtomicBool,
        delay: Option<Duration>,
    }

    impl FakeStore {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn saved(&self) -> Vec<Message> {
            self.saved.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MessageStore for FakeStore {
        async fn create_message(
            &self,
            sender_id: &str,
            receiver_id: &str,
            content: &str,
        ) -> Result<Message, PersistenceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(PersistenceError::Database(sqlx::Error::PoolClosed));
            }

            let message = Message {
                id: Uuid::now_v7(),
                sender_id: sender_id.to_owned(),
                receiver_id: receiver_id.to_owned(),
                content: content.to_owned(),
                created_at: OffsetDateTime::now_utc(),
            };
            self.saved.lock().unwrap().push(message.clone());
            Ok(message)
        }

        async fn list_for_participant(&self, user_id: &str) -> Result<Vec<Message>, PersistenceError> {
            Ok(self
                .saved()
                .into_iter()
                .filter(|m| m.sender_id == user_id || m.receiver_id == user_id)
                .collect())
        }
    }

    fn engine(store: &Arc<FakeStore>) -> RelayEngine {
        RelayEngine::new(store.clone(), Duration::from_secs(1))
    }

    fn connect(engine: &mut RelayEngine, user_id: Option<&str>) -> (ConnectionId, mpsc::Receiver<ServerEvent>) {
        let connection = ConnectionId::new();
        let (outbox, rx) = mpsc::channel(8);
        engine.on_connect(connection, outbox);
        if let Some(user_id) = user_id {
            engine.on_join(connection, user_id).unwrap();
        }
        (connection, rx)
    }

    fn payload(sender_id: Option<&str>, receiver_id: Option<&str>, content: Option<&str>) -> ChatPayload {
        ChatPayload {
            sender_id: sender_id.map(Into::into),
            receiver_id: receiver_id.map(Into::into),
            content: content.map(Into::into),
        }
    }

    fn drain(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn error_code(event: &ServerEvent) -> &'static str {
        match event {
            ServerEvent::Error(payload) => payload.code,
            other => panic!("expected an error event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn fans_out_to_every_recipient_tab() {
        let store = Arc::new(FakeStore::default());
        let mut engine = engine(&store);
        let (a, mut a_rx) = connect(&mut engine, Some("A"));
        let (_, mut b1_rx) = connect(&mut engine, Some("B"));
        let (_, mut b2_rx) = connect(&mut engine, Some("B"));

        let message = engine
            .on_message(a, payload(Some("A"), Some("B"), Some("hi")))
            .await
            .unwrap();

        assert_eq!(store.saved(), vec![message.clone()]);
        assert_eq!((message.sender_id.as_str(), message.receiver_id.as_str()), ("A", "B"));
        assert_eq!(drain(&mut b1_rx), vec![ServerEvent::Message(message.clone())]);
        assert_eq!(drain(&mut b2_rx), vec![ServerEvent::Message(message)]);
        assert!(drain(&mut a_rx).is_empty());
    }

    #[tokio::test]
    async fn offline_recipient_is_persisted_silently() {
        let store = Arc::new(FakeStore::default());
        let mut engine = engine(&store);
        let (a, mut a_rx) = connect(&mut engine, Some("A"));

        engine
            .on_message(a, payload(Some("A"), Some("B"), Some("later")))
            .await
            .unwrap();

        assert_eq!(store.calls(), 1);
        assert!(drain(&mut a_rx).is_empty());
    }

    #[tokio::test]
    async fn invalid_messages_touch_nothing() {
        let store = Arc::new(FakeStore::default());
        let mut engine = engine(&store);
        let (a, mut a_rx) = connect(&mut engine, Some("A"));
        let (_, mut b_rx) = connect(&mut engine, Some("B"));

        let cases = [
            (payload(Some("A"), Some("B"), Some("")), ValidationError::EmptyContent),
            (payload(Some("A"), Some("B"), None), ValidationError::EmptyContent),
            (payload(Some("A"), None, Some("hi")), ValidationError::MissingReceiver),
            (payload(Some("A"), Some(""), Some("hi")), ValidationError::MissingReceiver),
        ];
        for (payload, expected) in cases {
            let err = engine.on_message(a, payload).await.unwrap_err();
            assert!(matches!(err, RelayError::Validation(ref reason) if *reason == expected));
        }

        assert_eq!(store.calls(), 0);
        assert!(drain(&mut b_rx).is_empty());
        let acks = drain(&mut a_rx);
        assert_eq!(acks.len(), 4);
        assert!(acks.iter().all(|event| error_code(event) == "validation_error"));
    }

    #[tokio::test]
    async fn store_outage_broadcasts_nothing() {
        let store = Arc::new(FakeStore::default());
        store.failing.store(true, Ordering::SeqCst);
        let mut engine = engine(&store);
        let (a, mut a_rx) = connect(&mut engine, Some("A"));
        let (_, mut b_rx) = connect(&mut engine, Some("B"));

        let err = engine
            .on_message(a, payload(Some("A"), Some("B"), Some("hi")))
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::Persistence(PersistenceError::Database(_))));
        assert!(store.saved().is_empty());
        assert!(drain(&mut b_rx).is_empty());
        let acks = drain(&mut a_rx);
        assert_eq!(acks.len(), 1);
        assert_eq!(error_code(&acks[0]), "persistence_error");
    }

    #[tokio::test]
    async fn slow_store_times_out() {
        let store = Arc::new(FakeStore {
            delay: Some(Duration::from_millis(200)),
            ..Default::default()
        });
        let mut engine = RelayEngine::new(store.clone(), Duration::from_millis(20));
        let (a, mut a_rx) = connect(&mut engine, Some("A"));
        let (_, mut b_rx) = connect(&mut engine, Some("B"));

        let err = engine
            .on_message(a, payload(Some("A"), Some("B"), Some("hi")))
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::Persistence(PersistenceError::TimedOut(_))));
        assert!(drain(&mut b_rx).is_empty());
        assert_eq!(error_code(&drain(&mut a_rx)[0]), "persistence_error");
    }

    #[tokio::test]
    async fn sender_defaults_to_joined_identity() {
        let store = Arc::new(FakeStore::default());
        let mut engine = engine(&store);
        let (a, _a_rx) = connect(&mut engine, Some("A"));

        let message = engine.on_message(a, payload(None, Some("B"), Some("hi"))).await.unwrap();
        assert_eq!(message.sender_id, "A");
    }

    #[tokio::test]
    async fn message_before_join_needs_explicit_sender() {
        let store = Arc::new(FakeStore::default());
        let mut engine = engine(&store);
        let (c, mut c_rx) = connect(&mut engine, None);

        let err = engine.on_message(c, payload(None, Some("B"), Some("hi"))).await.unwrap_err();
        assert!(matches!(err, RelayError::Validation(ValidationError::MissingSender)));
        assert_eq!(error_code(&drain(&mut c_rx)[0]), "validation_error");

        let message = engine.on_message(c, payload(Some("A"), Some("B"), Some("hi"))).await.unwrap();
        assert_eq!(message.sender_id, "A");
    }

    #[tokio::test]
    async fn empty_join_is_rejected() {
        let store = Arc::new(FakeStore::default());
        let mut engine = engine(&store);
        let (c, mut c_rx) = connect(&mut engine, None);

        assert!(engine.on_join(c, "").is_err());
        assert!(engine.registry().is_empty());
        assert_eq!(error_code(&drain(&mut c_rx)[0]), "validation_error");
    }

    #[tokio::test]
    async fn disconnect_stops_delivery() {
        let store = Arc::new(FakeStore::default());
        let mut engine = engine(&store);
        let (a, _a_rx) = connect(&mut engine, Some("A"));
        let (b, mut b_rx) = connect(&mut engine, Some("B"));

        engine.on_disconnect(b);
        assert!(engine.registry().connections_for("B").is_empty());
        assert_eq!(engine.registry().user_of(b), None);

        engine.on_message(a, payload(Some("A"), Some("B"), Some("hi"))).await.unwrap();
        assert!(drain(&mut b_rx).is_empty());

        // a second close for the same connection is harmless
        engine.on_disconnect(b);
    }

    #[tokio::test]
    async fn rejoin_moves_delivery() {
        let store = Arc::new(FakeStore::default());
        let mut engine = engine(&store);
        let (a, _a_rx) = connect(&mut engine, Some("A"));
        let (c, mut c_rx) = connect(&mut engine, Some("B"));
        engine.on_join(c, "C").unwrap();

        engine.on_message(a, payload(Some("A"), Some("B"), Some("to B"))).await.unwrap();
        assert!(drain(&mut c_rx).is_empty());

        let message = engine.on_message(a, payload(Some("A"), Some("C"), Some("to C"))).await.unwrap();
        assert_eq!(drain(&mut c_rx), vec![ServerEvent::Message(message)]);
    }

    #[tokio::test]
    async fn full_outbox_drops_without_retry() {
        assert_eq!(DELIVERY_POLICY, DeliveryPolicy::AtMostOnce);

        let store = Arc::new(FakeStore::default());
        let mut engine = engine(&store);
        let (a, _a_rx) = connect(&mut engine, Some("A"));
        let b = ConnectionId::new();
        let (outbox, mut b_rx) = mpsc::channel(1);
        engine.on_connect(b, outbox);
        engine.on_join(b, "B").unwrap();

        let first = engine.on_message(a, payload(Some("A"), Some("B"), Some("one"))).await.unwrap();
        engine.on_message(a, payload(Some("A"), Some("B"), Some("two"))).await.unwrap();

        assert_eq!(store.calls(), 2);
        assert_eq!(drain(&mut b_rx), vec![ServerEvent::Message(first)]);
    }

    #[tokio::test]
    async fn submitted_messages_fan_out() {
        let store = Arc::new(FakeStore::default());
        let mut engine = engine(&store);
        let (_, mut b_rx) = connect(&mut engine, Some("B"));

        let message = engine.on_submit(payload(Some("A"), Some("B"), Some("hi"))).await.unwrap();
        assert_eq!(drain(&mut b_rx), vec![ServerEvent::Message(message)]);

        let err = engine.on_submit(payload(None, Some("B"), Some("hi"))).await.unwrap_err();
        assert!(matches!(err, RelayError::Validation(ValidationError::MissingSender)));
        assert_eq!(store.calls(), 1);
        assert!(drain(&mut b_rx).is_empty());
    }

    #[test]
    fn validate_prefers_declared_sender() {
        let resolved = validate(payload(Some("declared"), Some("B"), Some("hi")), Some("joined")).unwrap();
        assert_eq!(resolved, ("declared".into(), "B".into(), "hi".into()));
    }
}
