//! Realtime relay: persists chat messages and pushes them to the recipient's
//! open websockets.

mod engine;
mod error;
mod event;
mod handle;
mod registry;
mod ws;

use std::sync::Arc;

use axum::{Router, routing::get};
use tokio::task::JoinHandle;

use crate::{AppState, config::Config, store::MessageStore};

pub use engine::{DELIVERY_POLICY, DeliveryPolicy, RelayCommand, RelayEngine};
pub use error::{RelayError, ValidationError};
pub use event::{ChatPayload, ClientEvent, ErrorPayload, ServerEvent};
pub use handle::RelayHandle;
pub use registry::{ConnectionId, ConnectionRegistry};
pub use ws::ConnectionState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ws", get(ws::relay_ws))
}

/// Builds the engine from `config` and starts the relay task.
pub fn start(store: Arc<dyn MessageStore>, config: &Config) -> (RelayHandle, JoinHandle<()>) {
    let engine = RelayEngine::new(store, config.persist_timeout);
    RelayHandle::spawn(engine, config.relay_queue, config.send_queue)
}
