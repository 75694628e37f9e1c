use serde::{Deserialize, Serialize};

use crate::store::Message;

use super::error::RelayError;

/// Frames a client may send.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientEvent {
    Join(String),
    Message(ChatPayload),
}

impl ClientEvent {
    pub fn parse(frame: &[u8]) -> serde_json::Result<ClientEvent> {
        serde_json::from_slice(frame)
    }
}

/// Body of an inbound `message`. Fields are optional on the wire so that a
/// missing one surfaces as a validation failure rather than a parse failure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPayload {
    pub sender_id: Option<String>,
    pub receiver_id: Option<String>,
    pub content: Option<String>,
}

/// Frames the relay pushes to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    Message(Message),
    Error(ErrorPayload),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorPayload {
    pub code: &'static str,
    pub message: String,
}

impl From<&RelayError> for ServerEvent {
    fn from(err: &RelayError) -> Self {
        let message = match err {
            RelayError::Validation(err) => err.to_string(),
            // store internals stay in the server log
            RelayError::Persistence(_) => "message could not be saved".to_owned(),
        };
        ServerEvent::Error(ErrorPayload {
            code: err.code(),
            message,
        })
    }
}
