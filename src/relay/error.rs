use crate::store::PersistenceError;

/// An inbound event that cannot be acted on. The event is dropped; the
/// connection stays open.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("join requires a user id")]
    MissingUser,
    #[error("receiverId is required")]
    MissingReceiver,
    #[error("content must not be empty")]
    EmptyContent,
    #[error("senderId is required before joining")]
    MissingSender,
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl RelayError {
    /// Stable code carried by the outbound `error` event.
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::Validation(_) => "validation_error",
            RelayError::Persistence(_) => "persistence_error",
        }
    }
}
