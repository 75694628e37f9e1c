use tower_sessions::{Expiry, MemoryStore, SessionManagerLayer, cookie::SameSite};

/// Verified user id, written by the hosting application's sign-in flow.
pub const USER_ID: &str = "user_id";

pub fn layer(inactivity: time::Duration) -> SessionManagerLayer<MemoryStore> {
    SessionManagerLayer::new(MemoryStore::default())
        .with_secure(false)
        .with_same_site(SameSite::Lax)
        .with_expiry(Expiry::OnInactivity(inactivity))
}
