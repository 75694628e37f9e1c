use std::collections::{HashMap, HashSet};
use std::fmt;

use uuid::Uuid;

/// Identity of one live websocket connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub Uuid);

impl Default for ConnectionId {
    fn default() -> Self {
        Self(Uuid::now_v7())
    }
}

impl ConnectionId {
    pub fn new() -> Self {
        Self::default()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn_{}", self.0.simple())
    }
}

/// Which live connections currently speak for which user.
///
/// A user may hold any number of connections (tabs, devices); a connection
/// belongs to at most one user, the one it joined as most recently.
/// Only the relay task owns this, so it needs no locking.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    users: HashMap<String, HashSet<ConnectionId>>,
    bindings: HashMap<ConnectionId, String>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `connection` to `user_id`, moving it out of any previous user's set.
    /// Returns the user it was previously bound to, if that was someone else.
    pub fn bind(&mut self, connection: ConnectionId, user_id: &str) -> Option<String> {
        let previous = match self.bindings.get(&connection) {
            Some(current) if current == user_id => return None,
            Some(_) => self.unbind(connection),
            None => None,
        };

        self.bindings.insert(connection, user_id.to_owned());
        self.users
            .entry(user_id.to_owned())
            .or_default()
            .insert(connection);
        previous
    }

    /// Forgets `connection`. Unknown connections are ignored.
    pub fn unbind(&mut self, connection: ConnectionId) -> Option<String> {
        let user_id = self.bindings.remove(&connection)?;
        if let Some(set) = self.users.get_mut(&user_id) {
            set.remove(&connection);
            if set.is_empty() {
                self.users.remove(&user_id);
            }
        }
        Some(user_id)
    }

    /// Live connections for `user_id`; empty when the user is offline.
    pub fn connections_for(&self, user_id: &str) -> HashSet<ConnectionId> {
        self.users.get(user_id).cloned().unwrap_or_default()
    }

    pub fn user_of(&self, connection: ConnectionId) -> Option<&str> {
        self.bindings.get(&connection).map(String::as_str)
    }

    /// Number of bound connections.
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}
