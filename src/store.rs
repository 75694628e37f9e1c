use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};
use time::OffsetDateTime;
use uuid::Uuid;

/// A persisted chat message. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store did not answer within {0:?}")]
    TimedOut(Duration),
    #[error("corrupt message row: {0}")]
    Corrupt(String),
}

/// Durable message storage consumed by the relay and the history route.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Atomically creates one message, assigning its id and timestamp.
    async fn create_message(
        &self,
        sender_id: &str,
        receiver_id: &str,
        content: &str,
    ) -> Result<Message, PersistenceError>;

    /// Every message the user sent or received, oldest first.
    async fn list_for_participant(&self, user_id: &str) -> Result<Vec<Message>, PersistenceError>;
}

#[derive(Clone)]
pub struct SqliteMessageStore {
    db_pool: SqlitePool,
}

impl SqliteMessageStore {
    pub fn new(db_pool: SqlitePool) -> Self {
        Self { db_pool }
    }
}

type MessageRow = (String, String, String, String, i64);

fn from_row((id, sender_id, receiver_id, content, created_at): MessageRow) -> Result<Message, PersistenceError> {
    Ok(Message {
        id: Uuid::parse_str(&id).map_err(|err| PersistenceError::Corrupt(format!("id {id:?}: {err}")))?,
        sender_id,
        receiver_id,
        content,
        created_at: from_millis(created_at)?,
    })
}

fn from_millis(millis: i64) -> Result<OffsetDateTime, PersistenceError> {
    OffsetDateTime::from_unix_timestamp_nanos(millis as i128 * 1_000_000)
        .map_err(|err| PersistenceError::Corrupt(format!("created_at {millis}: {err}")))
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn create_message(
        &self,
        sender_id: &str,
        receiver_id: &str,
        content: &str,
    ) -> Result<Message, PersistenceError> {
        let id = Uuid::now_v7();
        // stored at millisecond precision, so the returned record matches what history reads back
        let created_at = (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64;

        sqlx::query("INSERT INTO messages (id,sender_id,receiver_id,content,created_at) VALUES (?,?,?,?,?)")
            .bind(id.to_string())
            .bind(sender_id)
            .bind(receiver_id)
            .bind(content)
            .bind(created_at)
            .execute(&self.db_pool)
            .await?;

        Ok(Message {
            id,
            sender_id: sender_id.to_owned(),
            receiver_id: receiver_id.to_owned(),
            content: content.to_owned(),
            created_at: from_millis(created_at)?,
        })
    }

    async fn list_for_participant(&self, user_id: &str) -> Result<Vec<Message>, PersistenceError> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT id,sender_id,receiver_id,content,created_at FROM messages \
             WHERE sender_id=? OR receiver_id=? ORDER BY created_at ASC, id ASC",
        )
        .bind(user_id)
        .bind(user_id)
        .fetch_all(&self.db_pool)
        .await?;

        rows.into_iter().map(from_row).collect()
    }
}

/// Opens the pool. An in-memory database lives in a single connection, so it is pinned to one.
pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<SqlitePool> {
    let options = if database_url.contains(":memory:") {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
    } else {
        SqlitePoolOptions::new().max_connections(max_connections)
    };

    options
        .connect(database_url)
        .await
        .with_context(|| format!("connect to sqlite via {database_url}"))
}

pub async fn migrate(db_pool: &SqlitePool) -> anyhow::Result<()> {
    let stmts = [
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id          TEXT PRIMARY KEY,
            sender_id   TEXT NOT NULL,
            receiver_id TEXT NOT NULL,
            content     TEXT NOT NULL CHECK (content <> ''),
            created_at  INTEGER NOT NULL
        );"#,
        "CREATE INDEX IF NOT EXISTS messages_sender ON messages (sender_id, created_at);",
        "CREATE INDEX IF NOT EXISTS messages_receiver ON messages (receiver_id, created_at);",
    ];

    for stmt in stmts {
        sqlx::query(stmt)
            .execute(db_pool)
            .await
            .with_context(|| format!("apply migration: {}", stmt.trim().lines().next().unwrap_or_default()))?;
    }
    Ok(())
}
