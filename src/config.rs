use std::{fmt::Display, net::SocketAddr, str::FromStr, time::Duration};

use anyhow::Context;

/// Process configuration, read from the environment (and `.env` when present).
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: SocketAddr,
    pub db_max_connections: u32,
    /// Upper bound on a single message insert before it counts as failed.
    pub persist_timeout: Duration,
    /// Capacity of the relay's inbound event queue.
    pub relay_queue: usize,
    /// Outbound buffer per connection.
    pub send_queue: usize,
    pub session_inactivity: time::Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite:gigchat.db?mode=rwc".to_owned(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            db_max_connections: 16,
            persist_timeout: Duration::from_millis(5000),
            relay_queue: 1024,
            send_queue: 64,
            session_inactivity: time::Duration::minutes(60),
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Config> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| dotenv::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Config> {
        let defaults = Config::default();

        Ok(Config {
            database_url: lookup("DATABASE_URL").unwrap_or(defaults.database_url),
            bind_addr: parse_var(&lookup, "BIND_ADDR", defaults.bind_addr)?,
            db_max_connections: parse_var(&lookup, "DB_MAX_CONNECTIONS", defaults.db_max_connections)?,
            persist_timeout: Duration::from_millis(positive(
                parse_var(&lookup, "PERSIST_TIMEOUT_MS", defaults.persist_timeout.as_millis() as u64)?,
                "PERSIST_TIMEOUT_MS",
            )?),
            relay_queue: positive(parse_var(&lookup, "RELAY_QUEUE", defaults.relay_queue)?, "RELAY_QUEUE")?,
            send_queue: positive(parse_var(&lookup, "SEND_QUEUE", defaults.send_queue)?, "SEND_QUEUE")?,
            session_inactivity: time::Duration::minutes(
                parse_var(&lookup, "SESSION_INACTIVITY_MINUTES", defaults.session_inactivity.whole_minutes())?
            ),
        })
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };

    raw.trim()
        .parse()
        .map_err(|err: T::Err| anyhow::anyhow!("{err}"))
        .with_context(|| format!("invalid {key}={raw:?}"))
}

// tokio channels panic on a zero capacity; a zero timeout fails any insert that yields
fn positive<T: Default + PartialOrd>(value: T, key: &str) -> anyhow::Result<T> {
    anyhow::ensure!(value > T::default(), "{key} must be greater than zero");
    Ok(value)
}
