use std::sync::Arc;

use anyhow::Context;
use gigchat::{AppState, config::Config, relay, store::{self, MessageStore, SqliteMessageStore}};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env().context("load configuration")?;

    let db_pool = store::connect(&config.database_url, config.db_max_connections).await?;
    store::migrate(&db_pool).await.context("run migrations")?;
    let message_store: Arc<dyn MessageStore> = Arc::new(SqliteMessageStore::new(db_pool.clone()));

    let (relay, relay_task) = relay::start(message_store.clone(), &config);
    let app_state = AppState {
        db_pool: db_pool.clone(),
        store: message_store,
        relay,
    };
    let app = gigchat::app(app_state, &config);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("bind {}", config.bind_addr))?;
    tracing::info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    relay_task.abort();
    db_pool.close().await;
    tracing::info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "could not listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
