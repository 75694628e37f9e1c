pub mod config;
pub mod messages;
pub mod relay;
pub mod session;
pub mod store;

use std::sync::Arc;

use axum::{
    Router, debug_handler,
    extract::{FromRef, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use sqlx::SqlitePool;
use tower_http::cors::CorsLayer;

use config::Config;
use relay::RelayHandle;
use store::MessageStore;

#[derive(Clone, FromRef)]
pub struct AppState {
    pub db_pool: SqlitePool,
    pub store: Arc<dyn MessageStore>,
    pub relay: RelayHandle,
}

/// Every route, without state. Hosts can merge their own routes before calling `with_state`.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .merge(relay::router())
        .merge(messages::router())
}

pub fn app(state: AppState, config: &Config) -> Router {
    router()
        .with_state(state)
        .layer(session::layer(config.session_inactivity))
        .layer(CorsLayer::permissive())
}

#[debug_handler]
async fn health(State(db_pool): State<SqlitePool>) -> StatusCode {
    match db_pool.acquire().await {
        Ok(_) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

pub type AppResult<T> = Result<T, AppError>;
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        tracing::error!(error = %self.0, backtrace = %self.0.backtrace(), "request failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal Server Error",
        )
            .into_response()
    }
}

macro_rules! apperr_impl {
    ($E:ty) => {
        impl From<$E> for AppError {
            fn from(err: $E) -> Self {
                Self(anyhow::Error::from(err))
            }
        }
    };
}

apperr_impl!(tower_sessions::session::Error);
apperr_impl!(store::PersistenceError);
