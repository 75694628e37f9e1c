mod history;
mod send;

use axum::{Router, routing::get};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/messages", get(history::list_messages).post(send::create_message))
}
