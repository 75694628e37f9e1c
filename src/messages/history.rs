use std::sync::Arc;

use axum::{Json, debug_handler, extract::State, http::StatusCode, response::{IntoResponse, Response}};
use tower_sessions::Session;

use crate::{AppResult, AppState, session::USER_ID, store::MessageStore};

/// Conversation history of the signed-in user, oldest first.
#[debug_handler(state = AppState)]
pub(crate) async fn list_messages(
    State(store): State<Arc<dyn MessageStore>>,
    session: Session,
) -> AppResult<Response> {
    let Some(user_id) = session.get::<String>(USER_ID).await? else {
        return Ok((StatusCode::UNAUTHORIZED, "Unauthorized").into_response());
    };

    let messages = store.list_for_participant(&user_id).await?;
    Ok(Json(messages).into_response())
}
