use axum::{Json, debug_handler, extract::State, http::StatusCode, response::{IntoResponse, Response}};
use tower_sessions::Session;

use crate::{
    AppResult, AppState,
    relay::{ChatPayload, ErrorPayload, RelayError, RelayHandle},
    session::USER_ID,
};

/// Creates a message as the signed-in user and relays it like one sent over
/// the websocket.
#[debug_handler(state = AppState)]
pub(crate) async fn create_message(
    State(relay): State<RelayHandle>,
    session: Session,
    Json(mut payload): Json<ChatPayload>,
) -> AppResult<Response> {
    let Some(user_id) = session.get::<String>(USER_ID).await? else {
        return Ok((StatusCode::UNAUTHORIZED, "Unauthorized").into_response());
    };
    payload.sender_id = Some(user_id);

    match relay.submit(payload).await {
        Some(Ok(message)) => Ok(Json(message).into_response()),
        Some(Err(err @ RelayError::Validation(_))) => {
            let body = ErrorPayload {
                code: err.code(),
                message: err.to_string(),
            };
            Ok((StatusCode::BAD_REQUEST, Json(body)).into_response())
        }
        Some(Err(RelayError::Persistence(err))) => Err(err.into()),
        None => Ok((StatusCode::SERVICE_UNAVAILABLE, "Relay unavailable").into_response()),
    }
}
