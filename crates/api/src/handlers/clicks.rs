//! Click submission.
//!
//! Endpoints:
//! - POST /click - Accept 1 to 100 clicks into the write buffer (per-user rate limited)

use axum::{Json, Router, debug_handler, extract::State, response::IntoResponse, routing::post};
use garde::Validate;
use shared::api::ClickPayload;

use crate::{
    error::AppError,
    middleware::{rate_limit::admit_click, telegram::TelegramUser},
    state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new().route("/click", post(submit_clicks))
}

#[debug_handler]
async fn submit_clicks(
    user: TelegramUser,
    State(state): State<AppState>,
    Json(payload): Json<ClickPayload>,
) -> Result<impl IntoResponse, AppError> {
    admit_click(&state, user.id).await?;

    payload
        .validate()
        .map_err(|e| AppError::Validation(e.to_string()))?;

    let response = state.clicks.add_clicks(user.id, payload.count).await?;

    tracing::debug!(user_id = user.id, count = payload.count, total = response.clicks, "clicks accepted");

    Ok(Json(response))
}
