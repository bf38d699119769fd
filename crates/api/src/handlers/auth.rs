//! Sign-in.
//!
//! Endpoints:
//! - POST /auth - Register the caller on first sight, refresh their profile
//!   otherwise, and return their current total

use axum::{Json, Router, debug_handler, extract::State, response::IntoResponse, routing::post};

use crate::{error::AppError, middleware::telegram::TelegramUser, state::AppState};

pub fn router() -> Router<AppState> {
    Router::new().route("/auth", post(sign_in))
}

#[debug_handler]
async fn sign_in(
    user: TelegramUser,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let response = state.clicks.identify(user.into_profile()).await?;
    Ok(Json(response))
}
