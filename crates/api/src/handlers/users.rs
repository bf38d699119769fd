//! The caller's own profile and rank.
//!
//! Endpoints:
//! - GET /user - Profile and current total
//! - GET /user/rank - 1-based rank and current total

use axum::{Json, Router, debug_handler, extract::State, response::IntoResponse, routing::get};

use crate::{error::AppError, middleware::telegram::TelegramUser, state::AppState};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/user", get(get_user))
        .route("/user/rank", get(get_rank))
}

#[debug_handler]
async fn get_user(
    user: TelegramUser,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let response = state.clicks.get_user(user.id).await?;
    Ok(Json(response))
}

#[debug_handler]
async fn get_rank(
    user: TelegramUser,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let response = state.clicks.get_rank(user.id).await?;
    Ok(Json(response))
}
