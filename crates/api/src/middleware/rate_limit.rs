//! Request admission limits.
//!
//! - Global: every `/api` request counts against one shared window. Denial
//!   is a 503 "try again later" so clients back off.
//! - Per user: click submissions count against a window per Telegram id.
//!   Denial is a 429.
//!
//! Limiter failures admit the request; the limits protect the stores, they
//! do not guard correctness.

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};

use crate::{
    error::AppError,
    state::AppState,
    stores::{GLOBAL_SCOPE, click_scope},
};

/// Axum middleware applying the global admission limit.
pub async fn global_admission(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    admit_global(&state).await?;
    Ok(next.run(request).await)
}

async fn admit_global(state: &AppState) -> Result<(), AppError> {
    let result = state
        .stores
        .rate_limiter
        .check(
            GLOBAL_SCOPE,
            state.config.global_rate_limit,
            state.config.global_rate_window(),
        )
        .await;

    match result {
        Ok(result) if result.is_allowed() => Ok(()),
        Ok(result) => {
            tracing::warn!(count = result.count(), "global rate limit exceeded");
            Err(AppError::Overloaded)
        }
        Err(err) => {
            tracing::warn!(error = ?err, "global rate limiter unavailable, admitting request");
            Ok(())
        }
    }
}

/// Count one click submission for `user_id`.
pub async fn admit_click(state: &AppState, user_id: i64) -> Result<(), AppError> {
    let result = state
        .stores
        .rate_limiter
        .check(
            &click_scope(user_id),
            state.config.click_rate_limit,
            state.config.click_rate_window(),
        )
        .await;

    match result {
        Ok(result) if result.is_allowed() => Ok(()),
        Ok(_) => {
            tracing::debug!(user_id, "click rate limit exceeded");
            Err(AppError::External(
                StatusCode::TOO_MANY_REQUESTS,
                "Too many requests",
            ))
        }
        Err(err) => {
            tracing::warn!(error = ?err, user_id, "click rate limiter unavailable, admitting request");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::{MockRateLimiter, RateLimitResult};
    use crate::test_utils::TestStateBuilder;
    use mockall::predicate::eq;

    #[tokio::test]
    async fn global_denial_is_overloaded() {
        let mut limiter = MockRateLimiter::new();
        limiter
            .expect_check()
            .withf(|key, limit, _| key == GLOBAL_SCOPE && *limit == 10_000)
            .returning(|_, _, _| Ok(RateLimitResult::Exceeded(10_001)));
        let state = TestStateBuilder::new().with_rate_limiter(limiter).build();

        let err = admit_global(&state).await.unwrap_err();

        assert!(matches!(err, AppError::Overloaded));
    }

    #[tokio::test]
    async fn limiter_failure_admits() {
        let mut limiter = MockRateLimiter::new();
        limiter
            .expect_check()
            .returning(|_, _, _| Err(anyhow::anyhow!("connection refused")));
        let state = TestStateBuilder::new().with_rate_limiter(limiter).build();

        assert!(admit_global(&state).await.is_ok());
        assert!(admit_click(&state, 1).await.is_ok());
    }

    #[tokio::test]
    async fn click_limit_is_per_user() {
        let mut limiter = MockRateLimiter::new();
        limiter
            .expect_check()
            .with(eq("ratelimit:click:7"), eq(20), mockall::predicate::always())
            .returning(|_, _, _| Ok(RateLimitResult::Exceeded(21)));
        limiter
            .expect_check()
            .with(eq("ratelimit:click:8"), eq(20), mockall::predicate::always())
            .returning(|_, _, _| Ok(RateLimitResult::Allowed(1)));
        let state = TestStateBuilder::new().with_rate_limiter(limiter).build();

        let err = admit_click(&state, 7).await.unwrap_err();
        assert!(
            matches!(err, AppError::External(status, _) if status == StatusCode::TOO_MANY_REQUESTS)
        );
        assert!(admit_click(&state, 8).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn sliding_window_backend_enforces_click_limit() {
        let state = TestStateBuilder::new().build();

        for _ in 0..20 {
            admit_click(&state, 3).await.unwrap();
        }
        assert!(admit_click(&state, 3).await.is_err());

        tokio::time::advance(state.config.click_rate_window()).await;
        assert!(admit_click(&state, 3).await.is_ok());
    }
}
