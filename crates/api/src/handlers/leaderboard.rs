//! Endpoints:
//! - GET /leaderboard - Top users by total, served from a short-lived cache

use axum::{Json, Router, debug_handler, extract::State, response::IntoResponse, routing::get};

use crate::{error::AppError, middleware::telegram::TelegramUser, state::AppState};

pub fn router() -> Router<AppState> {
    Router::new().route("/leaderboard", get(get_leaderboard))
}

#[debug_handler]
async fn get_leaderboard(
    _user: TelegramUser,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let response = state.clicks.leaderboard().await?;
    Ok(Json(response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RankedUser;
    use crate::stores::MockRankingStore;
    use crate::test_utils::{TestStateBuilder, body_json};
    use shared::api::LeaderboardResponse;

    #[tokio::test]
    async fn second_read_is_served_from_cache() {
        let mut ranking = MockRankingStore::new();
        ranking.expect_top().with(mockall::predicate::eq(25)).times(1).returning(|_| {
            Ok(vec![
                RankedUser { user_id: 1, score: 90, rank: 1 },
                RankedUser { user_id: 2, score: 40, rank: 2 },
            ])
        });
        let state = TestStateBuilder::new()
            .with_users(&[(1, 90), (2, 40)])
            .with_ranking_store(ranking)
            .build();

        for _ in 0..2 {
            let response = get_leaderboard(TelegramUser::development(), State(state.clone()))
                .await
                .unwrap()
                .into_response();
            let body: LeaderboardResponse = body_json(response).await;
            assert_eq!(body.leaders.len(), 2);
            assert_eq!(body.leaders[0].first_name, "User1");
            assert_eq!(body.leaders[1].clicks, 40);
        }
    }
}
