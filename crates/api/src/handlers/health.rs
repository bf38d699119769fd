//! Health check endpoint for load balancers and monitoring.
//!
//! Returns 200 OK if the service is healthy (database and fast store
//! reachable), 503 Service Unavailable otherwise.

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use serde::Serialize;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(health_check))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    database: bool,
    store: bool,
}

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let (database, store) = tokio::join!(
        state.repos.users.health_check(),
        state.stores.buffer.health_check(),
    );
    let database = database.unwrap_or(false);
    let store = store.unwrap_or(false);

    let healthy = database && store;

    let response = HealthResponse {
        status: if healthy { "ok" } else { "unhealthy" },
        database,
        store,
    };

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, Json(response))
}
