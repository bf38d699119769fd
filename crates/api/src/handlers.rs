//! HTTP handlers.
//!
//! Handlers stay thin: extract identity and payload, apply per-route
//! limits, call into `state.clicks`, serialize the result.
//!
//! - **health** - `GET /health`
//! - **auth** - `POST /api/auth`
//! - **clicks** - `POST /api/click`
//! - **users** - `GET /api/user`, `GET /api/user/rank`
//! - **leaderboard** - `GET /api/leaderboard`

pub mod auth;
pub mod clicks;
pub mod health;
pub mod leaderboard;
pub mod users;
