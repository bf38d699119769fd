//! Telegram Mini App identity.
//!
//! The client forwards the Mini App's signed init data in the
//! `X-Telegram-Init-Data` header. It is a query string whose `hash` field is
//! an HMAC-SHA256 over the other fields, sorted by key and joined as
//! `key=value` lines. The HMAC key is itself `HMAC-SHA256("WebAppData", bot_token)`.
//!
//! Usage: add `TelegramUser` as an extractor parameter to require identity.
//!
//! ```ignore
//! async fn my_handler(user: TelegramUser, ...) -> ... {
//!     // user.id is the Telegram id
//! }
//! ```

use std::time::Duration;

use axum::{
    extract::FromRequestParts,
    http::{StatusCode, request::Parts},
};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use crate::{error::AppError, models::Profile, state::AppState};

pub const INIT_DATA_HEADER: &str = "x-telegram-init-data";

type HmacSha256 = Hmac<Sha256>;

/// Identity of the caller, taken from verified init data.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    pub first_name: String,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

impl TelegramUser {
    /// Fixed identity used outside production when no init data is sent.
    pub fn development() -> Self {
        TelegramUser {
            id: 12345,
            first_name: "Dev".to_string(),
            last_name: Some("User".to_string()),
            username: Some("dev_user".to_string()),
        }
    }

    pub fn into_profile(self) -> Profile {
        Profile {
            telegram_id: self.id,
            username: self.username,
            first_name: self.first_name,
            last_name: self.last_name,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum InitDataError {
    MissingHash,
    BadSignature,
    Expired,
    MissingUser,
    MalformedUser,
}

impl std::fmt::Display for InitDataError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            InitDataError::MissingHash => "missing hash",
            InitDataError::BadSignature => "signature mismatch",
            InitDataError::Expired => "auth_date too old",
            InitDataError::MissingUser => "missing user field",
            InitDataError::MalformedUser => "user field is not valid JSON",
        };
        f.write_str(reason)
    }
}

fn secret_key(bot_token: &str) -> Result<HmacSha256, InitDataError> {
    let mut secret =
        HmacSha256::new_from_slice(b"WebAppData").map_err(|_| InitDataError::BadSignature)?;
    secret.update(bot_token.as_bytes());
    HmacSha256::new_from_slice(&secret.finalize().into_bytes())
        .map_err(|_| InitDataError::BadSignature)
}

fn data_check_string(fields: &[(String, String)]) -> String {
    let mut fields: Vec<&(String, String)> = fields.iter().collect();
    fields.sort_by(|a, b| a.0.cmp(&b.0));
    fields
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Verify signed init data and return the user it carries.
///
/// `auth_date`, when present, must be at most `max_age` seconds before `now`.
pub fn verify_init_data(
    init_data: &str,
    bot_token: &str,
    max_age: Duration,
    now: i64,
) -> Result<TelegramUser, InitDataError> {
    let mut hash = None;
    let mut fields = Vec::new();
    for (key, value) in url::form_urlencoded::parse(init_data.as_bytes()) {
        if key == "hash" {
            hash = Some(value.into_owned());
        } else {
            fields.push((key.into_owned(), value.into_owned()));
        }
    }

    let hash = hash.ok_or(InitDataError::MissingHash)?;
    let expected = hex::decode(hash).map_err(|_| InitDataError::BadSignature)?;

    let mut mac = secret_key(bot_token)?;
    mac.update(data_check_string(&fields).as_bytes());
    mac.verify_slice(&expected)
        .map_err(|_| InitDataError::BadSignature)?;

    if let Some((_, auth_date)) = fields.iter().find(|(key, _)| key == "auth_date") {
        let auth_date: i64 = auth_date.parse().map_err(|_| InitDataError::Expired)?;
        if now.saturating_sub(auth_date) > max_age.as_secs() as i64 {
            return Err(InitDataError::Expired);
        }
    }

    user_field(&fields)
}

fn user_field(fields: &[(String, String)]) -> Result<TelegramUser, InitDataError> {
    let (_, user) = fields
        .iter()
        .find(|(key, _)| key == "user")
        .ok_or(InitDataError::MissingUser)?;
    serde_json::from_str(user).map_err(|_| InitDataError::MalformedUser)
}

/// Read the user field without checking the signature. Development only.
fn unverified_user(init_data: &str) -> Result<TelegramUser, InitDataError> {
    let fields: Vec<(String, String)> = url::form_urlencoded::parse(init_data.as_bytes())
        .into_owned()
        .collect();
    user_field(&fields)
}

fn invalid_init_data() -> AppError {
    AppError::External(StatusCode::UNAUTHORIZED, "Invalid Telegram init data")
}

impl FromRequestParts<AppState> for TelegramUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let init_data = parts
            .headers
            .get(INIT_DATA_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty());
        let production = state.config.is_production();

        let Some(init_data) = init_data else {
            if production {
                return Err(AppError::External(
                    StatusCode::UNAUTHORIZED,
                    "Missing Telegram init data",
                ));
            }
            return Ok(TelegramUser::development());
        };

        let user = match state.config.bot_token.as_deref() {
            Some(bot_token) => verify_init_data(
                init_data,
                bot_token,
                Duration::from_secs(state.config.init_data_max_age_secs),
                Utc::now().timestamp(),
            ),
            None if !production => unverified_user(init_data),
            None => {
                return Err(AppError::Internal(anyhow::anyhow!(
                    "bot token is not configured"
                )));
            }
        };

        user.map_err(|err| {
            tracing::debug!(reason = %err, "rejected Telegram init data");
            invalid_init_data()
        })
    }
}
