use axum::{
    Json,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use shared::api::ErrorResponse;

pub enum AppError {
    /// Internal errors - logged but return generic 500 to user
    Internal(anyhow::Error),
    /// User-facing errors - message is safe to show
    External(StatusCode, &'static str),
    /// Validation errors - safe to show
    Validation(String),
    /// Global admission limit reached - callers should back off and retry
    Overloaded,
}

impl AppError {
    pub fn user_not_found() -> Self {
        AppError::External(StatusCode::NOT_FOUND, "User not found")
    }
}

fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    let body = ErrorResponse {
        error: message.into(),
    };
    (status, Json(body)).into_response()
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Internal(err) => {
                tracing::error!("internal error: {:?}", err);
                sentry::capture_error(
                    err.as_ref() as &(dyn std::error::Error + Send + Sync + 'static)
                );

                json_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
            AppError::External(status, msg) => json_error(status, msg),
            AppError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, msg),
            AppError::Overloaded => {
                let mut response = json_error(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Server overloaded, try again later",
                );
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, header::HeaderValue::from_static("1"));
                response
            }
        }
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::Internal(err.into())
    }
}

impl std::fmt::Debug for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppError::Internal(err) => write!(f, "Internal({err:?})"),
            AppError::External(status, msg) => write!(f, "External({status}, {msg})"),
            AppError::Validation(msg) => write!(f, "Validation({msg})"),
            AppError::Overloaded => write!(f, "Overloaded"),
        }
    }
}
