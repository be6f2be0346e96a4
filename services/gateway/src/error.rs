use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use types::errors::MarketDataError;

/// Central error type for the gateway application
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("{message}")]
    BadRequest {
        code: &'static str,
        message: String,
    },

    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("Upstream unavailable: {0}")]
    BadGateway(String),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

impl From<MarketDataError> for AppError {
    fn from(error: MarketDataError) -> Self {
        match error {
            MarketDataError::RateLimited(message) => AppError::RateLimited(message),
            MarketDataError::UpstreamUnavailable(message) => AppError::BadGateway(message),
            MarketDataError::Store(message) => {
                AppError::Internal(anyhow::anyhow!("storage failure: {message}"))
            }
            other => AppError::BadRequest {
                code: other.code(),
                message: other.to_string(),
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg),
            AppError::BadRequest { code, message } => (StatusCode::BAD_REQUEST, code, message),
            AppError::RateLimited(msg) => (
                StatusCode::TOO_MANY_REQUESTS,
                "MARKET_DATA_RATE_LIMITED",
                msg,
            ),
            AppError::BadGateway(msg) => (
                StatusCode::BAD_GATEWAY,
                "MARKET_DATA_UPSTREAM_UNAVAILABLE",
                msg,
            ),
            AppError::Internal(error) => {
                tracing::error!(%error, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "Internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": code,
            "message": message
        }));

        (status, body).into_response()
    }
}
