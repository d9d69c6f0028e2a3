//! API error responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use log::{error, warn};
use serde::Serialize;
use thiserror::Error;

use crate::broker::BrokerError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError::BadRequest(message.into())
    }

    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::Broker(err) if err.is_client_error() => {
                (StatusCode::BAD_REQUEST, err.error_code())
            }
            ApiError::Broker(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.error_code()),
        }
    }
}

/// JSON error body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code) = self.status_and_code();

        // Full source chain for the log; the client gets the top-level message.
        let mut detail = self.to_string();
        let mut source = std::error::Error::source(&self);
        while let Some(cause) = source {
            detail.push_str(&format!(": {cause}"));
            source = cause.source();
        }
        if status.is_server_error() {
            error!("{} ({})", detail, error_code);
        } else {
            warn!("{} ({})", detail, error_code);
        }

        let body = ErrorResponse {
            error: self.to_string(),
            error_code,
        };
        (status, Json(body)).into_response()
    }
}
