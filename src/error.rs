use axum::extract::multipart::MultipartError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::middleware::apply_rate_limit_headers;
use crate::models::ErrorResponse;
use crate::ratelimit::RateLimitDecision;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    PayloadTooLarge(String),

    #[error("Failed to download image from URL: {0}")]
    ImageFetch(String),

    #[error("Invalid multipart request: {0}")]
    Multipart(#[from] MultipartError),

    #[error("Rate limit exceeded")]
    RateLimited(RateLimitDecision),

    #[error("{0}")]
    Internal(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) | AppError::ImageFetch(_) => StatusCode::BAD_REQUEST,
            AppError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::Multipart(err) => err.status(),
            AppError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        match self {
            AppError::RateLimited(decision) => {
                let body = ErrorResponse::new(status, "Rate limit exceeded").with_details(
                    serde_json::json!({ "retry_after": decision.retry_after().unwrap_or(0) }),
                );
                let mut response = (status, Json(body)).into_response();
                apply_rate_limit_headers(response.headers_mut(), &decision);
                response
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                let body = ErrorResponse::new(status, "An unexpected error occurred");
                (status, Json(body)).into_response()
            }
            other => (status, Json(ErrorResponse::new(status, other.to_string()))).into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{Denial, LimitWindow};

    #[tokio::test]
    async fn rate_limited_response_carries_headers_and_body() {
        let decision = RateLimitDecision {
            remaining_minute: 0,
            remaining_hour: 12,
            denial: Some(Denial {
                window: LimitWindow::Minute,
                limit: 10,
                retry_after: 60,
            }),
        };

        let response = AppError::RateLimited(decision).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["x-ratelimit-limit"], "10");
        assert_eq!(response.headers()["retry-after"], "60");
        assert_eq!(response.headers()["x-ratelimit-window"], "minute");

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status_code"], 429);
        assert_eq!(body["message"], "Rate limit exceeded");
        assert_eq!(body["details"]["retry_after"], 60);
    }

    #[tokio::test]
    async fn internal_errors_hide_details() {
        let response = AppError::Internal("db exploded".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["message"], "An unexpected error occurred");
        assert!(body.get("details").is_none());
    }

    #[test]
    fn status_mapping() {
        assert_eq!(AppError::BadRequest("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(AppError::ImageFetch("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(AppError::PayloadTooLarge("x".into()).status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
