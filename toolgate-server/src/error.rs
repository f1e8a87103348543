//! HTTP error mapping.
//!
//! One `ApiError` covers the agent-facing surface; every domain error
//! converts into it with the status the error taxonomy prescribes.
//! Signature and replay-window failures share one opaque 401.

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use toolgate_core::error::{
    CredentialError, ExecutionError, SearchError, StoreError, ToolgateError,
};
use tracing::error;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Validation(String),

    #[error("rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },

    #[error("internal error")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match &self {
            ApiError::NotFound(detail) => (StatusCode::NOT_FOUND, detail.clone()),
            ApiError::Forbidden(detail) => (StatusCode::FORBIDDEN, detail.clone()),
            ApiError::Unauthorized(detail) => (StatusCode::UNAUTHORIZED, detail.clone()),
            ApiError::Conflict(detail) => (StatusCode::CONFLICT, detail.clone()),
            ApiError::BadRequest(detail) => (StatusCode::BAD_REQUEST, detail.clone()),
            ApiError::Validation(detail) => (StatusCode::UNPROCESSABLE_ENTITY, detail.clone()),
            ApiError::RateLimited { .. } => {
                (StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded".into())
            }
            ApiError::Internal(detail) => {
                // The detail stays in the log, not the response.
                error!(detail = %detail, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".into())
            }
        };

        let mut response =
            (status, Json(json!({"status": "error", "detail": detail}))).into_response();
        if let ApiError::RateLimited { retry_after_secs } = self {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { kind, name } => ApiError::NotFound(format!("{kind} {name} not found")),
            StoreError::AlreadyExists { kind, name } => {
                ApiError::Conflict(format!("{kind} {name} already exists"))
            }
            StoreError::SchemeMismatch { configured, given } => ApiError::Validation(format!(
                "security scheme mismatch: configuration uses {configured}, got {given}"
            )),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<CredentialError> for ApiError {
    fn from(e: CredentialError) -> Self {
        match e {
            CredentialError::InvalidState { .. } => {
                ApiError::Unauthorized("invalid state parameter".into())
            }
            CredentialError::SchemeMismatch { .. } => ApiError::Validation(e.to_string()),
            // OAuth broker failures: structured detail, no secrets.
            CredentialError::OAuth2 { message } | CredentialError::OAuth1 { message } => {
                ApiError::BadRequest(message)
            }
            CredentialError::MissingScheme { .. }
            | CredentialError::NoDefaultCredentials { .. } => ApiError::BadRequest(e.to_string()),
            CredentialError::Http(e) => ApiError::BadRequest(format!("token endpoint error: {e}")),
        }
    }
}

impl From<SearchError> for ApiError {
    fn from(e: SearchError) -> Self {
        match e {
            SearchError::Store(store) => store.into(),
            SearchError::Embedding(embedding) => ApiError::Internal(embedding.to_string()),
        }
    }
}

impl From<ExecutionError> for ApiError {
    fn from(e: ExecutionError) -> Self {
        match e {
            ExecutionError::InstructionViolation { message } => ApiError::Forbidden(message),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<ToolgateError> for ApiError {
    fn from(e: ToolgateError) -> Self {
        match e {
            ToolgateError::Store(e) => e.into(),
            ToolgateError::Search(e) => e.into(),
            ToolgateError::Credential(e) => e.into(),
            ToolgateError::Execution(e) => e.into(),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    fn status_of(err: ApiError) -> StatusCode {
        err.into_response().status()
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_of(ApiError::NotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(status_of(ApiError::Forbidden("x".into())), StatusCode::FORBIDDEN);
        assert_eq!(
            status_of(ApiError::Unauthorized("x".into())),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(status_of(ApiError::Conflict("x".into())), StatusCode::CONFLICT);
        assert_eq!(
            status_of(ApiError::Validation("x".into())),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_of(ApiError::Internal("secret detail".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_rate_limited_carries_retry_after() {
        let response = ApiError::RateLimited {
            retry_after_secs: 2,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "2");
    }

    #[test]
    fn test_store_error_conversion() {
        let err: ApiError = StoreError::NotFound {
            kind: "Function",
            name: "X__Y".into(),
        }
        .into();
        assert!(matches!(err, ApiError::NotFound(_)));

        let err: ApiError = StoreError::AlreadyExists {
            kind: "LinkedAccount",
            name: "GMAIL/u1".into(),
        }
        .into();
        assert!(matches!(err, ApiError::Conflict(_)));
    }

    #[test]
    fn test_credential_error_conversion() {
        let err: ApiError = CredentialError::InvalidState {
            message: "bad jwt".into(),
        }
        .into();
        assert!(matches!(err, ApiError::Unauthorized(_)));

        let err: ApiError = CredentialError::OAuth2 {
            message: "failed to fetch access token".into(),
        }
        .into();
        assert!(matches!(err, ApiError::BadRequest(_)));
    }
}
