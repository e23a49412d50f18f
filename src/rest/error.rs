//! HTTP API Error Types
//!
//! Maps the engine error envelope onto HTTP status codes and a uniform
//! `{success: false, error: {code, message}}` body.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::error::{ErrorKind, GraphError};

/// API error response body
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

/// HTTP API error that can be returned from handlers
#[derive(Debug)]
pub struct RestError {
    pub status: StatusCode,
    pub error: ApiError,
}

impl RestError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        RestError {
            status,
            error: ApiError {
                code: code.into(),
                message: message.into(),
            },
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }
}

impl IntoResponse for RestError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({
            "success": false,
            "error": self.error
        }));
        (self.status, body).into_response()
    }
}

impl From<GraphError> for RestError {
    fn from(err: GraphError) -> Self {
        let message = err.to_string();
        match err.kind() {
            ErrorKind::NotFound => RestError::not_found(message),
            ErrorKind::InvalidArgument | ErrorKind::Parse => {
                RestError::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
            }
            ErrorKind::Conflict => RestError::new(StatusCode::CONFLICT, "CONFLICT", message),
            ErrorKind::ResourceExhausted => RestError::new(
                StatusCode::TOO_MANY_REQUESTS,
                "RESOURCE_EXHAUSTED",
                message,
            ),
            ErrorKind::Cancelled => RestError::new(StatusCode::CONFLICT, "CANCELLED", message),
            ErrorKind::Upstream => {
                RestError::new(StatusCode::BAD_GATEWAY, "UPSTREAM_ERROR", message)
            }
            ErrorKind::Io | ErrorKind::Internal => RestError::internal(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_maps_to_404() {
        let err: RestError = GraphError::TaskNotFound("t1".into()).into();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.error.code, "NOT_FOUND");
    }

    #[test]
    fn test_conflict_maps_to_409() {
        let err: RestError = GraphError::DatabaseExists("graph.kg".into()).into();
        assert_eq!(err.status, StatusCode::CONFLICT);
    }

    #[test]
    fn test_backlog_maps_to_429() {
        let err: RestError = GraphError::ResourceExhausted("full".into()).into();
        assert_eq!(err.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.error.code, "RESOURCE_EXHAUSTED");
    }

    #[test]
    fn test_upstream_maps_to_502() {
        let err: RestError = GraphError::Upstream("llm down".into()).into();
        assert_eq!(err.status, StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_invalid_argument_maps_to_400() {
        let err: RestError = GraphError::InvalidArgument("bad name".into()).into();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_into_response_status() {
        let response = RestError::not_found("gone").into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
