//! HTTP API error types.
//!
//! One `ApiError` enum for the whole control plane; `IntoResponse` maps
//! each variant to a status code and a `{"error": {...}}` body carrying
//! the typed `kind` so clients can branch without string matching.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use sm_core::store::StoreError;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn kind(&self) -> &'static str {
        match self {
            ApiError::NotFound(_) => "not_found",
            ApiError::BadRequest(_) => "bad_request",
            ApiError::Conflict(_) => "conflict",
            ApiError::Internal(_) => "internal",
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::UnknownTask(id) => ApiError::NotFound(format!("task {id}")),
            StoreError::StaleWrite { .. } => ApiError::Conflict(e.to_string()),
            StoreError::DuplicateBranch { .. }
            | StoreError::UnknownDependency { .. }
            | StoreError::DependencyCycle { .. }
            | StoreError::InvalidField { .. }
            | StoreError::InvalidTransition { .. }
            | StoreError::Taskfile(_) => ApiError::BadRequest(e.to_string()),
            StoreError::Io(_) => ApiError::Internal(e.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// IntoResponse implementation
// ---------------------------------------------------------------------------

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(json!({
            "error": { "kind": self.kind(), "message": self.to_string() }
        }));
        (status, body).into_response()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn not_found_maps_to_404_with_kind() {
        let response = ApiError::NotFound("task x".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["kind"], "not_found");
        assert!(json["error"]["message"].as_str().unwrap().contains("task x"));
    }

    #[tokio::test]
    async fn store_errors_map_to_api_errors() {
        let api: ApiError = StoreError::UnknownTask("a".to_string()).into();
        assert!(matches!(api, ApiError::NotFound(_)));

        let api: ApiError = StoreError::StaleWrite {
            path: "tasks.md".to_string(),
        }
        .into();
        assert!(matches!(api, ApiError::Conflict(_)));
    }
}
