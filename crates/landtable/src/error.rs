//! The gateway's wire-level error: `{code, type, message, detail?}`.
//! Every failure a request can surface is shaped through this type; library
//! errors (formula, state, identifiers) convert into it with their default
//! classification.

use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

use formula::FormulaError;
use models::IdentifierError;
use state::StateError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    NotFound,
    NotAllowed,
    BadRequest,
    RateLimited,
    InternalError,
    TemporarilyUnavailable,
}

impl ErrorKind {
    pub fn default_code(self) -> u16 {
        match self {
            ErrorKind::NotFound => 404,
            ErrorKind::NotAllowed => 403,
            ErrorKind::BadRequest => 400,
            ErrorKind::RateLimited => 429,
            ErrorKind::InternalError => 500,
            ErrorKind::TemporarilyUnavailable => 503,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct ApiError {
    pub code: u16,
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        ApiError {
            code: kind.default_code(),
            kind,
            message: message.into(),
            detail: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn not_allowed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotAllowed, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, message)
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

impl From<FormulaError> for ApiError {
    fn from(err: FormulaError) -> Self {
        match err {
            // Lowering defects are the gateway's bug, not the caller's.
            FormulaError::Internal(_) => ApiError::internal(err.to_string()),
            _ => ApiError::bad_request(err.to_string()),
        }
    }
}

impl From<StateError> for ApiError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::NotFound(_) => ApiError::not_found(err.to_string()),
            StateError::Kv(_) | StateError::Decode { .. } => ApiError::internal(err.to_string()),
        }
    }
}

impl From<IdentifierError> for ApiError {
    fn from(err: IdentifierError) -> Self {
        ApiError::bad_request(err.to_string())
    }
}

impl axum::response::IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status =
            StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, axum::Json(self)).into_response()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn serializes_to_the_wire_shape() {
        let err = ApiError::not_found("workspace myws does not exist");
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            serde_json::json!({
                "code": 404,
                "type": "NOT_FOUND",
                "message": "workspace myws does not exist",
            })
        );

        let err = ApiError::internal("query execution failed")
            .with_detail(serde_json::json!({"sql": "SELECT 1"}));
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            serde_json::json!({
                "code": 500,
                "type": "INTERNAL_ERROR",
                "message": "query execution failed",
                "detail": {"sql": "SELECT 1"},
            })
        );
    }

    #[test]
    fn formula_errors_classify_by_kind() {
        let err: ApiError = FormulaError::Type("variable x does not exist".to_string()).into();
        assert_eq!(err.kind, ErrorKind::BadRequest);
        assert_eq!(err.code, 400);

        let err: ApiError = FormulaError::Internal("unsupported cast".to_string()).into();
        assert_eq!(err.kind, ErrorKind::InternalError);
        assert_eq!(err.code, 500);
    }
}
