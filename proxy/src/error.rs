use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Control-plane failures, split by how the caller should react.
/// Validation/NotFound/Conflict are the caller's fault; Transient and
/// Internal are ours and map to 5xx.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Transient(anyhow::Error),

    #[error("{0}")]
    Internal(anyhow::Error),
}

impl ControlError {
    pub fn validation(msg: impl Into<String>) -> Self {
        ControlError::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        ControlError::Conflict(msg.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ControlError::Validation(_) => StatusCode::BAD_REQUEST,
            ControlError::NotFound(_) => StatusCode::NOT_FOUND,
            ControlError::Conflict(_) => StatusCode::CONFLICT,
            ControlError::Transient(_) | ControlError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<anyhow::Error> for ControlError {
    fn from(e: anyhow::Error) -> Self {
        ControlError::Transient(e)
    }
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        if matches!(self, ControlError::Transient(_) | ControlError::Internal(_)) {
            tracing::warn!("control plane error: {:#}", self);
        }
        let body = Json(json!({"error": self.to_string()}));
        (self.status(), body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ControlError::validation("port out of range").status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ControlError::NotFound("user").status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ControlError::conflict("port busy").status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ControlError::Transient(anyhow::anyhow!("db down")).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_not_found_message() {
        assert_eq!(ControlError::NotFound("user").to_string(), "user not found");
    }
}
