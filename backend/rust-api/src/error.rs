use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use thiserror::Error;

use crate::models::AttemptStatus;

/// Outcomes of attempt operations that are not a plain success.
///
/// Rejections and expiry are normal results for the caller; only `Internal`
/// represents a fault.
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error("learner is not entitled to this quiz")]
    NotEntitled,

    #[error("maximum attempts reached ({completed}/{limit})")]
    MaxAttemptsReached { completed: u64, limit: u32 },

    #[error("attempt belongs to another learner")]
    NotOwner,

    #[error("attempt is {current}; this action is not allowed in that state")]
    WrongState { current: AttemptStatus },

    #[error("attempt time has expired")]
    Expired { attempt_id: String },

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("quiz is not active")]
    QuizInactive,

    #[error("feedback is already complete; pass force to regenerate")]
    FeedbackAlreadyComplete,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type AttemptResult<T> = Result<T, AttemptError>;

impl AttemptError {
    pub fn code(&self) -> &'static str {
        match self {
            AttemptError::NotEntitled => "NOT_ENTITLED",
            AttemptError::MaxAttemptsReached { .. } => "MAX_ATTEMPTS_REACHED",
            AttemptError::NotOwner => "NOT_OWNER",
            AttemptError::WrongState { .. } => "WRONG_STATE",
            AttemptError::Expired { .. } => "ATTEMPT_EXPIRED",
            AttemptError::NotFound(_) => "NOT_FOUND",
            AttemptError::QuizInactive => "QUIZ_INACTIVE",
            AttemptError::FeedbackAlreadyComplete => "FEEDBACK_ALREADY_COMPLETE",
            AttemptError::InvalidRequest(_) => "INVALID_REQUEST",
            AttemptError::Internal(_) => "SERVICE_ERROR",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AttemptError::NotEntitled | AttemptError::NotOwner => StatusCode::FORBIDDEN,
            AttemptError::MaxAttemptsReached { .. }
            | AttemptError::WrongState { .. }
            | AttemptError::QuizInactive
            | AttemptError::FeedbackAlreadyComplete => StatusCode::CONFLICT,
            AttemptError::Expired { .. } => StatusCode::GONE,
            AttemptError::NotFound(_) => StatusCode::NOT_FOUND,
            AttemptError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            AttemptError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn details(&self) -> Option<Value> {
        match self {
            AttemptError::MaxAttemptsReached { completed, limit } => {
                Some(json!({ "completed": completed, "limit": limit }))
            }
            AttemptError::WrongState { current } => Some(json!({ "status": current })),
            AttemptError::Expired { attempt_id } => Some(json!({ "attempt_id": attempt_id })),
            _ => None,
        }
    }
}

impl From<validator::ValidationErrors> for AttemptError {
    fn from(errors: validator::ValidationErrors) -> Self {
        AttemptError::InvalidRequest(errors.to_string())
    }
}

impl IntoResponse for AttemptError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Internal details stay in the logs.
        let message = match &self {
            AttemptError::Internal(err) => {
                tracing::error!(error = ?err, "Attempt operation failed");
                "Service temporarily unavailable".to_string()
            }
            other => other.to_string(),
        };

        let mut body = json!({
            "code": self.code(),
            "message": message,
            "status": status.as_u16(),
        });
        if let (Some(details), Some(obj)) = (self.details(), body.as_object_mut()) {
            obj.insert("details".to_string(), details);
        }

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_is_distinct_from_rejection() {
        let expired = AttemptError::Expired {
            attempt_id: "a".into(),
        };
        assert_eq!(expired.status_code(), StatusCode::GONE);
        assert_eq!(expired.code(), "ATTEMPT_EXPIRED");
        assert_eq!(AttemptError::NotOwner.status_code(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_max_attempts_carries_counts() {
        let err = AttemptError::MaxAttemptsReached {
            completed: 5,
            limit: 5,
        };
        assert_eq!(err.details(), Some(json!({ "completed": 5, "limit": 5 })));
        assert_eq!(err.to_string(), "maximum attempts reached (5/5)");
    }

    #[test]
    fn test_internal_maps_to_service_error() {
        let err = AttemptError::from(anyhow::anyhow!("mongo down"));
        assert_eq!(err.code(), "SERVICE_ERROR");
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
