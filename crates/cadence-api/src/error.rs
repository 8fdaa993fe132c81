//! API error types and JSON error response formatting.
//!
//! Every failure leaves the API as `{error, message, details}` where `error`
//! is a stable machine-readable code. Callers rely on those codes to tell a
//! compliance stop apart from a stop that simply has not recovered yet.

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use cadence_core::CadenceError;
use cadence_safety::{QuotaDenied, QuotaError, StopError};
use cadence_scheduler::SchedulerError;
use serde::Serialize;
use serde_json::json;

/// JSON error response body.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Machine-readable error code (e.g., "quota_exceeded", "not_found").
    pub error: String,
    /// Human-readable error message.
    pub message: String,
    /// Optional structured details about the error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// API error type that maps to HTTP status codes and JSON responses.
#[derive(Debug)]
pub enum ApiError {
    /// 400 Bad Request - malformed body or invalid parameters.
    BadRequest(String),
    /// 400 Bad Request - a command failed domain validation.
    Validation(String),
    /// 404 Not Found - item, alert or account does not exist.
    NotFound(String),
    /// 409 Conflict - the request is valid but the current state forbids it.
    Conflict {
        code: &'static str,
        message: String,
        details: Option<serde_json::Value>,
    },
    /// 423 Locked - a compliance stop awaits administrative clearance.
    Locked(String),
    /// 429 Too Many Requests - quota ceiling reached.
    QuotaExceeded {
        message: String,
        details: serde_json::Value,
    },
    /// 422 Unprocessable Entity - well-formed but semantically refused.
    UnprocessableEntity { code: &'static str, message: String },
    /// 500 Internal Server Error - unexpected server error.
    Internal(String),
    /// 503 Service Unavailable - account worker not running.
    ServiceUnavailable(String),
}

impl ApiError {
    /// Stable machine-readable code, shared by REST bodies and WebSocket command results.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::Validation(_) => "validation",
            ApiError::NotFound(_) => "not_found",
            ApiError::Conflict { code, .. } => *code,
            ApiError::Locked(_) => "manual_clearance_required",
            ApiError::QuotaExceeded { .. } => "quota_exceeded",
            ApiError::UnprocessableEntity { code, .. } => *code,
            ApiError::Internal(_) => "internal_error",
            ApiError::ServiceUnavailable(_) => "service_unavailable",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let error_code = self.code();
        let (status, message, details) = match self {
            ApiError::BadRequest(msg) | ApiError::Validation(msg) => {
                (StatusCode::BAD_REQUEST, msg, None)
            }
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg, None),
            ApiError::Conflict {
                message, details, ..
            } => (StatusCode::CONFLICT, message, details),
            ApiError::Locked(msg) => (StatusCode::LOCKED, msg, None),
            ApiError::QuotaExceeded { message, details } => {
                (StatusCode::TOO_MANY_REQUESTS, message, Some(details))
            }
            ApiError::UnprocessableEntity { message, .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, message, None)
            }
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg, None),
            ApiError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg, None),
        };

        let body = ErrorBody {
            error: error_code.to_string(),
            message,
            details,
        };

        (status, Json(body)).into_response()
    }
}

fn quota_details(denied: &QuotaDenied) -> serde_json::Value {
    json!({
        "action_type": denied.action_type,
        "window": denied.window,
        "used": denied.used,
        "reserved": denied.reserved,
        "ceiling": denied.ceiling,
    })
}

impl From<StopError> for ApiError {
    fn from(err: StopError) -> Self {
        let message = err.to_string();
        match err {
            StopError::ManualClearanceRequired => ApiError::Locked(message),
            StopError::NotYetEligible {
                estimated_resume_at,
            } => ApiError::Conflict {
                code: "not_eligible",
                message,
                details: Some(json!({ "estimated_resume_at": estimated_resume_at })),
            },
            StopError::StopInProgress => ApiError::Conflict {
                code: "stop_in_progress",
                message,
                details: None,
            },
        }
    }
}

impl From<QuotaError> for ApiError {
    fn from(err: QuotaError) -> Self {
        match err {
            QuotaError::Denied(denied) => ApiError::QuotaExceeded {
                details: quota_details(&denied),
                message: denied.to_string(),
            },
            QuotaError::InvalidLimits(inner) => ApiError::from(inner),
        }
    }
}

impl From<CadenceError> for ApiError {
    fn from(err: CadenceError) -> Self {
        match &err {
            CadenceError::CeilingAboveHardLimit { .. } => ApiError::UnprocessableEntity {
                code: "ceiling_above_hard_limit",
                message: err.to_string(),
            },
            CadenceError::Config(msg) => ApiError::Validation(msg.clone()),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<SchedulerError> for ApiError {
    fn from(err: SchedulerError) -> Self {
        let message = err.to_string();
        match err {
            SchedulerError::QuotaExceeded(denied) => ApiError::QuotaExceeded {
                details: quota_details(&denied),
                message,
            },
            SchedulerError::Stop(stop) => ApiError::from(stop),
            SchedulerError::Quota(quota) => ApiError::from(quota),
            SchedulerError::ItemNotFound(_) | SchedulerError::AlertNotFound(_) => {
                ApiError::NotFound(message)
            }
            SchedulerError::InvalidTransition(from, to) => ApiError::Conflict {
                code: "invalid_transition",
                message,
                details: Some(json!({ "from": from, "to": to })),
            },
            SchedulerError::NotQueued(id, status) => ApiError::Conflict {
                code: "invalid_transition",
                message,
                details: Some(json!({ "item_id": id, "status": status })),
            },
            SchedulerError::DependencyOrderViolation { .. } => ApiError::UnprocessableEntity {
                code: "dependency_order_violation",
                message,
            },
            SchedulerError::UnknownDependency(_) | SchedulerError::Validation(_) => {
                ApiError::Validation(message)
            }
            SchedulerError::WorkerUnavailable => ApiError::ServiceUnavailable(message),
            SchedulerError::Serialization(_) => ApiError::Internal(message),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::types::{ActionType, ItemStatus, QuotaWindow};
    use uuid::Uuid;

    fn status_of(err: ApiError) -> StatusCode {
        err.into_response().status()
    }

    #[test]
    fn test_stop_errors_are_distinguishable() {
        assert_eq!(
            status_of(StopError::ManualClearanceRequired.into()),
            StatusCode::LOCKED
        );
        let not_eligible: ApiError = StopError::NotYetEligible {
            estimated_resume_at: None,
        }
        .into();
        assert!(matches!(
            not_eligible,
            ApiError::Conflict {
                code: "not_eligible",
                ..
            }
        ));
        assert_eq!(
            status_of(StopError::StopInProgress.into()),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn test_quota_exceeded_maps_to_429() {
        let err: ApiError = SchedulerError::QuotaExceeded(QuotaDenied {
            action_type: ActionType::Connection,
            window: QuotaWindow::Daily,
            used: 15,
            reserved: 0,
            ceiling: 15,
        })
        .into();
        match &err {
            ApiError::QuotaExceeded { details, .. } => {
                assert_eq!(details["ceiling"], 15);
                assert_eq!(details["action_type"], "connection");
            }
            other => panic!("unexpected mapping: {other:?}"),
        }
        assert_eq!(status_of(err), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn test_ceiling_above_hard_limit_maps_to_422() {
        let err: ApiError = SchedulerError::Quota(QuotaError::InvalidLimits(
            CadenceError::CeilingAboveHardLimit {
                action_type: ActionType::Connection,
                window: QuotaWindow::Daily,
                requested: 500,
                max: 25,
            },
        ))
        .into();
        assert_eq!(status_of(err), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn test_codes_match_response_bodies() {
        let locked: ApiError = SchedulerError::Stop(StopError::ManualClearanceRequired).into();
        assert_eq!(locked.code(), "manual_clearance_required");
        let invalid: ApiError =
            SchedulerError::InvalidTransition(ItemStatus::Completed, ItemStatus::Cancelled).into();
        assert_eq!(invalid.code(), "invalid_transition");
        assert_eq!(
            ApiError::from(SchedulerError::WorkerUnavailable).code(),
            "service_unavailable"
        );
    }

    #[test]
    fn test_item_errors() {
        assert_eq!(
            status_of(SchedulerError::ItemNotFound(Uuid::new_v4()).into()),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(
                SchedulerError::InvalidTransition(ItemStatus::Completed, ItemStatus::Queued).into()
            ),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(SchedulerError::WorkerUnavailable.into()),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(SchedulerError::Validation("empty target".to_string()).into()),
            StatusCode::BAD_REQUEST
        );
    }
}
