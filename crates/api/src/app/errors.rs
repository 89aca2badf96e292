use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use jobforge_core::DomainError;
use jobforge_infra::coordinator::CoordinatorError;

pub fn coordinator_error_to_response(err: CoordinatorError) -> axum::response::Response {
    match err {
        CoordinatorError::NotFound(id) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found"))
        }
        CoordinatorError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        CoordinatorError::LeaseLost(id) => json_error(
            StatusCode::CONFLICT,
            "conflict",
            format!("job {id} is no longer held"),
        ),
        CoordinatorError::Invalid(e) => domain_error_to_response(e),
        CoordinatorError::StoreUnavailable(msg) => {
            tracing::warn!(error = %msg, "store unavailable");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", msg)
        }
        CoordinatorError::BrokerUnavailable(msg) => {
            tracing::warn!(error = %msg, "broker unavailable");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "broker_unavailable", msg)
        }
        CoordinatorError::Store(msg) => {
            tracing::error!(error = %msg, "store error");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", msg)
        }
        CoordinatorError::Broker(msg) => {
            tracing::error!(error = %msg, "broker error");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "broker_error", msg)
        }
    }
}

pub fn domain_error_to_response(err: DomainError) -> axum::response::Response {
    match err {
        DomainError::InvalidId(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_id", msg),
        DomainError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        e @ DomainError::InvalidTransition { .. } => {
            json_error(StatusCode::CONFLICT, "invalid_transition", e.to_string())
        }
        DomainError::InvariantViolation(msg) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "invariant_violation", msg)
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
