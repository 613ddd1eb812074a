use std::str::FromStr;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use outreach_core::DomainError;
use outreach_infra::credentials::PoolError;
use outreach_infra::orchestrator::OrchestratorError;
use outreach_infra::queue::QueueError;
use outreach_infra::repository::RepositoryError;
use outreach_infra::tracking::TrackingError;

pub fn orchestrator_error_to_response(err: OrchestratorError) -> axum::response::Response {
    match err {
        OrchestratorError::CampaignNotFound(_) => {
            json_error(StatusCode::NOT_FOUND, "not_found", err.to_string())
        }
        OrchestratorError::TemplateNotFound(_) => {
            json_error(StatusCode::NOT_FOUND, "template_not_found", err.to_string())
        }
        OrchestratorError::TemplateInactive(_) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "template_inactive", err.to_string())
        }
        OrchestratorError::MissingTemplate(_) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "missing_template", err.to_string())
        }
        OrchestratorError::NoLeads(_) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "no_leads", err.to_string())
        }
        OrchestratorError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        OrchestratorError::Domain(e) => domain_error_to_response(e),
        OrchestratorError::Repository(e) => repository_error_to_response(e),
        OrchestratorError::Queue(e) => queue_error_to_response(e),
    }
}

pub fn domain_error_to_response(err: DomainError) -> axum::response::Response {
    match err {
        DomainError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        DomainError::InvalidId(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_id", msg),
        DomainError::InvalidTransition(msg) => {
            json_error(StatusCode::CONFLICT, "invalid_transition", msg)
        }
        DomainError::InvariantViolation(msg) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "invariant_violation", msg)
        }
        DomainError::NotFound => json_error(StatusCode::NOT_FOUND, "not_found", "not found"),
        DomainError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
    }
}

pub fn repository_error_to_response(err: RepositoryError) -> axum::response::Response {
    match err {
        RepositoryError::NotFound { .. } => {
            json_error(StatusCode::NOT_FOUND, "not_found", err.to_string())
        }
        RepositoryError::Duplicate(_) => json_error(StatusCode::CONFLICT, "duplicate", err.to_string()),
        RepositoryError::InUse(_) => json_error(StatusCode::CONFLICT, "in_use", err.to_string()),
        RepositoryError::Conflict { .. } => json_error(StatusCode::CONFLICT, "conflict", err.to_string()),
        RepositoryError::Storage(msg) => store_error(msg),
    }
}

pub fn queue_error_to_response(err: QueueError) -> axum::response::Response {
    match err {
        QueueError::DuplicateJob { .. } => json_error(StatusCode::CONFLICT, "duplicate_job", err.to_string()),
        QueueError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", err.to_string()),
        QueueError::LeaseLost(_) | QueueError::InvalidTransition(_) => {
            json_error(StatusCode::CONFLICT, "conflict", err.to_string())
        }
        QueueError::Storage(msg) => store_error(msg),
    }
}

pub fn pool_error_to_response(err: PoolError) -> axum::response::Response {
    match err {
        PoolError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", err.to_string()),
        PoolError::Duplicate(_) => json_error(StatusCode::CONFLICT, "duplicate", err.to_string()),
        PoolError::Invalid(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        PoolError::Storage(msg) => store_error(msg),
    }
}

pub fn tracking_error_to_response(err: TrackingError) -> axum::response::Response {
    match err {
        TrackingError::UnknownRecipient(_) => {
            json_error(StatusCode::NOT_FOUND, "unknown_recipient", err.to_string())
        }
        TrackingError::CampaignMismatch { .. } => {
            json_error(StatusCode::BAD_REQUEST, "campaign_mismatch", err.to_string())
        }
        TrackingError::Rejected { .. } => json_error(StatusCode::CONFLICT, "rejected", err.to_string()),
        TrackingError::DuplicateEvent(_) => {
            json_error(StatusCode::CONFLICT, "duplicate_event", err.to_string())
        }
        TrackingError::Repository(e) => repository_error_to_response(e),
        TrackingError::Projection(e) => store_error(e.to_string()),
        TrackingError::Storage(msg) => store_error(msg),
    }
}

fn store_error(msg: String) -> axum::response::Response {
    tracing::error!(error = %msg, "storage failure");
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", msg)
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

/// Parse a path id, answering 400 on malformed input.
pub fn parse_id<T: FromStr>(raw: &str, what: &'static str) -> Result<T, axum::response::Response> {
    raw.parse().map_err(|_| {
        json_error(
            StatusCode::BAD_REQUEST,
            "invalid_id",
            format!("invalid {what} id: {raw}"),
        )
    })
}
