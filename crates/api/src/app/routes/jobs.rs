use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};

use jobforge_core::{DEFAULT_KIND, JobId, JobState, Payload};
use jobforge_infra::store::JobFilter;

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::RequestId;

pub fn router() -> Router {
    Router::new()
        .route("/", post(submit_job).get(list_jobs))
        .route("/stats", get(job_stats))
        .route("/:id", get(get_job))
        .route("/:id/cancel", post(cancel_job))
}

pub async fn submit_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(request_id): Extension<RequestId>,
    body: Result<Json<dto::SubmitJobRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match body {
        Ok(b) => b,
        Err(e) => return errors::json_error(e.status(), "invalid_body", e.body_text()),
    };

    let payload = match Payload::json(&body.payload) {
        Ok(p) => p,
        Err(e) => return errors::domain_error_to_response(e),
    };
    let kind = body.kind.as_deref().unwrap_or(DEFAULT_KIND);

    let id = match services.coordinator.submit_with_kind(kind, payload).await {
        Ok(id) => id,
        Err(e) => return errors::coordinator_error_to_response(e),
    };
    tracing::info!(request_id = %request_id, job_id = %id, kind, "job submitted");

    (
        StatusCode::ACCEPTED,
        Json(dto::SubmitJobResponse {
            id,
            state: JobState::Pending,
        }),
    )
        .into_response()
}

pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::ListJobsQuery>,
) -> axum::response::Response {
    let mut filter = JobFilter::default();
    if let Some(state) = query.state.as_deref() {
        match state.parse::<JobState>() {
            Ok(s) => filter.state = Some(s),
            Err(e) => return errors::domain_error_to_response(e),
        }
    }
    if let Some(kind) = query.kind {
        filter = filter.with_kind(kind);
    }
    let limit = query
        .limit
        .unwrap_or(dto::DEFAULT_LIST_LIMIT)
        .clamp(1, dto::MAX_LIST_LIMIT);
    filter = filter.limit(limit);

    match services.coordinator.list(filter).await {
        Ok(jobs) => {
            let jobs: Vec<dto::JobStatusView> = jobs.into_iter().map(Into::into).collect();
            Json(serde_json::json!({
                "count": jobs.len(),
                "jobs": jobs,
            }))
            .into_response()
        }
        Err(e) => errors::coordinator_error_to_response(e),
    }
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: JobId = match id.parse() {
        Ok(v) => v,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid job id"),
    };

    match services.coordinator.get_status(id).await {
        Ok(status) => Json(dto::JobStatusView::from(status)).into_response(),
        Err(e) => errors::coordinator_error_to_response(e),
    }
}

pub async fn cancel_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: JobId = match id.parse() {
        Ok(v) => v,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid job id"),
    };

    match services.coordinator.cancel(id).await {
        Ok(cancelled) => Json(serde_json::json!({
            "id": id,
            "cancelled": cancelled,
        }))
        .into_response(),
        Err(e) => errors::coordinator_error_to_response(e),
    }
}

pub async fn job_stats(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.coordinator.stats().await {
        Ok(stats) => {
            let total = stats.total();
            Json(serde_json::json!({
                "total": total,
                "by_state": stats,
            }))
            .into_response()
        }
        Err(e) => errors::coordinator_error_to_response(e),
    }
}
