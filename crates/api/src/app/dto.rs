use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use jobforge_core::{ErrorKind, JobError, JobId, JobState, Payload};
use jobforge_infra::coordinator::JobStatus;

/// Listings are capped at this many jobs per request.
pub const MAX_LIST_LIMIT: usize = 1_000;
pub const DEFAULT_LIST_LIMIT: usize = 100;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    pub kind: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    pub state: Option<String>,
    pub kind: Option<String>,
    pub limit: Option<usize>,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct SubmitJobResponse {
    pub id: JobId,
    pub state: JobState,
}

#[derive(Debug, Serialize)]
pub struct JobErrorView {
    pub kind: ErrorKind,
    pub message: String,
    pub attempt: u32,
}

impl From<JobError> for JobErrorView {
    fn from(e: JobError) -> Self {
        Self {
            kind: e.kind,
            message: e.message,
            attempt: e.attempt,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JobStatusView {
    pub id: JobId,
    pub kind: String,
    pub state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobErrorView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<JobErrorView>,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<JobStatus> for JobStatusView {
    fn from(s: JobStatus) -> Self {
        Self {
            id: s.id,
            kind: s.kind,
            state: s.state,
            result: s.result.as_ref().map(payload_to_json),
            error: s.error.map(Into::into),
            last_error: s.last_error.map(Into::into),
            attempt_count: s.attempt_count,
            max_attempts: s.max_attempts,
            created_at: s.created_at,
            updated_at: s.updated_at,
        }
    }
}

/// JSON payloads are inlined; other schemas are described, not decoded.
pub fn payload_to_json(payload: &Payload) -> serde_json::Value {
    match payload.decode_json::<serde_json::Value>() {
        Ok(value) => value,
        Err(_) => serde_json::json!({
            "schema": payload.schema(),
            "size": payload.len(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opaque_results_are_described() {
        let payload = Payload::new("protobuf/report.v1", vec![1, 2, 3]);
        assert_eq!(
            payload_to_json(&payload),
            serde_json::json!({"schema": "protobuf/report.v1", "size": 3})
        );

        let payload = Payload::json(&serde_json::json!({"y": 2})).unwrap();
        assert_eq!(payload_to_json(&payload), serde_json::json!({"y": 2}));
    }
}
