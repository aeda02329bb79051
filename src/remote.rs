//! Remote-coordination wire protocol. The service itself — an HTTP queue
//! leasing jobs to polling agents — is a thin layer over a relational store
//! and is not implemented here. This module defines only the typed
//! request/response shapes and row structs an agent or service
//! implementation would (de)serialize against, so the wire contract is
//! documented and testable without standing up an `axum`/`sqlx` service.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Queued,
    Leased,
    Running,
    Ok,
    Failed,
    Cancelled,
}

/// `POST /runs` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRunRequest {
    pub repo: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub workflow_bytes: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRunResponse {
    pub run_id: String,
}

/// `POST /jobs/lease` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseRequest {
    pub agent_id: String,
}

/// `POST /jobs/lease` response body, absent (204) when the queue is idle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseResponse {
    pub job_id: String,
    pub payload: serde_json::Value,
}

/// `POST /jobs/{id}/complete` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteRequest {
    pub status: Status,
    pub logs: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRow {
    pub id: String,
    pub repo: String,
    pub status: Status,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRow {
    pub id: String,
    pub run_id: String,
    pub job_name: String,
    pub status: Status,
    pub payload: serde_json::Value,
    pub logs: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseRow {
    /// Primary key: a job may hold at most one outstanding lease.
    pub job_id: String,
    pub agent_id: String,
    pub leased_at: chrono::DateTime<chrono::Utc>,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

impl LeaseRow {
    /// An expired lease is considered returned to the queue.
    pub fn is_expired(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        now >= self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_run_request_round_trips_through_json() {
        let req = CreateRunRequest { repo: "kiln-ci/kiln".into(), git_ref: "main".into(), workflow_bytes: vec![1, 2, 3] };
        let json = serde_json::to_string(&req).unwrap();
        let back: CreateRunRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.repo, req.repo);
        assert_eq!(back.workflow_bytes, req.workflow_bytes);
    }

    #[test]
    fn expired_lease_is_detected() {
        let now = chrono::Utc::now();
        let lease = LeaseRow {
            job_id: "j1".into(),
            agent_id: "a1".into(),
            leased_at: now - chrono::Duration::minutes(10),
            expires_at: now - chrono::Duration::minutes(5),
        };
        assert!(lease.is_expired(now));
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&Status::Leased).unwrap();
        assert_eq!(json, "\"leased\"");
    }
}
