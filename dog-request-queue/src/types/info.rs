use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{HeadItem, RequestId};

/// Queue-level metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueInfo {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
    pub total_request_count: u64,
    pub handled_request_count: u64,
    pub ttl_seconds: Option<u64>,
}

impl QueueInfo {
    /// Requests added but not yet handled
    pub fn pending_request_count(&self) -> u64 {
        self.total_request_count.saturating_sub(self.handled_request_count)
    }
}

/// Outcome of adding, updating or handling one request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationInfo {
    pub request_id: RequestId,
    pub unique_key: String,
    pub was_already_present: bool,
    pub was_already_handled: bool,
    pub forefront: bool,
}

/// A request `batch_add_requests` could not store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnprocessedRequest {
    pub unique_key: String,
    pub url: String,
    pub error: String,
}

/// Per-item outcome of a batch insert
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchAddResult {
    pub processed_requests: Vec<OperationInfo>,
    pub unprocessed_requests: Vec<UnprocessedRequest>,
}

/// Read-only view of the queue head
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueHead {
    pub limit: usize,
    pub queue_modified_at: DateTime<Utc>,
    pub items: Vec<HeadItem>,
}

/// Head items leased to the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockedHead {
    pub limit: usize,
    pub queue_modified_at: DateTime<Utc>,
    pub lease_secs: u64,

    /// Some pending request was skipped because another owner holds it
    pub queue_has_locked_requests: bool,

    pub items: Vec<HeadItem>,
}

/// New expiry of a prolonged lease
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProlongResult {
    pub lock_expires_at: DateTime<Utc>,
}
