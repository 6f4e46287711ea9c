use chrono::{DateTime, Utc};
use thiserror::Error;

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

/// Errors surfaced by the request queue
#[derive(Error, Debug, Clone)]
pub enum QueueError {
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Request not found: {0}")]
    RequestNotFound(String),

    #[error("Request {request_id} is leased until {expires_at}")]
    AlreadyLeased {
        request_id: String,
        expires_at: DateTime<Utc>,
    },

    #[error("Caller does not own the lease on request {request_id}")]
    NotOwner { request_id: String },

    #[error("Could not acquire mutex {key} after {attempts} attempts")]
    LockAcquisitionFailed { key: String, attempts: u32 },

    #[error("Backing store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl QueueError {
    /// Transient infrastructure failure; the whole call may be retried from scratch
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LockAcquisitionFailed { .. } | Self::StoreUnavailable(_)
        )
    }

    /// Lease contention; expected in steady state, back off and re-run the dispatch loop
    pub fn is_contention(&self) -> bool {
        matches!(self, Self::AlreadyLeased { .. } | Self::NotOwner { .. })
    }

    /// Check if this is a not-found error for either a queue or a request
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::QueueNotFound(_) | Self::RequestNotFound(_))
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let lock = QueueError::LockAcquisitionFailed {
            key: "q:mutex".to_string(),
            attempts: 10,
        };
        assert!(lock.is_retryable());
        assert!(!lock.is_contention());

        let leased = QueueError::AlreadyLeased {
            request_id: "r1".to_string(),
            expires_at: Utc::now(),
        };
        assert!(leased.is_contention());
        assert!(!leased.is_retryable());

        assert!(QueueError::RequestNotFound("r1".to_string()).is_not_found());
        assert!(!QueueError::StoreUnavailable("down".to_string()).is_not_found());
    }

    #[test]
    fn test_serde_json_error_maps_to_serialization() {
        let err: QueueError = serde_json::from_str::<u32>("not a number").unwrap_err().into();
        assert!(matches!(err, QueueError::Serialization(_)));
    }
}
