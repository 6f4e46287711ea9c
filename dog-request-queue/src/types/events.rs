use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{OwnerToken, RequestId};

/// Event protocol for structured observability
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum QueueEvent {
    /// A new request was stored
    RequestAdded {
        queue: String,
        request_id: RequestId,
        unique_key: String,
        forefront: bool,
        at: DateTime<Utc>,
    },

    /// A request was leased by a worker
    RequestLeased {
        queue: String,
        request_id: RequestId,
        owner: OwnerToken,
        lock_expires_at: DateTime<Utc>,
        at: DateTime<Utc>,
    },

    /// The lease holder extended its lease
    LeaseProlonged {
        queue: String,
        request_id: RequestId,
        lock_expires_at: DateTime<Utc>,
        at: DateTime<Utc>,
    },

    /// The lease holder gave the request back
    LeaseReleased {
        queue: String,
        request_id: RequestId,
        at: DateTime<Utc>,
    },

    /// A request was handed back for another attempt
    RequestReclaimed {
        queue: String,
        request_id: RequestId,
        retry_count: u32,
        at: DateTime<Utc>,
    },

    /// A request was processed
    RequestHandled {
        queue: String,
        request_id: RequestId,
        at: DateTime<Utc>,
    },

    /// A request was removed
    RequestDeleted {
        queue: String,
        request_id: RequestId,
        at: DateTime<Utc>,
    },

    /// The whole queue was deleted
    QueueDropped {
        queue: String,
        at: DateTime<Utc>,
    },
}

impl QueueEvent {
    /// Get event type name as string
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::RequestAdded { .. } => "request_added",
            Self::RequestLeased { .. } => "request_leased",
            Self::LeaseProlonged { .. } => "lease_prolonged",
            Self::LeaseReleased { .. } => "lease_released",
            Self::RequestReclaimed { .. } => "request_reclaimed",
            Self::RequestHandled { .. } => "request_handled",
            Self::RequestDeleted { .. } => "request_deleted",
            Self::QueueDropped { .. } => "queue_dropped",
        }
    }

    /// Queue the event belongs to
    pub fn queue(&self) -> &str {
        match self {
            Self::RequestAdded { queue, .. }
            | Self::RequestLeased { queue, .. }
            | Self::LeaseProlonged { queue, .. }
            | Self::LeaseReleased { queue, .. }
            | Self::RequestReclaimed { queue, .. }
            | Self::RequestHandled { queue, .. }
            | Self::RequestDeleted { queue, .. }
            | Self::QueueDropped { queue, .. } => queue,
        }
    }

    /// Request the event is about, if any
    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            Self::RequestAdded { request_id, .. }
            | Self::RequestLeased { request_id, .. }
            | Self::LeaseProlonged { request_id, .. }
            | Self::LeaseReleased { request_id, .. }
            | Self::RequestReclaimed { request_id, .. }
            | Self::RequestHandled { request_id, .. }
            | Self::RequestDeleted { request_id, .. } => Some(request_id),
            Self::QueueDropped { .. } => None,
        }
    }

    /// Get the timestamp from any event
    pub fn timestamp(&self) -> &DateTime<Utc> {
        match self {
            Self::RequestAdded { at, .. }
            | Self::RequestLeased { at, .. }
            | Self::LeaseProlonged { at, .. }
            | Self::LeaseReleased { at, .. }
            | Self::RequestReclaimed { at, .. }
            | Self::RequestHandled { at, .. }
            | Self::RequestDeleted { at, .. }
            | Self::QueueDropped { at, .. } => at,
        }
    }
}
