//! # dog-request-queue: lease-based distributed request queue
//!
//! A work queue for crawl requests shared by many worker processes through
//! one remote store. Requests are deduplicated by a business-level unique
//! key, dispatched forefront-first and FIFO within each class, and handed out
//! under time-bounded leases instead of being popped, so a crashed worker's
//! requests become eligible again once its lease lapses.
//!
//! Every compound update runs under a short-lived store-wide mutex, and
//! transient store failures are retried with bounded exponential backoff.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dog_request_queue::prelude::*;
//!
//! # async fn run() -> QueueResult<()> {
//! let store = Arc::new(MemoryStore::new());
//! let queue = RequestQueue::open(store, "books", QueueConfig::default()).await?;
//!
//! queue.add_request(RequestSource::new("https://example.com/a"), false).await?;
//!
//! while let Some(request) = queue.fetch_next().await? {
//!     // crawl request.url ...
//!     queue.mark_handled(&request.id).await?;
//! }
//! assert!(queue.is_finished().await?);
//! # Ok(())
//! # }
//! ```
//!
//! Use `RedisStore` (feature `redis`) to share a queue between processes.

pub mod backend;
pub mod client;
pub mod config;
pub mod error;
pub mod head;
pub mod keys;
pub mod lease;
pub mod metadata;
pub mod observability;
pub mod ordering;
pub mod provider;
pub mod records;
pub mod types;

pub use backend::{with_mutex, with_retry, BackingStore, BoxStream, ListEnd};
pub use client::RequestQueueClient;
pub use config::{MutexConfig, QueueConfig, RetryPolicy};
pub use error::{QueueError, QueueResult};
pub use provider::RequestQueue;
pub use types::{
    BatchAddResult, HeadItem, HttpMethod, LockedHead, OperationInfo, OwnerToken, ProlongResult,
    QueueEvent, QueueHead, QueueInfo, QueueRequest, RequestId, RequestPatch, RequestSource,
    UnprocessedRequest,
};

pub use observability::{LiveMetrics, MetricsSnapshot, ObservabilityLayer};

#[cfg(feature = "memory")]
pub use backend::memory::{KeySweeper, MemoryStore};

#[cfg(feature = "redis")]
pub use backend::redis::RedisStore;

#[cfg(feature = "tracing-basic")]
pub use observability::{init_json_tracing, init_tracing};

/// Everything a crawler needs to produce and consume requests
pub mod prelude {
    pub use crate::{
        BackingStore, HttpMethod, OperationInfo, OwnerToken, QueueConfig, QueueError, QueueInfo,
        QueueRequest, QueueResult, RequestId, RequestQueue, RequestQueueClient, RequestSource,
    };

    #[cfg(feature = "memory")]
    pub use crate::MemoryStore;

    #[cfg(feature = "redis")]
    pub use crate::RedisStore;
}
