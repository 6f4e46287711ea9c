#[cfg(feature = "memory")]
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;
pub mod mutex;
pub mod retry;

use async_trait::async_trait;
use futures_core::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::QueueResult;

pub use mutex::with_mutex;
pub use retry::with_retry;

/// Type alias for boxed streams (stable Rust compatible)
pub type BoxStream<T> = Pin<Box<dyn Stream<Item = T> + Send + 'static>>;

/// Which end of a list to push to or pop from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListEnd {
    Front,
    Back,
}

/// Primitives the queue needs from a shared remote store.
///
/// Every method is a single atomic store operation. Multi-step sequences are
/// made atomic by the caller through [`with_mutex`], built on `try_lock`/`unlock`.
/// Connection and timeout failures surface as `QueueError::StoreUnavailable`.
#[async_trait]
pub trait BackingStore: Send + Sync {
    async fn get_string(&self, key: &str) -> QueueResult<Option<String>>;

    /// Overwrite `key`; `ttl` replaces any previous expiry, `None` clears it
    async fn set_string(&self, key: &str, value: &str, ttl: Option<Duration>) -> QueueResult<()>;

    /// Delete keys, returning how many existed
    async fn delete(&self, keys: &[String]) -> QueueResult<u64>;

    async fn exists(&self, key: &str) -> QueueResult<bool>;

    /// Set an expiry on an existing key; no-op for missing keys
    async fn expire(&self, key: &str, ttl: Duration) -> QueueResult<()>;

    /// Push and return the new list length
    async fn list_push(&self, key: &str, value: &str, end: ListEnd) -> QueueResult<u64>;

    async fn list_pop(&self, key: &str, end: ListEnd) -> QueueResult<Option<String>>;

    /// Inclusive range; negative indexes count from the tail (`-1` is the last element)
    async fn list_range(&self, key: &str, start: i64, stop: i64) -> QueueResult<Vec<String>>;

    /// Remove every occurrence of `value`, returning the number removed
    async fn list_remove(&self, key: &str, value: &str) -> QueueResult<u64>;

    async fn list_len(&self, key: &str) -> QueueResult<u64>;

    /// Returns true if the member was newly added
    async fn set_add(&self, key: &str, member: &str) -> QueueResult<bool>;

    /// Returns true if the member was present
    async fn set_remove(&self, key: &str, member: &str) -> QueueResult<bool>;

    async fn set_is_member(&self, key: &str, member: &str) -> QueueResult<bool>;

    async fn hash_get_all(&self, key: &str) -> QueueResult<HashMap<String, String>>;

    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> QueueResult<()>;

    /// Add `delta` to an integer hash field, returning the new value
    async fn counter_increment(&self, key: &str, field: &str, delta: i64) -> QueueResult<i64>;

    /// Keys matching a glob pattern (`*` wildcard)
    async fn scan_keys(&self, pattern: &str) -> QueueResult<Vec<String>>;

    /// Create `key` holding `token` only if it does not exist; expires after `ttl`
    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> QueueResult<bool>;

    /// Delete `key` only if it still holds `token`
    async fn unlock(&self, key: &str, token: &str) -> QueueResult<bool>;
}

#[async_trait]
impl<S: BackingStore + ?Sized> BackingStore for Arc<S> {
    async fn get_string(&self, key: &str) -> QueueResult<Option<String>> {
        (**self).get_string(key).await
    }

    async fn set_string(&self, key: &str, value: &str, ttl: Option<Duration>) -> QueueResult<()> {
        (**self).set_string(key, value, ttl).await
    }

    async fn delete(&self, keys: &[String]) -> QueueResult<u64> {
        (**self).delete(keys).await
    }

    async fn exists(&self, key: &str) -> QueueResult<bool> {
        (**self).exists(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> QueueResult<()> {
        (**self).expire(key, ttl).await
    }

    async fn list_push(&self, key: &str, value: &str, end: ListEnd) -> QueueResult<u64> {
        (**self).list_push(key, value, end).await
    }

    async fn list_pop(&self, key: &str, end: ListEnd) -> QueueResult<Option<String>> {
        (**self).list_pop(key, end).await
    }

    async fn list_range(&self, key: &str, start: i64, stop: i64) -> QueueResult<Vec<String>> {
        (**self).list_range(key, start, stop).await
    }

    async fn list_remove(&self, key: &str, value: &str) -> QueueResult<u64> {
        (**self).list_remove(key, value).await
    }

    async fn list_len(&self, key: &str) -> QueueResult<u64> {
        (**self).list_len(key).await
    }

    async fn set_add(&self, key: &str, member: &str) -> QueueResult<bool> {
        (**self).set_add(key, member).await
    }

    async fn set_remove(&self, key: &str, member: &str) -> QueueResult<bool> {
        (**self).set_remove(key, member).await
    }

    async fn set_is_member(&self, key: &str, member: &str) -> QueueResult<bool> {
        (**self).set_is_member(key, member).await
    }

    async fn hash_get_all(&self, key: &str) -> QueueResult<HashMap<String, String>> {
        (**self).hash_get_all(key).await
    }

    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> QueueResult<()> {
        (**self).hash_set(key, fields).await
    }

    async fn counter_increment(&self, key: &str, field: &str, delta: i64) -> QueueResult<i64> {
        (**self).counter_increment(key, field, delta).await
    }

    async fn scan_keys(&self, pattern: &str) -> QueueResult<Vec<String>> {
        (**self).scan_keys(pattern).await
    }

    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> QueueResult<bool> {
        (**self).try_lock(key, token, ttl).await
    }

    async fn unlock(&self, key: &str, token: &str) -> QueueResult<bool> {
        (**self).unlock(key, token).await
    }
}
