use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tracing::info;

use crate::{
    backend::BackingStore,
    keys::{all_meta_pattern, queue_from_meta_key, QueueKeys},
    QueueError, QueueInfo, QueueResult,
};

const ID: &str = "id";
const NAME: &str = "name";
const CREATED_AT: &str = "createdAt";
const MODIFIED_AT: &str = "modifiedAt";
const ACCESSED_AT: &str = "accessedAt";
const TOTAL_REQUEST_COUNT: &str = "totalRequestCount";
const HANDLED_REQUEST_COUNT: &str = "handledRequestCount";
const TTL_SECONDS: &str = "ttlSeconds";

/// Queue-level counters and timestamps, kept in the metadata hash.
///
/// Timestamps are stored as epoch milliseconds. Writers hold the queue mutex,
/// so counter updates are never lost between concurrent producers.
pub struct MetadataManager<'a, S: BackingStore + ?Sized> {
    store: &'a S,
    keys: &'a QueueKeys,
    queue_id: &'a str,
    ttl_seconds: Option<u64>,
}

impl<'a, S: BackingStore + ?Sized> MetadataManager<'a, S> {
    pub fn new(store: &'a S, keys: &'a QueueKeys, queue_id: &'a str, ttl_seconds: Option<u64>) -> Self {
        Self {
            store,
            keys,
            queue_id,
            ttl_seconds,
        }
    }

    pub async fn get(&self) -> QueueResult<Option<QueueInfo>> {
        let hash = self.store.hash_get_all(&self.keys.meta()).await?;
        if hash.is_empty() {
            return Ok(None);
        }
        parse_info(&hash, self.ttl_seconds).map(Some)
    }

    pub async fn require(&self) -> QueueResult<QueueInfo> {
        self.get()
            .await?
            .ok_or_else(|| QueueError::QueueNotFound(self.queue_id.to_string()))
    }

    /// Load the metadata, creating it with zeroed counters when absent
    pub async fn get_or_create(&self) -> QueueResult<QueueInfo> {
        if let Some(existing) = self.get().await? {
            return Ok(existing);
        }

        let now = Utc::now();
        let stamp = now.timestamp_millis().to_string();
        let mut fields = vec![
            (ID.to_string(), self.queue_id.to_string()),
            (NAME.to_string(), self.queue_id.to_string()),
            (CREATED_AT.to_string(), stamp.clone()),
            (MODIFIED_AT.to_string(), stamp.clone()),
            (ACCESSED_AT.to_string(), stamp),
            (TOTAL_REQUEST_COUNT.to_string(), "0".to_string()),
            (HANDLED_REQUEST_COUNT.to_string(), "0".to_string()),
        ];
        if let Some(ttl) = self.ttl_seconds {
            fields.push((TTL_SECONDS.to_string(), ttl.to_string()));
        }
        self.store.hash_set(&self.keys.meta(), &fields).await?;
        self.apply_ttl().await?;

        info!("Created queue {}", self.queue_id);
        Ok(QueueInfo {
            id: self.queue_id.to_string(),
            name: self.queue_id.to_string(),
            created_at: now,
            modified_at: now,
            accessed_at: now,
            total_request_count: 0,
            handled_request_count: 0,
            ttl_seconds: self.ttl_seconds,
        })
    }

    /// Bump `modifiedAt` and `accessedAt`
    pub async fn touch_modified(&self) -> QueueResult<()> {
        let stamp = Utc::now().timestamp_millis().to_string();
        self.store
            .hash_set(
                &self.keys.meta(),
                &[
                    (MODIFIED_AT.to_string(), stamp.clone()),
                    (ACCESSED_AT.to_string(), stamp),
                ],
            )
            .await?;
        self.apply_ttl().await
    }

    pub async fn touch_accessed(&self) -> QueueResult<()> {
        let stamp = Utc::now().timestamp_millis().to_string();
        self.store
            .hash_set(&self.keys.meta(), &[(ACCESSED_AT.to_string(), stamp)])
            .await
    }

    pub async fn increment_total(&self) -> QueueResult<u64> {
        self.increment(TOTAL_REQUEST_COUNT).await
    }

    pub async fn increment_handled(&self) -> QueueResult<u64> {
        self.increment(HANDLED_REQUEST_COUNT).await
    }

    async fn increment(&self, field: &str) -> QueueResult<u64> {
        let value = self.store.counter_increment(&self.keys.meta(), field, 1).await?;
        self.touch_modified().await?;
        u64::try_from(value)
            .map_err(|_| QueueError::Internal(format!("{} went negative: {}", field, value)))
    }

    /// Change the display name; the queue keeps its id and keys
    pub async fn rename(&self, name: &str) -> QueueResult<QueueInfo> {
        self.require().await?;
        self.store
            .hash_set(&self.keys.meta(), &[(NAME.to_string(), name.to_string())])
            .await?;
        self.touch_modified().await?;
        self.require().await
    }

    /// Re-arm the queue TTL on every queue-level key
    pub async fn apply_ttl(&self) -> QueueResult<()> {
        let Some(secs) = self.ttl_seconds else {
            return Ok(());
        };
        let ttl = Duration::from_secs(secs);
        for key in [
            self.keys.meta(),
            self.keys.ids(),
            self.keys.forefront_list(),
            self.keys.normal_list(),
        ] {
            self.store.expire(&key, ttl).await?;
        }
        Ok(())
    }
}

/// Metadata of every queue stored under `prefix`, ordered by id
pub async fn list_all<S: BackingStore + ?Sized>(
    store: &S,
    prefix: &str,
) -> QueueResult<Vec<QueueInfo>> {
    let mut queues = Vec::new();
    for key in store.scan_keys(&all_meta_pattern(prefix)).await? {
        // queue ids never contain ':', anything else is a request or index key
        match queue_from_meta_key(prefix, &key) {
            Some(queue_id) if !queue_id.contains(':') => {}
            _ => continue,
        }
        let hash = store.hash_get_all(&key).await?;
        if hash.is_empty() {
            continue;
        }
        queues.push(parse_info(&hash, None)?);
    }
    queues.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(queues)
}

fn parse_info(hash: &HashMap<String, String>, ttl_seconds: Option<u64>) -> QueueResult<QueueInfo> {
    let id = hash
        .get(ID)
        .cloned()
        .ok_or_else(|| QueueError::Serialization("queue metadata has no id".to_string()))?;
    let name = hash.get(NAME).cloned().unwrap_or_else(|| id.clone());
    let stored_ttl = hash.get(TTL_SECONDS).and_then(|raw| raw.parse().ok());

    Ok(QueueInfo {
        created_at: parse_millis(hash, CREATED_AT)?,
        modified_at: parse_millis(hash, MODIFIED_AT)?,
        accessed_at: parse_millis(hash, ACCESSED_AT)?,
        total_request_count: parse_count(hash, TOTAL_REQUEST_COUNT)?,
        handled_request_count: parse_count(hash, HANDLED_REQUEST_COUNT)?,
        ttl_seconds: stored_ttl.or(ttl_seconds),
        id,
        name,
    })
}

fn parse_millis(hash: &HashMap<String, String>, field: &str) -> QueueResult<DateTime<Utc>> {
    let raw = hash
        .get(field)
        .ok_or_else(|| QueueError::Serialization(format!("queue metadata has no {}", field)))?;
    let millis: i64 = raw
        .parse()
        .map_err(|_| QueueError::Serialization(format!("bad {} in queue metadata: {:?}", field, raw)))?;
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| QueueError::Serialization(format!("{} out of range: {}", field, millis)))
}

fn parse_count(hash: &HashMap<String, String>, field: &str) -> QueueResult<u64> {
    match hash.get(field) {
        Some(raw) => raw
            .parse()
            .map_err(|_| QueueError::Serialization(format!("bad {} in queue metadata: {:?}", field, raw))),
        None => Ok(0),
    }
}

#[cfg(all(test, feature = "memory"))]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryStore;

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let store = MemoryStore::new();
        let keys = QueueKeys::new("t:", "books");
        let meta = MetadataManager::new(&store, &keys, "books", None);

        assert!(meta.get().await.unwrap().is_none());
        let created = meta.get_or_create().await.unwrap();
        meta.increment_total().await.unwrap();

        let again = meta.get_or_create().await.unwrap();
        assert_eq!(again.created_at.timestamp_millis(), created.created_at.timestamp_millis());
        assert_eq!(again.total_request_count, 1);
        assert_eq!(again.pending_request_count(), 1);
    }

    #[tokio::test]
    async fn test_counters_and_rename() {
        let store = MemoryStore::new();
        let keys = QueueKeys::new("t:", "books");
        let meta = MetadataManager::new(&store, &keys, "books", None);
        meta.get_or_create().await.unwrap();

        assert_eq!(meta.increment_total().await.unwrap(), 1);
        assert_eq!(meta.increment_total().await.unwrap(), 2);
        assert_eq!(meta.increment_handled().await.unwrap(), 1);

        let renamed = meta.rename("Books to crawl").await.unwrap();
        assert_eq!(renamed.id, "books");
        assert_eq!(renamed.name, "Books to crawl");
        assert_eq!(renamed.handled_request_count, 1);
        assert!(renamed.modified_at >= renamed.created_at);
    }

    #[tokio::test]
    async fn test_missing_queue() {
        let store = MemoryStore::new();
        let keys = QueueKeys::new("t:", "nope");
        let meta = MetadataManager::new(&store, &keys, "nope", None);

        assert!(matches!(meta.require().await, Err(QueueError::QueueNotFound(_))));
        assert!(matches!(meta.rename("x").await, Err(QueueError::QueueNotFound(_))));
    }

    #[tokio::test]
    async fn test_list_all_skips_foreign_keys() {
        let store = MemoryStore::new();
        for queue in ["b", "a"] {
            let keys = QueueKeys::new("t:", queue);
            MetadataManager::new(&store, &keys, queue, Some(60))
                .get_or_create()
                .await
                .unwrap();
        }
        // a request whose id ends in ":meta" must not show up as a queue
        store
            .set_string("t:a:requests:x:meta", "{}", None)
            .await
            .unwrap();
        let other = QueueKeys::new("other:", "c");
        MetadataManager::new(&store, &other, "c", None)
            .get_or_create()
            .await
            .unwrap();

        let queues = list_all(&store, "t:").await.unwrap();
        let ids: Vec<_> = queues.iter().map(|q| q.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(queues[0].ttl_seconds, Some(60));
    }
}
