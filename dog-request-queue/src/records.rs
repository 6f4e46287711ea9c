use std::time::Duration;

use tracing::debug;

use crate::{
    backend::BackingStore, keys::QueueKeys, OperationInfo, QueueError, QueueRequest, QueueResult,
    RequestPatch,
};

/// CRUD over request records and the unique-key dedup index.
///
/// Methods that touch more than one key expect the caller to hold the queue
/// mutex; `load` and `get` are single reads and safe anywhere.
pub struct RecordStore<'a, S: BackingStore + ?Sized> {
    store: &'a S,
    keys: &'a QueueKeys,
    ttl: Option<Duration>,
}

impl<'a, S: BackingStore + ?Sized> RecordStore<'a, S> {
    pub fn new(store: &'a S, keys: &'a QueueKeys, ttl: Option<Duration>) -> Self {
        Self { store, keys, ttl }
    }

    /// Read a record, `None` if it does not exist
    pub async fn load(&self, request_id: &str) -> QueueResult<Option<QueueRequest>> {
        match self.store.get_string(&self.keys.request(request_id)).await? {
            Some(blob) => Ok(Some(serde_json::from_str(&blob)?)),
            None => Ok(None),
        }
    }

    pub async fn get(&self, request_id: &str) -> QueueResult<QueueRequest> {
        self.load(request_id)
            .await?
            .ok_or_else(|| QueueError::RequestNotFound(request_id.to_string()))
    }

    /// Overwrite the stored record, refreshing its expiry.
    ///
    /// The dedup entry's expiry is refreshed along with it, so the entry
    /// never lapses before the record it guards.
    pub async fn save(&self, request: &QueueRequest) -> QueueResult<()> {
        let blob = serde_json::to_string(request)?;
        self.store
            .set_string(&self.keys.request(request.id.as_str()), &blob, self.ttl)
            .await?;
        if let Some(ttl) = self.ttl {
            self.store.expire(&self.keys.unique(&request.unique_key), ttl).await?;
        }
        Ok(())
    }

    /// Live record registered under `unique_key`.
    ///
    /// An index entry whose record has vanished counts as absent.
    pub async fn find_by_unique_key(&self, unique_key: &str) -> QueueResult<Option<QueueRequest>> {
        let Some(request_id) = self.store.get_string(&self.keys.unique(unique_key)).await? else {
            return Ok(None);
        };
        self.load(&request_id).await
    }

    /// Write `request` unless its unique key is already taken.
    ///
    /// The dedup entry is left for `commit`, so an attempt interrupted before
    /// it can be staged again: the second call finds its own record and
    /// reports `Staging::Staged { resumed: true }`.
    pub async fn stage(&self, request: &QueueRequest) -> QueueResult<Staging> {
        if let Some(existing) = self.find_by_unique_key(&request.unique_key).await? {
            if existing.id == request.id {
                return Ok(Staging::Committed);
            }
            debug!("Duplicate unique key {} maps to {}", request.unique_key, existing.id);
            return Ok(Staging::Duplicate(existing));
        }

        let ids = self.keys.ids();
        let resumed = match self.load(request.id.as_str()).await? {
            Some(stored) if stored.unique_key == request.unique_key => true,
            Some(_) => return Err(id_in_use(request)),
            None if self.store.set_is_member(&ids, request.id.as_str()).await? => {
                return Err(id_in_use(request));
            }
            None => false,
        };
        if resumed {
            debug!("Resuming interrupted add of {}", request.id);
        }

        self.save(request).await?;
        self.store.set_add(&ids, request.id.as_str()).await?;
        if let Some(ttl) = self.ttl {
            self.store.expire(&ids, ttl).await?;
        }

        Ok(Staging::Staged { resumed })
    }

    /// Point the dedup entry at a staged record, making it visible to dedup
    pub async fn commit(&self, request: &QueueRequest) -> QueueResult<()> {
        self.store
            .set_string(&self.keys.unique(&request.unique_key), request.id.as_str(), self.ttl)
            .await
    }

    /// Stage and commit in one go, without touching ordering or counters
    pub async fn create(&self, request: &QueueRequest) -> QueueResult<OperationInfo> {
        match self.stage(request).await? {
            Staging::Duplicate(existing) => Ok(existing.operation_info(true)),
            Staging::Committed => Ok(request.operation_info(false)),
            Staging::Staged { .. } => {
                self.commit(request).await?;
                Ok(request.operation_info(false))
            }
        }
    }

    /// Merge `patch` into the stored record
    pub async fn update(&self, request_id: &str, patch: RequestPatch) -> QueueResult<QueueRequest> {
        let mut request = self.get(request_id).await?;
        patch.apply(&mut request)?;
        self.save(&request).await?;
        Ok(request)
    }

    /// Remove the record, its dedup entry and its id-set membership.
    ///
    /// The dedup entry is only removed while it still points at this record.
    pub async fn delete(&self, request_id: &str) -> QueueResult<QueueRequest> {
        let request = self.get(request_id).await?;

        let unique = self.keys.unique(&request.unique_key);
        let mut doomed = vec![self.keys.request(request_id)];
        if self.store.get_string(&unique).await?.as_deref() == Some(request_id) {
            doomed.push(unique);
        }
        self.store.set_remove(&self.keys.ids(), request_id).await?;
        // the record goes last so an interrupted delete can be repeated
        self.store.delete(&doomed).await?;

        Ok(request)
    }
}

/// What `RecordStore::stage` found for a new request
#[derive(Debug)]
pub enum Staging {
    /// Another live record already owns the unique key
    Duplicate(QueueRequest),

    /// The record is written and awaits `commit`; `resumed` when an earlier
    /// interrupted attempt had already written it
    Staged { resumed: bool },

    /// An earlier attempt of this same request went all the way through
    Committed,
}

fn id_in_use(request: &QueueRequest) -> QueueError {
    QueueError::InvalidRequest(format!("request id {} is already in use", request.id))
}

#[cfg(all(test, feature = "memory"))]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryStore;
    use crate::RequestSource;

    fn request(url: &str, unique_key: &str) -> QueueRequest {
        QueueRequest::from_source(RequestSource::new(url).with_unique_key(unique_key), false)
    }

    #[tokio::test]
    async fn test_create_then_duplicate() {
        let store = MemoryStore::new();
        let keys = QueueKeys::new("t:", "q");
        let records = RecordStore::new(&store, &keys, None);

        let first = request("https://x/a", "a");
        let info = records.create(&first).await.unwrap();
        assert!(!info.was_already_present);

        let second = request("https://x/a?again", "a");
        let info = records.create(&second).await.unwrap();
        assert!(info.was_already_present);
        assert_eq!(info.request_id, first.id);
        assert!(records.load(second.id.as_str()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dangling_index_entry_is_overwritten() {
        let store = MemoryStore::new();
        let keys = QueueKeys::new("t:", "q");
        let records = RecordStore::new(&store, &keys, None);

        store.set_string(&keys.unique("a"), "ghost", None).await.unwrap();
        let fresh = request("https://x/a", "a");
        let info = records.create(&fresh).await.unwrap();

        assert!(!info.was_already_present);
        assert_eq!(
            store.get_string(&keys.unique("a")).await.unwrap().as_deref(),
            Some(fresh.id.as_str())
        );
    }

    #[tokio::test]
    async fn test_delete_frees_unique_key() {
        let store = MemoryStore::new();
        let keys = QueueKeys::new("t:", "q");
        let records = RecordStore::new(&store, &keys, None);

        let first = request("https://x/a", "a");
        records.create(&first).await.unwrap();
        records.delete(first.id.as_str()).await.unwrap();

        assert!(records.find_by_unique_key("a").await.unwrap().is_none());
        assert!(!store.set_is_member(&keys.ids(), first.id.as_str()).await.unwrap());
        assert!(matches!(
            records.get(first.id.as_str()).await,
            Err(QueueError::RequestNotFound(_))
        ));

        let again = request("https://x/a", "a");
        assert!(!records.create(&again).await.unwrap().was_already_present);
    }

    #[tokio::test]
    async fn test_caller_chosen_id_collision_is_rejected() {
        let store = MemoryStore::new();
        let keys = QueueKeys::new("t:", "q");
        let records = RecordStore::new(&store, &keys, None);

        let first = QueueRequest::from_source(RequestSource::new("https://x/a").with_id("r1"), false);
        let clash = QueueRequest::from_source(RequestSource::new("https://x/b").with_id("r1"), false);
        records.create(&first).await.unwrap();

        assert!(matches!(
            records.create(&clash).await,
            Err(QueueError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_interrupted_stage_resumes() {
        let store = MemoryStore::new();
        let keys = QueueKeys::new("t:", "q");
        let records = RecordStore::new(&store, &keys, None);

        let first = request("https://x/a", "a");
        assert!(matches!(
            records.stage(&first).await.unwrap(),
            Staging::Staged { resumed: false }
        ));
        // staged but not committed: dedup does not see it yet
        assert!(records.find_by_unique_key("a").await.unwrap().is_none());
        assert!(matches!(
            records.stage(&first).await.unwrap(),
            Staging::Staged { resumed: true }
        ));

        records.commit(&first).await.unwrap();
        assert!(matches!(records.stage(&first).await.unwrap(), Staging::Committed));

        let other = request("https://x/a?again", "a");
        match records.stage(&other).await.unwrap() {
            Staging::Duplicate(existing) => assert_eq!(existing.id, first.id),
            staged => panic!("expected a duplicate, got {:?}", staged),
        }
    }

    #[tokio::test]
    async fn test_save_keeps_dedup_entry_alive() {
        let store = MemoryStore::new();
        let keys = QueueKeys::new("t:", "q");
        let records = RecordStore::new(&store, &keys, Some(Duration::from_millis(300)));

        let first = request("https://x/a", "a");
        records.create(&first).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        records
            .update(first.id.as_str(), RequestPatch::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        // past the first expiry, but the update re-armed both keys
        let found = records.find_by_unique_key("a").await.unwrap();
        assert_eq!(found.map(|request| request.id), Some(first.id.clone()));
        assert!(records.create(&request("https://x/a", "a")).await.unwrap().was_already_present);
    }
}
