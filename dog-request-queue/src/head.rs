use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use crate::{
    backend::BackingStore, keys::QueueKeys, lease::LeaseManager, ordering::OrderingLists,
    records::RecordStore, HeadItem, OwnerToken, QueueError, QueueRequest, QueueResult,
};

/// Requests leased by one `lease_head` call
#[derive(Debug, Default)]
pub struct LeasedHead {
    /// Leased records, forefront first, FIFO within each list
    pub items: Vec<QueueRequest>,

    /// Some pending request was skipped because another owner holds it
    pub queue_has_locked_requests: bool,

    /// Pending requests skipped for a live lease
    pub skipped_leased: u64,

    /// Handled or vanished ids dropped from the ordering lists
    pub pruned: u64,
}

/// Selects eligible requests from the head of the queue.
///
/// Scan order is fixed: the forefront list front to back, then the normal
/// list front to back. Leasing never moves an id, so a request keeps its
/// position across expired leases.
pub struct HeadScanner<'a, S: BackingStore + ?Sized> {
    store: &'a S,
    lists: OrderingLists<'a, S>,
    records: RecordStore<'a, S>,
    leases: LeaseManager<'a, S>,
}

impl<'a, S: BackingStore + ?Sized> HeadScanner<'a, S> {
    pub fn new(store: &'a S, keys: &'a QueueKeys, ttl: Option<Duration>) -> Self {
        Self {
            store,
            lists: OrderingLists::new(store, keys, ttl),
            records: RecordStore::new(store, keys, ttl),
            leases: LeaseManager::new(store, keys, ttl),
        }
    }

    /// Up to `limit` unhandled requests in dispatch order, without leasing.
    ///
    /// Gives no exclusivity; use it for introspection, never for dispatch.
    pub async fn peek(&self, limit: usize) -> QueueResult<Vec<HeadItem>> {
        let mut items = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = self.lists.cursor();

        while let Some((page, _)) = cursor.next_page(self.store).await? {
            for request_id in page {
                if items.len() >= limit {
                    return Ok(items);
                }
                if !seen.insert(request_id.clone()) {
                    continue;
                }
                if let Some(request) = self.records.load(&request_id).await? {
                    if !request.is_handled() {
                        items.push(request.head_item());
                    }
                }
            }
        }
        Ok(items)
    }

    /// Lease up to `limit` eligible requests to `owner`.
    ///
    /// The caller holds the queue mutex for the whole call. Stale ids met on
    /// the way are removed from the ordering lists once the scan is done.
    pub async fn lease_head(
        &self,
        limit: usize,
        lease_secs: u64,
        owner: &OwnerToken,
    ) -> QueueResult<LeasedHead> {
        let now = Utc::now();
        let mut head = LeasedHead::default();
        let mut stale = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = self.lists.cursor();

        'scan: while let Some((page, _)) = cursor.next_page(self.store).await? {
            for request_id in page {
                if head.items.len() >= limit {
                    break 'scan;
                }
                if !seen.insert(request_id.clone()) {
                    continue;
                }

                let Some(mut request) = self.records.load(&request_id).await? else {
                    stale.push(request_id);
                    continue;
                };
                if request.is_handled() {
                    stale.push(request_id);
                    continue;
                }
                if request.is_leased(now) {
                    head.queue_has_locked_requests = true;
                    head.skipped_leased += 1;
                    continue;
                }

                match self
                    .leases
                    .acquire_loaded(&mut request, owner, lease_secs, now)
                    .await
                {
                    Ok(_) => head.items.push(request),
                    Err(QueueError::AlreadyLeased { .. }) => {
                        head.queue_has_locked_requests = true;
                        head.skipped_leased += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        for request_id in stale {
            head.pruned += self.lists.remove(&request_id).await?;
        }
        if head.pruned > 0 {
            debug!("Pruned {} stale ids from the ordering lists", head.pruned);
        }

        Ok(head)
    }

    /// True when no unhandled id remains in either list.
    ///
    /// Leased requests are unfinished work: their lease may still lapse.
    pub async fn is_drained(&self) -> QueueResult<bool> {
        let mut cursor = self.lists.cursor();
        while let Some((page, _)) = cursor.next_page(self.store).await? {
            for request_id in page {
                if let Some(request) = self.records.load(&request_id).await? {
                    if !request.is_handled() {
                        return Ok(false);
                    }
                }
            }
        }
        Ok(true)
    }
}

#[cfg(all(test, feature = "memory"))]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryStore;
    use crate::RequestSource;

    async fn add(store: &MemoryStore, keys: &QueueKeys, unique_key: &str, forefront: bool) -> QueueRequest {
        let request = QueueRequest::from_source(
            RequestSource::new(format!("https://x/{}", unique_key)).with_unique_key(unique_key),
            forefront,
        );
        RecordStore::new(store, keys, None).create(&request).await.unwrap();
        OrderingLists::new(store, keys, None)
            .push(request.id.as_str(), forefront)
            .await
            .unwrap();
        request
    }

    #[tokio::test]
    async fn test_peek_order() {
        let store = MemoryStore::new();
        let keys = QueueKeys::new("t:", "q");
        add(&store, &keys, "f1", true).await;
        add(&store, &keys, "n1", false).await;
        add(&store, &keys, "f2", true).await;

        let scanner = HeadScanner::new(&store, &keys, None);
        let keys_seen: Vec<_> = scanner
            .peek(3)
            .await
            .unwrap()
            .into_iter()
            .map(|item| item.unique_key)
            .collect();
        assert_eq!(keys_seen, vec!["f1", "f2", "n1"]);
        assert_eq!(scanner.peek(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_lease_head_skips_leased_and_prunes_handled() {
        let store = MemoryStore::new();
        let keys = QueueKeys::new("t:", "q");
        let a = add(&store, &keys, "a", false).await;
        let b = add(&store, &keys, "b", false).await;
        let c = add(&store, &keys, "c", false).await;

        let records = RecordStore::new(&store, &keys, None);
        let mut handled = records.get(a.id.as_str()).await.unwrap();
        handled.mark_handled(Utc::now());
        records.save(&handled).await.unwrap();

        let scanner = HeadScanner::new(&store, &keys, None);
        let (alice, bob) = (OwnerToken::new(), OwnerToken::new());

        let first = scanner.lease_head(1, 60, &alice).await.unwrap();
        assert_eq!(first.items.len(), 1);
        assert_eq!(first.items[0].id, b.id);
        assert_eq!(first.pruned, 1);
        assert!(!first.queue_has_locked_requests);

        let second = scanner.lease_head(5, 60, &bob).await.unwrap();
        assert_eq!(second.items.len(), 1);
        assert_eq!(second.items[0].id, c.id);
        assert!(second.queue_has_locked_requests);
        assert_eq!(second.skipped_leased, 1);

        assert_eq!(
            OrderingLists::new(&store, &keys, None).dispatch_order().await.unwrap(),
            vec![b.id.to_string(), c.id.to_string()]
        );
        assert!(!scanner.is_drained().await.unwrap());
    }

    #[tokio::test]
    async fn test_lease_head_respects_foreign_lease_key() {
        let store = MemoryStore::new();
        let keys = QueueKeys::new("t:", "q");
        let a = add(&store, &keys, "a", false).await;
        let b = add(&store, &keys, "b", false).await;

        let (alice, bob) = (OwnerToken::new(), OwnerToken::new());
        store
            .set_string(&keys.lease(a.id.as_str()), bob.as_str(), Some(Duration::from_secs(60)))
            .await
            .unwrap();

        let head = HeadScanner::new(&store, &keys, None)
            .lease_head(2, 60, &alice)
            .await
            .unwrap();
        assert_eq!(head.items.len(), 1);
        assert_eq!(head.items[0].id, b.id);
        assert!(head.queue_has_locked_requests);
    }
}
