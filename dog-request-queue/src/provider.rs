use std::sync::Arc;

use tracing::{debug, info};

use crate::{
    backend::BackingStore, client::RequestQueueClient, config::QueueConfig, BatchAddResult,
    OperationInfo, OwnerToken, QueueInfo, QueueRequest, QueueResult, RequestId, RequestSource,
};

/// Crawler-facing queue.
///
/// Owns a random `client-{uuid}` key used as the lease owner for everything
/// this instance fetches, so several crawler processes can share one queue.
pub struct RequestQueue<S: BackingStore + ?Sized> {
    client: RequestQueueClient<S>,
    client_key: OwnerToken,
    lease_secs: u64,
}

impl<S: BackingStore + ?Sized> RequestQueue<S> {
    /// Open (creating if needed) queue `name`
    pub async fn open<I: Into<String>>(store: Arc<S>, name: I, config: QueueConfig) -> QueueResult<Self> {
        let lease_secs = config.default_lease_secs;
        let client = RequestQueueClient::new(store, name, config)?;
        client.get_or_create_queue().await?;

        let client_key = OwnerToken::new();
        info!("Opened queue {} as {}", client.queue_id(), client_key);

        Ok(Self {
            client,
            client_key,
            lease_secs,
        })
    }

    /// Lease length for requests returned by `fetch_next`
    pub fn with_lease_secs(mut self, lease_secs: u64) -> Self {
        self.lease_secs = lease_secs;
        self
    }

    pub fn client(&self) -> &RequestQueueClient<S> {
        &self.client
    }

    pub fn client_key(&self) -> &OwnerToken {
        &self.client_key
    }

    pub async fn add_request(&self, source: RequestSource, forefront: bool) -> QueueResult<OperationInfo> {
        self.client.add_request(source, forefront).await
    }

    pub async fn add_requests(
        &self,
        sources: Vec<RequestSource>,
        forefront: bool,
    ) -> QueueResult<BatchAddResult> {
        self.client.batch_add_requests(sources, forefront).await
    }

    /// Lease the next eligible request, `None` when nothing is available now.
    ///
    /// `None` does not mean the queue is finished: other workers may hold
    /// leases that can still lapse. Check `is_finished` for that.
    pub async fn fetch_next(&self) -> QueueResult<Option<QueueRequest>> {
        let head = self
            .client
            .list_and_lock_head(1, self.lease_secs, &self.client_key)
            .await?;

        let Some(item) = head.items.into_iter().next() else {
            if head.queue_has_locked_requests {
                debug!("Nothing to fetch, other workers hold the remaining requests");
            }
            return Ok(None);
        };
        self.client.get_request(&item.id).await.map(Some)
    }

    /// Extend the lease on a request this instance fetched
    pub async fn prolong(&self, request_id: &RequestId) -> QueueResult<()> {
        self.client
            .prolong_request_lock(request_id, &self.client_key, self.lease_secs)
            .await?;
        Ok(())
    }

    pub async fn mark_handled(&self, request_id: &RequestId) -> QueueResult<OperationInfo> {
        self.client.mark_request_handled(request_id).await
    }

    /// Give a fetched request back for another attempt
    pub async fn reclaim(&self, request_id: &RequestId, forefront: bool) -> QueueResult<OperationInfo> {
        self.client
            .reclaim_request(request_id, &self.client_key, forefront)
            .await
    }

    pub async fn is_finished(&self) -> QueueResult<bool> {
        self.client.is_finished().await
    }

    pub async fn info(&self) -> QueueResult<QueueInfo> {
        self.client.get_queue_info().await
    }

    /// Delete the queue and everything in it
    pub async fn drop(self) -> QueueResult<()> {
        self.client.drop().await?;
        Ok(())
    }
}

#[cfg(all(test, feature = "memory"))]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryStore;

    #[tokio::test]
    async fn test_fetch_mark_cycle() {
        let store = Arc::new(MemoryStore::new());
        let queue = RequestQueue::open(store, "crawl", QueueConfig::default())
            .await
            .unwrap();
        assert!(queue.client_key().as_str().starts_with("client-"));
        assert!(queue.is_finished().await.unwrap());

        queue
            .add_request(RequestSource::new("https://x/a"), false)
            .await
            .unwrap();
        let request = queue.fetch_next().await.unwrap().unwrap();
        assert_eq!(request.url, "https://x/a");
        assert!(request.is_owned_by(queue.client_key()));
        assert!(queue.fetch_next().await.unwrap().is_none());

        queue.prolong(&request.id).await.unwrap();
        queue.mark_handled(&request.id).await.unwrap();
        assert!(queue.is_finished().await.unwrap());
        assert_eq!(queue.info().await.unwrap().handled_request_count, 1);
    }

    #[tokio::test]
    async fn test_reclaimed_request_is_fetched_again() {
        let store = Arc::new(MemoryStore::new());
        let queue = RequestQueue::open(store.clone(), "crawl", QueueConfig::default())
            .await
            .unwrap();

        queue
            .add_request(RequestSource::new("https://x/a"), false)
            .await
            .unwrap();
        let first = queue.fetch_next().await.unwrap().unwrap();
        queue.reclaim(&first.id, false).await.unwrap();

        let again = queue.fetch_next().await.unwrap().unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(again.retry_count, 1);

        queue.drop().await.unwrap();
        assert_eq!(store.key_count(), 0);
    }
}
