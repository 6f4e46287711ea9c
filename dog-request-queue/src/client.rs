use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::{
    backend::{with_mutex, with_retry, BackingStore, BoxStream},
    config::QueueConfig,
    head::{HeadScanner, LeasedHead},
    keys::QueueKeys,
    lease::{lease_expiry, LeaseManager},
    metadata::{self, MetadataManager},
    observability::{LiveMetrics, ObservabilityLayer},
    ordering::OrderingLists,
    records::{RecordStore, Staging},
    BatchAddResult, LockedHead, OperationInfo, OwnerToken, ProlongResult, QueueError, QueueEvent,
    QueueHead, QueueInfo, QueueRequest, QueueResult, RequestId, RequestPatch, RequestSource,
    UnprocessedRequest,
};

/// Client for one request queue in a shared backing store.
///
/// Any number of clients, in any number of processes, may point at the same
/// queue. Every compound update runs under the queue's store-wide mutex and
/// every call is retried on transient store failures.
pub struct RequestQueueClient<S: BackingStore + ?Sized> {
    store: Arc<S>,
    queue_id: String,
    keys: QueueKeys,
    config: QueueConfig,
    observability: ObservabilityLayer,
}

impl<S: BackingStore + ?Sized> Clone for RequestQueueClient<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            queue_id: self.queue_id.clone(),
            keys: self.keys.clone(),
            config: self.config.clone(),
            observability: self.observability.clone(),
        }
    }
}

impl<S: BackingStore + ?Sized> RequestQueueClient<S> {
    /// Bind a client to queue `queue_id`. The queue itself is created lazily
    /// by the first `add_request` or by `get_or_create_queue`.
    pub fn new<I: Into<String>>(store: Arc<S>, queue_id: I, config: QueueConfig) -> QueueResult<Self> {
        let queue_id = queue_id.into();
        validate_queue_id(&queue_id)?;
        let keys = QueueKeys::new(&config.namespace_prefix, &queue_id);

        Ok(Self {
            store,
            queue_id,
            keys,
            config,
            observability: ObservabilityLayer::new(),
        })
    }

    /// Share an observability layer between several clients
    pub fn with_observability(mut self, observability: ObservabilityLayer) -> Self {
        self.observability = observability;
        self
    }

    pub fn queue_id(&self) -> &str {
        &self.queue_id
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn observability(&self) -> &ObservabilityLayer {
        &self.observability
    }

    pub fn metrics(&self) -> &LiveMetrics {
        self.observability.metrics()
    }

    /// Events emitted by this client from now on
    pub fn event_stream(&self) -> BoxStream<QueueEvent> {
        self.observability.event_stream()
    }

    /// Store a request unless a live one with the same unique key exists
    #[instrument(skip(self, source), fields(queue = %self.queue_id, url = %source.url))]
    pub async fn add_request(&self, source: RequestSource, forefront: bool) -> QueueResult<OperationInfo> {
        source.validate()?;
        let request = QueueRequest::from_source(source, forefront);
        let request = &request;

        let info = self
            .locked("add_request", move || self.add_once(request))
            .await?;

        if info.was_already_present {
            self.metrics().increment_deduplicated();
            debug!("Request {} already present as {}", info.unique_key, info.request_id);
        } else {
            self.observability.record(QueueEvent::RequestAdded {
                queue: self.queue_id.clone(),
                request_id: info.request_id.clone(),
                unique_key: info.unique_key.clone(),
                forefront: info.forefront,
                at: Utc::now(),
            });
            debug!("Added request {} ({})", info.request_id, info.unique_key);
        }
        Ok(info)
    }

    /// Add every source independently; a failing item never aborts the batch
    #[instrument(skip(self, sources), fields(queue = %self.queue_id, count = sources.len()))]
    pub async fn batch_add_requests(
        &self,
        sources: Vec<RequestSource>,
        forefront: bool,
    ) -> QueueResult<BatchAddResult> {
        let mut result = BatchAddResult::default();

        for source in sources {
            let unique_key = source.resolved_unique_key();
            let url = source.url.clone();
            match self.add_request(source, forefront).await {
                Ok(info) => result.processed_requests.push(info),
                Err(e) => {
                    warn!("Could not add {}: {}", url, e);
                    result.unprocessed_requests.push(UnprocessedRequest {
                        unique_key,
                        url,
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            "Batch add: {} processed, {} unprocessed",
            result.processed_requests.len(),
            result.unprocessed_requests.len()
        );
        Ok(result)
    }

    #[instrument(skip(self), fields(queue = %self.queue_id))]
    pub async fn get_request(&self, request_id: &RequestId) -> QueueResult<QueueRequest> {
        self.retrying("get_request", move || self.get_once(request_id))
            .await
    }

    /// Merge `patch` into a stored request
    #[instrument(skip(self, patch), fields(queue = %self.queue_id))]
    pub async fn update_request(
        &self,
        request_id: &RequestId,
        patch: RequestPatch,
    ) -> QueueResult<OperationInfo> {
        let patch = &patch;
        let request = self
            .locked("update_request", move || self.update_once(request_id, patch))
            .await?;
        Ok(request.operation_info(true))
    }

    /// Remove a request, its dedup entry, its list entry and its lease.
    ///
    /// Queue counters are left as they are.
    #[instrument(skip(self), fields(queue = %self.queue_id))]
    pub async fn delete_request(&self, request_id: &RequestId) -> QueueResult<()> {
        self.locked("delete_request", move || self.delete_once(request_id))
            .await?;

        self.observability.record(QueueEvent::RequestDeleted {
            queue: self.queue_id.clone(),
            request_id: request_id.clone(),
            at: Utc::now(),
        });
        Ok(())
    }

    /// Read-only view of the head; `None` uses the configured default limit
    #[instrument(skip(self), fields(queue = %self.queue_id))]
    pub async fn list_head(&self, limit: Option<usize>) -> QueueResult<QueueHead> {
        let limit = limit.unwrap_or(self.config.default_head_limit);
        validate_limit(limit)?;

        self.retrying("list_head", move || self.list_head_once(limit))
            .await
    }

    /// Lease up to `limit` eligible requests to `owner` for `lease_secs`
    #[instrument(skip(self), fields(queue = %self.queue_id))]
    pub async fn list_and_lock_head(
        &self,
        limit: usize,
        lease_secs: u64,
        owner: &OwnerToken,
    ) -> QueueResult<LockedHead> {
        validate_limit(limit)?;
        lease_expiry(Utc::now(), lease_secs)?;

        let (head, queue_modified_at) = self
            .locked("list_and_lock_head", move || {
                self.lock_head_once(limit, lease_secs, owner)
            })
            .await?;

        if head.skipped_leased > 0 {
            self.metrics().add_contention(head.skipped_leased);
        }
        for request in &head.items {
            if let Some(lock_expires_at) = request.lock_expires_at {
                self.observability.record(QueueEvent::RequestLeased {
                    queue: self.queue_id.clone(),
                    request_id: request.id.clone(),
                    owner: owner.clone(),
                    lock_expires_at,
                    at: Utc::now(),
                });
            }
        }
        debug!("Leased {} of {} requested to {}", head.items.len(), limit, owner);

        Ok(LockedHead {
            limit,
            queue_modified_at,
            lease_secs,
            queue_has_locked_requests: head.queue_has_locked_requests,
            items: head.items.iter().map(QueueRequest::head_item).collect(),
        })
    }

    /// Extend the caller's own lease
    #[instrument(skip(self), fields(queue = %self.queue_id))]
    pub async fn prolong_request_lock(
        &self,
        request_id: &RequestId,
        owner: &OwnerToken,
        lease_secs: u64,
    ) -> QueueResult<ProlongResult> {
        let result = self
            .locked("prolong_request_lock", move || {
                self.prolong_once(request_id, owner, lease_secs)
            })
            .await;

        match result {
            Ok(lock_expires_at) => {
                self.observability.record(QueueEvent::LeaseProlonged {
                    queue: self.queue_id.clone(),
                    request_id: request_id.clone(),
                    lock_expires_at,
                    at: Utc::now(),
                });
                Ok(ProlongResult { lock_expires_at })
            }
            Err(e) => {
                if e.is_contention() {
                    self.metrics().add_contention(1);
                }
                Err(e)
            }
        }
    }

    /// Release the caller's lease. Returns false, without error, when the
    /// caller no longer owns it.
    #[instrument(skip(self), fields(queue = %self.queue_id))]
    pub async fn delete_request_lock(&self, request_id: &RequestId, owner: &OwnerToken) -> QueueResult<bool> {
        let released = self
            .locked("delete_request_lock", move || self.release_once(request_id, owner))
            .await?;

        if released {
            self.observability.record(QueueEvent::LeaseReleased {
                queue: self.queue_id.clone(),
                request_id: request_id.clone(),
                at: Utc::now(),
            });
        }
        Ok(released)
    }

    /// Hand a failed request back: bumps `retry_count` and drops the lease.
    /// With `forefront` the request moves to the back of the forefront list.
    #[instrument(skip(self), fields(queue = %self.queue_id))]
    pub async fn reclaim_request(
        &self,
        request_id: &RequestId,
        owner: &OwnerToken,
        forefront: bool,
    ) -> QueueResult<OperationInfo> {
        let (request, reclaimed) = self
            .locked("reclaim_request", move || {
                self.reclaim_once(request_id, owner, forefront)
            })
            .await?;

        if reclaimed {
            self.observability.record(QueueEvent::RequestReclaimed {
                queue: self.queue_id.clone(),
                request_id: request.id.clone(),
                retry_count: request.retry_count,
                at: Utc::now(),
            });
            debug!("Reclaimed {} (retry {})", request.id, request.retry_count);
        }
        Ok(request.operation_info(true))
    }

    /// Mark a request done. A second call on the same id changes nothing and
    /// reports `was_already_handled`.
    #[instrument(skip(self), fields(queue = %self.queue_id))]
    pub async fn mark_request_handled(&self, request_id: &RequestId) -> QueueResult<OperationInfo> {
        let (request, newly_handled) = self
            .locked("mark_request_handled", move || self.handle_once(request_id))
            .await?;

        if newly_handled {
            self.observability.record(QueueEvent::RequestHandled {
                queue: self.queue_id.clone(),
                request_id: request.id.clone(),
                at: Utc::now(),
            });
        }

        let mut info = request.operation_info(true);
        info.was_already_handled = !newly_handled;
        Ok(info)
    }

    /// Delete every key of the queue, returning how many were removed
    #[instrument(skip(self), fields(queue = %self.queue_id))]
    pub async fn drop(&self) -> QueueResult<u64> {
        let removed = self.locked("drop", move || self.drop_once()).await?;

        self.observability.record(QueueEvent::QueueDropped {
            queue: self.queue_id.clone(),
            at: Utc::now(),
        });
        info!("Dropped queue {} ({} keys)", self.queue_id, removed);
        Ok(removed)
    }

    #[instrument(skip(self), fields(queue = %self.queue_id))]
    pub async fn get_queue_info(&self) -> QueueResult<QueueInfo> {
        self.retrying("get_queue_info", move || self.info_once())
            .await
    }

    #[instrument(skip(self), fields(queue = %self.queue_id))]
    pub async fn get_or_create_queue(&self) -> QueueResult<QueueInfo> {
        self.locked("get_or_create_queue", move || self.get_or_create_once())
            .await
    }

    /// Rename the queue; its id and keys stay the same
    #[instrument(skip(self), fields(queue = %self.queue_id))]
    pub async fn update_queue(&self, name: &str) -> QueueResult<QueueInfo> {
        if name.trim().is_empty() {
            return Err(QueueError::InvalidRequest("queue name must not be empty".to_string()));
        }
        self.locked("update_queue", move || self.rename_once(name))
            .await
    }

    /// Every queue under this client's namespace prefix
    pub async fn list_all_queues(&self) -> QueueResult<Vec<QueueInfo>> {
        let store = &*self.store;
        let prefix = self.config.namespace_prefix.as_str();
        self.retrying("list_all_queues", move || metadata::list_all(store, prefix))
            .await
    }

    /// True once no unhandled request remains in either ordering list.
    ///
    /// Leased requests count as unfinished: their worker may still die and
    /// the lease lapse.
    #[instrument(skip(self), fields(queue = %self.queue_id))]
    pub async fn is_finished(&self) -> QueueResult<bool> {
        self.retrying("is_finished", move || self.is_finished_once())
            .await
    }

    fn records(&self) -> RecordStore<'_, S> {
        RecordStore::new(&*self.store, &self.keys, self.config.ttl())
    }

    fn lists(&self) -> OrderingLists<'_, S> {
        OrderingLists::new(&*self.store, &self.keys, self.config.ttl())
    }

    fn leases(&self) -> LeaseManager<'_, S> {
        LeaseManager::new(&*self.store, &self.keys, self.config.ttl())
    }

    fn metadata(&self) -> MetadataManager<'_, S> {
        MetadataManager::new(&*self.store, &self.keys, &self.queue_id, self.config.ttl_seconds)
    }

    fn scanner(&self) -> HeadScanner<'_, S> {
        HeadScanner::new(&*self.store, &self.keys, self.config.ttl())
    }

    /// Run `op` with transient-failure retries
    async fn retrying<T, F, Fut>(&self, what: &str, op: F) -> QueueResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = QueueResult<T>>,
    {
        let metrics = self.observability.metrics();
        let mut attempt = 0u32;
        with_retry(&self.config.retry, what, || {
            attempt += 1;
            if attempt > 1 {
                metrics.increment_retries();
            }
            op()
        })
        .await
    }

    /// Run `op` under the queue mutex, retrying the whole section on
    /// transient failures and mutex timeouts
    async fn locked<T, F, Fut>(&self, what: &str, op: F) -> QueueResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = QueueResult<T>>,
    {
        let mutex_keys = [self.keys.mutex()];
        let mutex_keys = &mutex_keys;
        let store = &*self.store;
        let mutex = &self.config.mutex;
        let op = &op;

        self.retrying(what, move || with_mutex(store, mutex_keys, mutex, op))
            .await
    }

    // The dedup entry is written last. Until it lands, a retry of this
    // section finds its own staged record and redoes the remaining steps; a
    // failure of that final write alone can count the request twice.
    async fn add_once(&self, request: &QueueRequest) -> QueueResult<OperationInfo> {
        let metadata = self.metadata();
        metadata.get_or_create().await?;

        let records = self.records();
        match records.stage(request).await? {
            Staging::Duplicate(existing) => {
                metadata.touch_accessed().await?;
                return Ok(existing.operation_info(true));
            }
            Staging::Committed => return Ok(request.operation_info(false)),
            Staging::Staged { resumed } => {
                let lists = self.lists();
                if resumed {
                    lists.remove(request.id.as_str()).await?;
                }
                lists.push(request.id.as_str(), request.forefront).await?;
                metadata.increment_total().await?;
                records.commit(request).await?;
            }
        }
        Ok(request.operation_info(false))
    }

    async fn get_once(&self, request_id: &RequestId) -> QueueResult<QueueRequest> {
        self.records().get(request_id.as_str()).await
    }

    async fn update_once(&self, request_id: &RequestId, patch: &RequestPatch) -> QueueResult<QueueRequest> {
        let request = self
            .records()
            .update(request_id.as_str(), patch.clone())
            .await?;
        self.metadata().touch_modified().await?;
        Ok(request)
    }

    async fn delete_once(&self, request_id: &RequestId) -> QueueResult<QueueRequest> {
        let records = self.records();
        records.get(request_id.as_str()).await?;
        self.lists().remove(request_id.as_str()).await?;
        self.leases().clear_key(request_id.as_str()).await?;
        self.metadata().touch_modified().await?;
        records.delete(request_id.as_str()).await
    }

    async fn list_head_once(&self, limit: usize) -> QueueResult<QueueHead> {
        let info = self.metadata().require().await?;
        let items = self.scanner().peek(limit).await?;
        Ok(QueueHead {
            limit,
            queue_modified_at: info.modified_at,
            items,
        })
    }

    async fn lock_head_once(
        &self,
        limit: usize,
        lease_secs: u64,
        owner: &OwnerToken,
    ) -> QueueResult<(LeasedHead, DateTime<Utc>)> {
        let metadata = self.metadata();
        let info = metadata.require().await?;
        let head = self.scanner().lease_head(limit, lease_secs, owner).await?;
        metadata.touch_accessed().await?;
        Ok((head, info.modified_at))
    }

    async fn prolong_once(
        &self,
        request_id: &RequestId,
        owner: &OwnerToken,
        lease_secs: u64,
    ) -> QueueResult<DateTime<Utc>> {
        self.leases()
            .prolong(request_id.as_str(), owner, lease_secs)
            .await
    }

    async fn release_once(&self, request_id: &RequestId, owner: &OwnerToken) -> QueueResult<bool> {
        self.leases().release(request_id.as_str(), owner).await
    }

    async fn reclaim_once(
        &self,
        request_id: &RequestId,
        owner: &OwnerToken,
        forefront: bool,
    ) -> QueueResult<(QueueRequest, bool)> {
        let records = self.records();
        let mut request = records.get(request_id.as_str()).await?;
        if request.is_handled() {
            return Ok((request, false));
        }
        if request.is_leased(Utc::now()) && !request.is_owned_by(owner) {
            return Err(QueueError::NotOwner {
                request_id: request_id.to_string(),
            });
        }

        if forefront {
            self.lists().move_to_forefront(request_id.as_str()).await?;
        }
        self.leases().clear_key(request_id.as_str()).await?;
        self.metadata().touch_modified().await?;

        // saving the record commits the reclaim; everything above is repeatable
        request.retry_count = request.retry_count.saturating_add(1);
        request.clear_lease();
        request.forefront |= forefront;
        records.save(&request).await?;
        Ok((request, true))
    }

    // `handled_at` is written last so a retry after a partial run still
    // counts the request; a failure of that final save alone counts it twice.
    async fn handle_once(&self, request_id: &RequestId) -> QueueResult<(QueueRequest, bool)> {
        let records = self.records();
        let mut request = records.get(request_id.as_str()).await?;
        if request.is_handled() {
            return Ok((request, false));
        }

        self.leases().clear_key(request_id.as_str()).await?;
        self.metadata().increment_handled().await?;
        request.mark_handled(Utc::now());
        records.save(&request).await?;
        Ok((request, true))
    }

    async fn drop_once(&self) -> QueueResult<u64> {
        // the mutex key is released by `locked` once this returns
        let mutex = self.keys.mutex();
        let doomed: Vec<String> = self
            .store
            .scan_keys(&self.keys.pattern())
            .await?
            .into_iter()
            .filter(|key| *key != mutex)
            .collect();
        self.store.delete(&doomed).await
    }

    async fn info_once(&self) -> QueueResult<QueueInfo> {
        self.metadata().require().await
    }

    async fn get_or_create_once(&self) -> QueueResult<QueueInfo> {
        self.metadata().get_or_create().await
    }

    async fn rename_once(&self, name: &str) -> QueueResult<QueueInfo> {
        self.metadata().rename(name).await
    }

    async fn is_finished_once(&self) -> QueueResult<bool> {
        if self.lists().is_empty().await? {
            return Ok(true);
        }
        self.scanner().is_drained().await
    }
}

/// Queue ids become part of every key and of the scan pattern used by `drop`
fn validate_queue_id(queue_id: &str) -> QueueResult<()> {
    if queue_id.is_empty() {
        return Err(QueueError::InvalidRequest("queue id must not be empty".to_string()));
    }
    if let Some(bad) = queue_id.chars().find(|c| matches!(c, ':' | '*' | '?' | '[' | ']')) {
        return Err(QueueError::InvalidRequest(format!(
            "queue id {:?} must not contain {:?}",
            queue_id, bad
        )));
    }
    Ok(())
}

fn validate_limit(limit: usize) -> QueueResult<()> {
    if limit == 0 {
        return Err(QueueError::InvalidRequest("limit must be at least 1".to_string()));
    }
    Ok(())
}
