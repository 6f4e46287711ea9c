use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::{
    backend::BackingStore, keys::QueueKeys, records::RecordStore, OwnerToken, QueueError,
    QueueRequest, QueueResult,
};

/// Longest lease a caller may ask for (30 days)
pub const MAX_LEASE_SECS: u64 = 30 * 24 * 60 * 60;

/// Per-request visibility timeout.
///
/// The lease lives on the record (`lock_owner`, `lock_expires_at`) and is
/// mirrored by a TTL key holding the owner token. The key expires on the
/// store's clock, so acquisition refuses a request while the key still names
/// another owner even if the record's own expiry, written by some other
/// client's clock, says the lease has lapsed. Callers hold the queue mutex
/// around every method here.
pub struct LeaseManager<'a, S: BackingStore + ?Sized> {
    store: &'a S,
    keys: &'a QueueKeys,
    records: RecordStore<'a, S>,
}

impl<'a, S: BackingStore + ?Sized> LeaseManager<'a, S> {
    pub fn new(store: &'a S, keys: &'a QueueKeys, ttl: Option<Duration>) -> Self {
        Self {
            store,
            keys,
            records: RecordStore::new(store, keys, ttl),
        }
    }

    /// Lease a request by id
    pub async fn acquire(
        &self,
        request_id: &str,
        owner: &OwnerToken,
        lease_secs: u64,
    ) -> QueueResult<QueueRequest> {
        let mut request = self.records.get(request_id).await?;
        self.acquire_loaded(&mut request, owner, lease_secs, Utc::now()).await?;
        Ok(request)
    }

    /// Lease an already loaded record, persisting it on success.
    ///
    /// Fails with `AlreadyLeased` while any owner, the caller included, holds
    /// an unexpired lease, or while the lease key is held by another owner.
    pub async fn acquire_loaded(
        &self,
        request: &mut QueueRequest,
        owner: &OwnerToken,
        lease_secs: u64,
        now: DateTime<Utc>,
    ) -> QueueResult<DateTime<Utc>> {
        if request.is_handled() {
            return Err(QueueError::InvalidRequest(format!(
                "request {} is already handled",
                request.id
            )));
        }
        if let Some(expires_at) = request.lock_expires_at.filter(|_| request.is_leased(now)) {
            return Err(QueueError::AlreadyLeased {
                request_id: request.id.to_string(),
                expires_at,
            });
        }

        let lease_key = self.keys.lease(request.id.as_str());
        if let Some(holder) = self.store.get_string(&lease_key).await? {
            if holder != owner.as_str() {
                debug!("Lease key of {} is still held by {}", request.id, holder);
                return Err(QueueError::AlreadyLeased {
                    request_id: request.id.to_string(),
                    expires_at: request.lock_expires_at.unwrap_or(now),
                });
            }
        }

        let expires_at = lease_expiry(now, lease_secs)?;
        self.write_key(request.id.as_str(), owner, expires_at).await?;
        request.start_lease(owner.clone(), now, expires_at);
        self.records.save(request).await?;

        debug!("Leased {} to {} until {}", request.id, owner, expires_at);
        Ok(expires_at)
    }

    /// Extend the caller's own lease to `now + lease_secs`.
    ///
    /// A lapsed lease nobody else picked up may still be prolonged by its owner.
    pub async fn prolong(
        &self,
        request_id: &str,
        owner: &OwnerToken,
        lease_secs: u64,
    ) -> QueueResult<DateTime<Utc>> {
        let mut request = self.records.get(request_id).await?;
        if !request.is_owned_by(owner) {
            return Err(QueueError::NotOwner {
                request_id: request_id.to_string(),
            });
        }

        let expires_at = lease_expiry(Utc::now(), lease_secs)?;
        self.write_key(request_id, owner, expires_at).await?;
        request.lock_expires_at = Some(expires_at);
        self.records.save(&request).await?;

        Ok(expires_at)
    }

    /// Clear the caller's lease; returns false when the caller is not the owner
    pub async fn release(&self, request_id: &str, owner: &OwnerToken) -> QueueResult<bool> {
        let mut request = self.records.get(request_id).await?;
        if !request.is_owned_by(owner) {
            debug!("Ignoring release of {} by non-owner {}", request_id, owner);
            return Ok(false);
        }

        self.store.unlock(&self.keys.lease(request_id), owner.as_str()).await?;
        request.clear_lease();
        self.records.save(&request).await?;
        Ok(true)
    }

    /// Point the lease key at `owner` until `expires_at`, or drop it when
    /// that moment has already passed
    async fn write_key(
        &self,
        request_id: &str,
        owner: &OwnerToken,
        expires_at: DateTime<Utc>,
    ) -> QueueResult<()> {
        match (expires_at - Utc::now()).to_std() {
            Ok(remaining) if !remaining.is_zero() => {
                self.store
                    .set_string(&self.keys.lease(request_id), owner.as_str(), Some(remaining))
                    .await
            }
            _ => self.clear_key(request_id).await,
        }
    }

    /// Drop the lease TTL key regardless of its holder
    pub async fn clear_key(&self, request_id: &str) -> QueueResult<()> {
        self.store.delete(&[self.keys.lease(request_id)]).await?;
        Ok(())
    }
}

/// `now + lease_secs`, rejecting zero and absurdly long leases
pub fn lease_expiry(now: DateTime<Utc>, lease_secs: u64) -> QueueResult<DateTime<Utc>> {
    if lease_secs == 0 || lease_secs > MAX_LEASE_SECS {
        return Err(QueueError::InvalidRequest(format!(
            "lease_secs must be between 1 and {}, got {}",
            MAX_LEASE_SECS, lease_secs
        )));
    }
    chrono::Duration::try_seconds(lease_secs as i64)
        .map(|length| now + length)
        .ok_or_else(|| QueueError::Internal(format!("lease of {}s overflows", lease_secs)))
}

#[cfg(all(test, feature = "memory"))]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryStore;
    use crate::RequestSource;

    async fn seeded(store: &MemoryStore, keys: &QueueKeys) -> QueueRequest {
        let request = QueueRequest::from_source(RequestSource::new("https://x/a"), false);
        RecordStore::new(store, keys, None).save(&request).await.unwrap();
        request
    }

    #[tokio::test]
    async fn test_second_owner_is_refused_while_lease_is_live() {
        let store = MemoryStore::new();
        let keys = QueueKeys::new("t:", "q");
        let request = seeded(&store, &keys).await;
        let leases = LeaseManager::new(&store, &keys, None);

        let (alice, bob) = (OwnerToken::new(), OwnerToken::new());
        leases.acquire(request.id.as_str(), &alice, 60).await.unwrap();

        let err = leases.acquire(request.id.as_str(), &bob, 60).await.unwrap_err();
        assert!(matches!(err, QueueError::AlreadyLeased { .. }));
        assert_eq!(
            store.get_string(&keys.lease(request.id.as_str())).await.unwrap().as_deref(),
            Some(alice.as_str())
        );
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken_over() {
        let store = MemoryStore::new();
        let keys = QueueKeys::new("t:", "q");
        let mut request = seeded(&store, &keys).await;
        let leases = LeaseManager::new(&store, &keys, None);

        let (alice, bob) = (OwnerToken::new(), OwnerToken::new());
        let past = Utc::now() - chrono::Duration::seconds(120);
        leases.acquire_loaded(&mut request, &alice, 60, past).await.unwrap();

        let taken = leases.acquire(request.id.as_str(), &bob, 60).await.unwrap();
        assert!(taken.is_owned_by(&bob));

        // the previous owner can no longer extend or release it
        assert!(matches!(
            leases.prolong(request.id.as_str(), &alice, 60).await,
            Err(QueueError::NotOwner { .. })
        ));
        assert!(!leases.release(request.id.as_str(), &alice).await.unwrap());
    }

    #[tokio::test]
    async fn test_prolong_and_release_by_owner() {
        let store = MemoryStore::new();
        let keys = QueueKeys::new("t:", "q");
        let request = seeded(&store, &keys).await;
        let leases = LeaseManager::new(&store, &keys, None);
        let owner = OwnerToken::new();

        let first = leases.acquire(request.id.as_str(), &owner, 10).await.unwrap();
        let extended = leases.prolong(request.id.as_str(), &owner, 600).await.unwrap();
        assert!(Some(extended) > first.lock_expires_at);

        assert!(leases.release(request.id.as_str(), &owner).await.unwrap());
        assert!(!leases.release(request.id.as_str(), &owner).await.unwrap());
        assert!(!store.exists(&keys.lease(request.id.as_str())).await.unwrap());
    }

    #[tokio::test]
    async fn test_live_lease_key_blocks_takeover() {
        let store = MemoryStore::new();
        let keys = QueueKeys::new("t:", "q");
        let request = seeded(&store, &keys).await;
        let leases = LeaseManager::new(&store, &keys, None);
        let (alice, bob) = (OwnerToken::new(), OwnerToken::new());

        // the record shows no lease, but the store still holds bob's key
        store
            .set_string(&keys.lease(request.id.as_str()), bob.as_str(), Some(Duration::from_secs(60)))
            .await
            .unwrap();

        let err = leases.acquire(request.id.as_str(), &alice, 60).await.unwrap_err();
        assert!(matches!(err, QueueError::AlreadyLeased { .. }));
        assert!(leases.acquire(request.id.as_str(), &bob, 60).await.unwrap().is_owned_by(&bob));
    }

    #[tokio::test]
    async fn test_lease_key_follows_record_expiry() {
        let store = MemoryStore::new();
        let keys = QueueKeys::new("t:", "q");
        let mut request = seeded(&store, &keys).await;
        let leases = LeaseManager::new(&store, &keys, None);
        let owner = OwnerToken::new();

        let past = Utc::now() - chrono::Duration::seconds(120);
        leases.acquire_loaded(&mut request, &owner, 60, past).await.unwrap();
        assert!(!store.exists(&keys.lease(request.id.as_str())).await.unwrap());

        leases.acquire(request.id.as_str(), &owner, 1).await.unwrap();
        assert!(store.exists(&keys.lease(request.id.as_str())).await.unwrap());
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(!store.exists(&keys.lease(request.id.as_str())).await.unwrap());
    }

    #[test]
    fn test_lease_expiry_bounds() {
        let now = Utc::now();
        assert!(lease_expiry(now, 0).is_err());
        assert!(lease_expiry(now, MAX_LEASE_SECS + 1).is_err());
        assert_eq!(lease_expiry(now, 60).unwrap(), now + chrono::Duration::seconds(60));
    }
}
