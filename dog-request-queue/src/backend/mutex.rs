use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};
use uuid::Uuid;

use super::BackingStore;
use crate::{config::MutexConfig, QueueError, QueueResult};

/// Run `f` while holding the store-wide mutex on every key in `keys`.
///
/// Keys are taken in sorted order so two callers locking overlapping sets
/// cannot deadlock. Every acquired key is released after `f` finishes, on
/// success and on error alike. Each key is retried `retry_count` times
/// `retry_delay` apart before `LockAcquisitionFailed` is returned.
pub async fn with_mutex<S, F, Fut, T>(
    store: &S,
    keys: &[String],
    config: &MutexConfig,
    f: F,
) -> QueueResult<T>
where
    S: BackingStore + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = QueueResult<T>>,
{
    let mut ordered: Vec<&String> = keys.iter().collect();
    ordered.sort();
    ordered.dedup();

    let token = Uuid::new_v4().to_string();
    let mut held: Vec<&String> = Vec::with_capacity(ordered.len());

    for key in ordered {
        if let Err(e) = acquire(store, key, &token, config).await {
            release_all(store, &held, &token).await;
            return Err(e);
        }
        held.push(key);
    }

    let result = f().await;
    release_all(store, &held, &token).await;
    result
}

async fn acquire<S: BackingStore + ?Sized>(
    store: &S,
    key: &str,
    token: &str,
    config: &MutexConfig,
) -> QueueResult<()> {
    let attempts = config.retry_count + 1;

    for attempt in 1..=attempts {
        if store.try_lock(key, token, config.lock_ttl).await? {
            if attempt > 1 {
                debug!("Acquired mutex {} after {} attempts", key, attempt);
            }
            return Ok(());
        }
        if attempt < attempts {
            tokio::time::sleep(config.retry_delay + jitter(config.retry_delay)).await;
        }
    }

    warn!("Gave up on mutex {} after {} attempts", key, attempts);
    Err(QueueError::LockAcquisitionFailed {
        key: key.to_string(),
        attempts,
    })
}

async fn release_all<S: BackingStore + ?Sized>(store: &S, held: &[&String], token: &str) {
    for key in held.iter().rev() {
        match store.unlock(key, token).await {
            Ok(true) => {}
            // the ttl ran out while we held it; someone else may own it now
            Ok(false) => warn!("Mutex {} expired before release", key),
            Err(e) => warn!("Failed to release mutex {}: {}", key, e),
        }
    }
}

fn jitter(delay: Duration) -> Duration {
    let max = (delay.as_millis() as u64 / 4).max(1);
    Duration::from_millis(rand::thread_rng().gen_range(0..=max))
}
