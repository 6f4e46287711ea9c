use std::time::Duration;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info};

use crate::backend::memory::storage::MemoryStore;

/// Background task dropping expired keys from a [`MemoryStore`].
///
/// Reads already ignore expired keys; the sweeper only bounds memory held by
/// keys nobody touches again (lease keys, finished queues with a TTL).
pub struct KeySweeper {
    store: MemoryStore,
    interval: Duration,
}

impl KeySweeper {
    /// Create a sweeper running every 30 seconds
    pub fn new(store: MemoryStore) -> Self {
        Self {
            store,
            interval: Duration::from_secs(30),
        }
    }

    /// Create sweeper with custom interval
    pub fn with_interval(store: MemoryStore, interval: Duration) -> Self {
        Self { store, interval }
    }

    /// Sweep on every tick until `shutdown` flips to true or its sender is dropped.
    ///
    /// Spawn this on the runtime.
    pub async fn start(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.interval);

        info!("Starting key sweeper with interval: {:?}", self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let purged = self.sweep_expired();
            if purged > 0 {
                info!("Purged {} expired keys", purged);
            } else {
                debug!("No expired keys found");
            }
        }

        info!("Key sweeper stopped");
    }

    /// Run one sweep, returning the number of keys dropped
    pub fn sweep_expired(&self) -> usize {
        self.store.keyspace.lock().purge_expired()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackingStore;

    #[tokio::test]
    async fn test_sweep_drops_only_expired_keys() {
        let store = MemoryStore::new();
        store.set_string("short", "1", Some(Duration::from_millis(10))).await.unwrap();
        store.set_string("long", "1", Some(Duration::from_secs(60))).await.unwrap();
        store.set_string("forever", "1", None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;

        let sweeper = KeySweeper::new(store.clone());
        assert_eq!(sweeper.sweep_expired(), 1);
        assert_eq!(sweeper.sweep_expired(), 0);
        assert_eq!(store.key_count(), 2);
    }

    #[tokio::test]
    async fn test_background_sweep_stops_on_shutdown() {
        let store = MemoryStore::new();
        store.set_string("short", "1", Some(Duration::from_millis(5))).await.unwrap();

        let (stop, shutdown) = watch::channel(false);
        let sweeper = KeySweeper::with_interval(store.clone(), Duration::from_millis(10));
        let task = tokio::spawn(sweeper.start(shutdown));

        tokio::time::sleep(Duration::from_millis(60)).await;
        // read the raw slots; `key_count` would purge on its own
        assert!(store.keyspace.lock().slots.is_empty());

        stop.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("sweeper did not stop")
            .unwrap();
    }
}
