use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{cmd, Client};
use tracing::info;

use crate::{
    backend::{BackingStore, ListEnd},
    config::QueueConfig,
    QueueResult,
};

/// Compare-and-delete: only the holder of the token may remove the lock
const UNLOCK_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

const SCAN_BATCH: u32 = 100;

/// Redis-backed store over a reconnecting connection manager
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect to `endpoint`, e.g. `redis://localhost:6379`
    pub async fn connect(endpoint: &str) -> QueueResult<Self> {
        let client = Client::open(endpoint)?;
        let conn = ConnectionManager::new(client).await?;
        info!("Connected to redis at {}", endpoint);
        Ok(Self { conn })
    }

    /// Connect to `config.backing_store_endpoint`
    pub async fn from_config(config: &QueueConfig) -> QueueResult<Self> {
        Self::connect(&config.backing_store_endpoint).await
    }

    /// Wrap an existing connection manager
    pub fn from_manager(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

fn millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl BackingStore for RedisStore {
    async fn get_string(&self, key: &str) -> QueueResult<Option<String>> {
        let mut conn = self.conn();
        let value: Option<String> = cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set_string(&self, key: &str, value: &str, ttl: Option<Duration>) -> QueueResult<()> {
        let mut conn = self.conn();
        let mut set = cmd("SET");
        set.arg(key).arg(value);
        if let Some(ttl) = ttl {
            set.arg("PX").arg(millis(ttl));
        }
        let _: () = set.query_async(&mut conn).await?;
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> QueueResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn();
        let deleted: u64 = cmd("DEL").arg(keys).query_async(&mut conn).await?;
        Ok(deleted)
    }

    async fn exists(&self, key: &str) -> QueueResult<bool> {
        let mut conn = self.conn();
        let count: u64 = cmd("EXISTS").arg(key).query_async(&mut conn).await?;
        Ok(count > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> QueueResult<()> {
        let mut conn = self.conn();
        let _: i64 = cmd("PEXPIRE").arg(key).arg(millis(ttl)).query_async(&mut conn).await?;
        Ok(())
    }

    async fn list_push(&self, key: &str, value: &str, end: ListEnd) -> QueueResult<u64> {
        let mut conn = self.conn();
        let command = match end {
            ListEnd::Front => "LPUSH",
            ListEnd::Back => "RPUSH",
        };
        let len: u64 = cmd(command).arg(key).arg(value).query_async(&mut conn).await?;
        Ok(len)
    }

    async fn list_pop(&self, key: &str, end: ListEnd) -> QueueResult<Option<String>> {
        let mut conn = self.conn();
        let command = match end {
            ListEnd::Front => "LPOP",
            ListEnd::Back => "RPOP",
        };
        let value: Option<String> = cmd(command).arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn list_range(&self, key: &str, start: i64, stop: i64) -> QueueResult<Vec<String>> {
        let mut conn = self.conn();
        let items: Vec<String> = cmd("LRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async(&mut conn)
            .await?;
        Ok(items)
    }

    async fn list_remove(&self, key: &str, value: &str) -> QueueResult<u64> {
        let mut conn = self.conn();
        let removed: u64 = cmd("LREM").arg(key).arg(0).arg(value).query_async(&mut conn).await?;
        Ok(removed)
    }

    async fn list_len(&self, key: &str) -> QueueResult<u64> {
        let mut conn = self.conn();
        let len: u64 = cmd("LLEN").arg(key).query_async(&mut conn).await?;
        Ok(len)
    }

    async fn set_add(&self, key: &str, member: &str) -> QueueResult<bool> {
        let mut conn = self.conn();
        let added: u64 = cmd("SADD").arg(key).arg(member).query_async(&mut conn).await?;
        Ok(added > 0)
    }

    async fn set_remove(&self, key: &str, member: &str) -> QueueResult<bool> {
        let mut conn = self.conn();
        let removed: u64 = cmd("SREM").arg(key).arg(member).query_async(&mut conn).await?;
        Ok(removed > 0)
    }

    async fn set_is_member(&self, key: &str, member: &str) -> QueueResult<bool> {
        let mut conn = self.conn();
        let member: bool = cmd("SISMEMBER").arg(key).arg(member).query_async(&mut conn).await?;
        Ok(member)
    }

    async fn hash_get_all(&self, key: &str) -> QueueResult<HashMap<String, String>> {
        let mut conn = self.conn();
        let hash: HashMap<String, String> = cmd("HGETALL").arg(key).query_async(&mut conn).await?;
        Ok(hash)
    }

    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> QueueResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        let mut hset = cmd("HSET");
        hset.arg(key);
        for (field, value) in fields {
            hset.arg(field).arg(value);
        }
        let _: u64 = hset.query_async(&mut conn).await?;
        Ok(())
    }

    async fn counter_increment(&self, key: &str, field: &str, delta: i64) -> QueueResult<i64> {
        let mut conn = self.conn();
        let value: i64 = cmd("HINCRBY").arg(key).arg(field).arg(delta).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn scan_keys(&self, pattern: &str) -> QueueResult<Vec<String>> {
        let mut conn = self.conn();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may return a key more than once
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> QueueResult<bool> {
        let mut conn = self.conn();
        let reply: Option<String> = cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn unlock(&self, key: &str, token: &str) -> QueueResult<bool> {
        let mut conn = self.conn();
        let deleted: u64 = cmd("EVAL")
            .arg(UNLOCK_SCRIPT)
            .arg(1)
            .arg(key)
            .arg(token)
            .query_async(&mut conn)
            .await?;
        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_from_config_rejects_malformed_endpoint() {
        let config = QueueConfig::new().with_endpoint("not a redis url");
        assert!(RedisStore::from_config(&config).await.is_err());
    }

    #[tokio::test]
    #[ignore = "requires a running redis server"]
    async fn test_lock_roundtrip_against_live_redis() {
        let config = QueueConfig::from_env().unwrap();
        let store = RedisStore::from_config(&config).await.unwrap();
        let key = format!("dog-request-queue-test:{}", uuid::Uuid::new_v4());

        assert!(store.try_lock(&key, "a", Duration::from_secs(5)).await.unwrap());
        assert!(!store.try_lock(&key, "b", Duration::from_secs(5)).await.unwrap());
        assert!(!store.unlock(&key, "b").await.unwrap());
        assert!(store.unlock(&key, "a").await.unwrap());
        assert!(!store.exists(&key).await.unwrap());
    }
}
