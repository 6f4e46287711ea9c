use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
    backend::{BackingStore, ListEnd},
    QueueError, QueueResult,
};

/// A stored value, typed like its remote counterpart
#[derive(Debug, Clone)]
pub(crate) enum Value {
    Str(String),
    List(VecDeque<String>),
    Set(HashSet<String>),
    Hash(HashMap<String, String>),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Self::Str(_) => "string",
            Self::List(_) => "list",
            Self::Set(_) => "set",
            Self::Hash(_) => "hash",
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Slot {
    pub(crate) value: Value,
    pub(crate) expires_at: Option<Instant>,
}

impl Slot {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

#[derive(Debug, Default)]
pub(crate) struct Keyspace {
    pub(crate) slots: HashMap<String, Slot>,
}

impl Keyspace {
    /// Live slot for `key`, dropping it first if it has expired
    fn live(&mut self, key: &str) -> Option<&mut Slot> {
        let now = Instant::now();
        if self.slots.get(key).is_some_and(|slot| slot.is_expired(now)) {
            self.slots.remove(key);
        }
        self.slots.get_mut(key)
    }

    fn live_value(&mut self, key: &str) -> Option<&mut Value> {
        self.live(key).map(|slot| &mut slot.value)
    }

    /// Live value for `key`, created with `init` when absent
    fn entry(&mut self, key: &str, init: fn() -> Value) -> &mut Value {
        let now = Instant::now();
        let slot = self.slots.entry(key.to_string()).or_insert_with(|| Slot {
            value: init(),
            expires_at: None,
        });
        if slot.is_expired(now) {
            *slot = Slot {
                value: init(),
                expires_at: None,
            };
        }
        &mut slot.value
    }

    /// Drop collections that became empty, as a remote store does
    fn drop_if_empty(&mut self, key: &str) {
        let empty = match self.slots.get(key).map(|slot| &slot.value) {
            Some(Value::List(list)) => list.is_empty(),
            Some(Value::Set(set)) => set.is_empty(),
            Some(Value::Hash(hash)) => hash.is_empty(),
            _ => false,
        };
        if empty {
            self.slots.remove(key);
        }
    }

    pub(crate) fn purge_expired(&mut self) -> usize {
        let now = Instant::now();
        let before = self.slots.len();
        self.slots.retain(|_, slot| !slot.is_expired(now));
        before - self.slots.len()
    }
}

fn wrong_type(key: &str, value: &Value) -> QueueError {
    QueueError::StoreUnavailable(format!(
        "WRONGTYPE operation against key {} holding a {}",
        key,
        value.kind()
    ))
}

/// In-memory backing store for testing and development.
///
/// Clones share the same keyspace, so several queue clients built over clones
/// of one `MemoryStore` behave like several processes sharing a remote store.
pub struct MemoryStore {
    pub(crate) keyspace: Arc<Mutex<Keyspace>>,

    /// Number of upcoming operations that fail with `StoreUnavailable`
    injected_failures: Arc<AtomicU32>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            keyspace: Arc::new(Mutex::new(Keyspace::default())),
            injected_failures: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Make the next `count` operations fail as if the store were unreachable (test helper)
    pub fn inject_failures(&self, count: u32) {
        self.injected_failures.store(count, Ordering::SeqCst);
    }

    /// Number of live keys (test helper)
    pub fn key_count(&self) -> usize {
        let mut keyspace = self.keyspace.lock();
        keyspace.purge_expired();
        keyspace.slots.len()
    }

    fn check_available(&self) -> QueueResult<()> {
        let tripped = self
            .injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if tripped {
            return Err(QueueError::StoreUnavailable("injected failure".to_string()));
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for MemoryStore {
    fn clone(&self) -> Self {
        Self {
            keyspace: self.keyspace.clone(),
            injected_failures: self.injected_failures.clone(),
        }
    }
}

fn new_list() -> Value {
    Value::List(VecDeque::new())
}

fn new_set() -> Value {
    Value::Set(HashSet::new())
}

fn new_hash() -> Value {
    Value::Hash(HashMap::new())
}

/// Resolve an inclusive, possibly negative, range against a list of `len` items
fn resolve_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len || stop < 0 {
        return None;
    }
    Some((start as usize, stop as usize))
}

/// Glob match supporting `*` only
pub(crate) fn glob_match(pattern: &str, key: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == key;
    }

    let first = parts[0];
    let last = parts[parts.len() - 1];
    if !key.starts_with(first) || key.len() < first.len() + last.len() || !key.ends_with(last) {
        return false;
    }

    let mut rest = &key[first.len()..key.len() - last.len()];
    for middle in &parts[1..parts.len() - 1] {
        match rest.find(middle) {
            Some(pos) => rest = &rest[pos + middle.len()..],
            None => return false,
        }
    }
    true
}

#[async_trait]
impl BackingStore for MemoryStore {
    async fn get_string(&self, key: &str) -> QueueResult<Option<String>> {
        self.check_available()?;
        let mut keyspace = self.keyspace.lock();
        match keyspace.live_value(key) {
            None => Ok(None),
            Some(Value::Str(value)) => Ok(Some(value.clone())),
            Some(other) => Err(wrong_type(key, other)),
        }
    }

    async fn set_string(&self, key: &str, value: &str, ttl: Option<Duration>) -> QueueResult<()> {
        self.check_available()?;
        let mut keyspace = self.keyspace.lock();
        keyspace.slots.insert(
            key.to_string(),
            Slot {
                value: Value::Str(value.to_string()),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> QueueResult<u64> {
        self.check_available()?;
        let mut keyspace = self.keyspace.lock();
        let mut deleted = 0;
        for key in keys {
            if keyspace.live(key).is_some() {
                keyspace.slots.remove(key);
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn exists(&self, key: &str) -> QueueResult<bool> {
        self.check_available()?;
        Ok(self.keyspace.lock().live(key).is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> QueueResult<()> {
        self.check_available()?;
        if let Some(slot) = self.keyspace.lock().live(key) {
            slot.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn list_push(&self, key: &str, value: &str, end: ListEnd) -> QueueResult<u64> {
        self.check_available()?;
        let mut keyspace = self.keyspace.lock();
        match keyspace.entry(key, new_list) {
            Value::List(list) => {
                match end {
                    ListEnd::Front => list.push_front(value.to_string()),
                    ListEnd::Back => list.push_back(value.to_string()),
                }
                Ok(list.len() as u64)
            }
            other => Err(wrong_type(key, other)),
        }
    }

    async fn list_pop(&self, key: &str, end: ListEnd) -> QueueResult<Option<String>> {
        self.check_available()?;
        let mut keyspace = self.keyspace.lock();
        let popped = match keyspace.live_value(key) {
            None => return Ok(None),
            Some(Value::List(list)) => match end {
                ListEnd::Front => list.pop_front(),
                ListEnd::Back => list.pop_back(),
            },
            Some(other) => return Err(wrong_type(key, other)),
        };
        keyspace.drop_if_empty(key);
        Ok(popped)
    }

    async fn list_range(&self, key: &str, start: i64, stop: i64) -> QueueResult<Vec<String>> {
        self.check_available()?;
        let mut keyspace = self.keyspace.lock();
        match keyspace.live_value(key) {
            None => Ok(Vec::new()),
            Some(Value::List(list)) => Ok(match resolve_range(list.len(), start, stop) {
                Some((from, to)) => list.range(from..=to).cloned().collect(),
                None => Vec::new(),
            }),
            Some(other) => Err(wrong_type(key, other)),
        }
    }

    async fn list_remove(&self, key: &str, value: &str) -> QueueResult<u64> {
        self.check_available()?;
        let mut keyspace = self.keyspace.lock();
        let removed = match keyspace.live_value(key) {
            None => return Ok(0),
            Some(Value::List(list)) => {
                let before = list.len();
                list.retain(|item| item != value);
                (before - list.len()) as u64
            }
            Some(other) => return Err(wrong_type(key, other)),
        };
        keyspace.drop_if_empty(key);
        Ok(removed)
    }

    async fn list_len(&self, key: &str) -> QueueResult<u64> {
        self.check_available()?;
        let mut keyspace = self.keyspace.lock();
        match keyspace.live_value(key) {
            None => Ok(0),
            Some(Value::List(list)) => Ok(list.len() as u64),
            Some(other) => Err(wrong_type(key, other)),
        }
    }

    async fn set_add(&self, key: &str, member: &str) -> QueueResult<bool> {
        self.check_available()?;
        let mut keyspace = self.keyspace.lock();
        match keyspace.entry(key, new_set) {
            Value::Set(set) => Ok(set.insert(member.to_string())),
            other => Err(wrong_type(key, other)),
        }
    }

    async fn set_remove(&self, key: &str, member: &str) -> QueueResult<bool> {
        self.check_available()?;
        let mut keyspace = self.keyspace.lock();
        let removed = match keyspace.live_value(key) {
            None => return Ok(false),
            Some(Value::Set(set)) => set.remove(member),
            Some(other) => return Err(wrong_type(key, other)),
        };
        keyspace.drop_if_empty(key);
        Ok(removed)
    }

    async fn set_is_member(&self, key: &str, member: &str) -> QueueResult<bool> {
        self.check_available()?;
        let mut keyspace = self.keyspace.lock();
        match keyspace.live_value(key) {
            None => Ok(false),
            Some(Value::Set(set)) => Ok(set.contains(member)),
            Some(other) => Err(wrong_type(key, other)),
        }
    }

    async fn hash_get_all(&self, key: &str) -> QueueResult<HashMap<String, String>> {
        self.check_available()?;
        let mut keyspace = self.keyspace.lock();
        match keyspace.live_value(key) {
            None => Ok(HashMap::new()),
            Some(Value::Hash(hash)) => Ok(hash.clone()),
            Some(other) => Err(wrong_type(key, other)),
        }
    }

    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> QueueResult<()> {
        self.check_available()?;
        let mut keyspace = self.keyspace.lock();
        match keyspace.entry(key, new_hash) {
            Value::Hash(hash) => {
                for (field, value) in fields {
                    hash.insert(field.clone(), value.clone());
                }
                Ok(())
            }
            other => Err(wrong_type(key, other)),
        }
    }

    async fn counter_increment(&self, key: &str, field: &str, delta: i64) -> QueueResult<i64> {
        self.check_available()?;
        let mut keyspace = self.keyspace.lock();
        match keyspace.entry(key, new_hash) {
            Value::Hash(hash) => {
                let current = match hash.get(field) {
                    Some(raw) => raw.parse::<i64>().map_err(|_| {
                        QueueError::StoreUnavailable(format!("hash value {}.{} is not an integer", key, field))
                    })?,
                    None => 0,
                };
                let next = current + delta;
                hash.insert(field.to_string(), next.to_string());
                Ok(next)
            }
            other => Err(wrong_type(key, other)),
        }
    }

    async fn scan_keys(&self, pattern: &str) -> QueueResult<Vec<String>> {
        self.check_available()?;
        let mut keyspace = self.keyspace.lock();
        keyspace.purge_expired();
        let mut keys: Vec<String> = keyspace
            .slots
            .keys()
            .filter(|key| glob_match(pattern, key))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> QueueResult<bool> {
        self.check_available()?;
        let mut keyspace = self.keyspace.lock();
        if keyspace.live(key).is_some() {
            return Ok(false);
        }
        keyspace.slots.insert(
            key.to_string(),
            Slot {
                value: Value::Str(token.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn unlock(&self, key: &str, token: &str) -> QueueResult<bool> {
        self.check_available()?;
        let mut keyspace = self.keyspace.lock();
        let owned = matches!(keyspace.live_value(key), Some(Value::Str(held)) if held.as_str() == token);
        if owned {
            keyspace.slots.remove(key);
        }
        Ok(owned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_string_ttl_expires() {
        let store = MemoryStore::new();
        store.set_string("k", "v", Some(Duration::from_millis(20))).await.unwrap();
        assert_eq!(store.get_string("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.get_string("k").await.unwrap(), None);
        assert!(!store.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_operations() {
        let store = MemoryStore::new();
        store.list_push("l", "b", ListEnd::Back).await.unwrap();
        store.list_push("l", "c", ListEnd::Back).await.unwrap();
        store.list_push("l", "a", ListEnd::Front).await.unwrap();
        store.list_push("l", "b", ListEnd::Back).await.unwrap();

        assert_eq!(store.list_range("l", 0, -1).await.unwrap(), vec!["a", "b", "c", "b"]);
        assert_eq!(store.list_range("l", 1, 2).await.unwrap(), vec!["b", "c"]);
        assert_eq!(store.list_range("l", -2, -1).await.unwrap(), vec!["c", "b"]);
        assert_eq!(store.list_range("l", 10, 20).await.unwrap(), Vec::<String>::new());

        assert_eq!(store.list_remove("l", "b").await.unwrap(), 2);
        assert_eq!(store.list_len("l").await.unwrap(), 2);
        assert_eq!(store.list_pop("l", ListEnd::Back).await.unwrap().as_deref(), Some("c"));
        assert_eq!(store.list_pop("l", ListEnd::Front).await.unwrap().as_deref(), Some("a"));

        // empty lists disappear
        assert!(!store.exists("l").await.unwrap());
    }

    #[tokio::test]
    async fn test_sets_and_hashes() {
        let store = MemoryStore::new();
        assert!(store.set_add("s", "x").await.unwrap());
        assert!(!store.set_add("s", "x").await.unwrap());
        assert!(store.set_is_member("s", "x").await.unwrap());
        assert!(store.set_remove("s", "x").await.unwrap());
        assert!(!store.set_is_member("s", "x").await.unwrap());

        store
            .hash_set("h", &[("name".to_string(), "books".to_string())])
            .await
            .unwrap();
        assert_eq!(store.counter_increment("h", "total", 1).await.unwrap(), 1);
        assert_eq!(store.counter_increment("h", "total", 2).await.unwrap(), 3);

        let hash = store.hash_get_all("h").await.unwrap();
        assert_eq!(hash.get("name").map(String::as_str), Some("books"));
        assert_eq!(hash.get("total").map(String::as_str), Some("3"));
    }

    #[tokio::test]
    async fn test_wrong_type_is_reported() {
        let store = MemoryStore::new();
        store.set_string("k", "v", None).await.unwrap();
        assert!(store.list_push("k", "x", ListEnd::Back).await.is_err());
    }

    #[tokio::test]
    async fn test_lock_is_compare_and_delete() {
        let store = MemoryStore::new();
        assert!(store.try_lock("m", "a", Duration::from_secs(10)).await.unwrap());
        assert!(!store.try_lock("m", "b", Duration::from_secs(10)).await.unwrap());
        assert!(!store.unlock("m", "b").await.unwrap());
        assert!(store.unlock("m", "a").await.unwrap());
        assert!(store.try_lock("m", "b", Duration::from_secs(10)).await.unwrap());
    }

    #[tokio::test]
    async fn test_scan_keys_with_glob() {
        let store = MemoryStore::new();
        for key in ["p:a:meta", "p:b:meta", "p:a:ids", "other:c:meta"] {
            store.set_string(key, "1", None).await.unwrap();
        }
        assert_eq!(store.scan_keys("p:*:meta").await.unwrap(), vec!["p:a:meta", "p:b:meta"]);
        assert_eq!(store.scan_keys("p:a:*").await.unwrap(), vec!["p:a:ids", "p:a:meta"]);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let store = MemoryStore::new();
        store.inject_failures(2);
        assert!(matches!(store.get_string("k").await, Err(QueueError::StoreUnavailable(_))));
        assert!(matches!(store.exists("k").await, Err(QueueError::StoreUnavailable(_))));
        assert!(store.get_string("k").await.is_ok());
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("a*", "abc"));
        assert!(glob_match("*c", "abc"));
        assert!(glob_match("a*c", "abc"));
        assert!(glob_match("a*b*c", "aXbYc"));
        assert!(!glob_match("a*b*c", "aXc"));
        assert!(!glob_match("abc", "abcd"));
        assert!(!glob_match("ab*ba", "aba"));
    }
}
