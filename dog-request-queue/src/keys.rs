//! Key layout of one queue namespace.
//!
//! Every key of queue `q` under prefix `p` starts with `{p}{q}:`, so a single
//! pattern scan finds (and `drop` deletes) the whole queue.

/// Builds the store keys for a single queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    base: String,
}

impl QueueKeys {
    pub fn new(prefix: &str, queue: &str) -> Self {
        Self {
            base: format!("{}{}:", prefix, queue),
        }
    }

    /// Metadata hash (counters, timestamps, name)
    pub fn meta(&self) -> String {
        format!("{}meta", self.base)
    }

    /// Serialized request record
    pub fn request(&self, request_id: &str) -> String {
        format!("{}requests:{}", self.base, request_id)
    }

    /// Dedup index entry: unique key -> request id
    pub fn unique(&self, unique_key: &str) -> String {
        format!("{}unique:{}", self.base, unique_key)
    }

    /// Set of every request id known to the queue
    pub fn ids(&self) -> String {
        format!("{}ids", self.base)
    }

    pub fn forefront_list(&self) -> String {
        format!("{}queue:forefront", self.base)
    }

    pub fn normal_list(&self) -> String {
        format!("{}queue:normal", self.base)
    }

    /// Lease TTL key holding the owner token
    pub fn lease(&self, request_id: &str) -> String {
        format!("{}lock:{}", self.base, request_id)
    }

    /// Store-wide mutex guarding compound updates
    pub fn mutex(&self) -> String {
        format!("{}mutex", self.base)
    }

    /// Pattern matching every key of the queue
    pub fn pattern(&self) -> String {
        format!("{}*", self.base)
    }
}

/// Pattern matching the metadata hash of every queue under `prefix`
pub fn all_meta_pattern(prefix: &str) -> String {
    format!("{}*:meta", prefix)
}

/// Recover the queue name from a metadata key found by [`all_meta_pattern`]
pub fn queue_from_meta_key<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    key.strip_prefix(prefix)?.strip_suffix(":meta")
}
