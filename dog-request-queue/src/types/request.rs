use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{HttpMethod, OperationInfo, OwnerToken, RequestId};
use crate::{QueueError, QueueResult};

/// Caller input for `add_request`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestSource {
    /// Target URL
    pub url: String,

    /// Business-level dedup key; derived from `url` when absent
    pub unique_key: Option<String>,

    /// HTTP method
    #[serde(default)]
    pub method: HttpMethod,

    /// Opaque serialized body
    pub payload: Option<String>,

    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Arbitrary caller data carried along with the request
    #[serde(default)]
    pub user_data: serde_json::Value,

    /// Caller-chosen id; generated when absent
    pub id: Option<RequestId>,
}

impl RequestSource {
    /// Create a GET request for `url`
    pub fn new<S: Into<String>>(url: S) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Set the dedup key
    pub fn with_unique_key<S: Into<String>>(mut self, unique_key: S) -> Self {
        self.unique_key = Some(unique_key.into());
        self
    }

    /// Set the HTTP method
    pub fn with_method(mut self, method: HttpMethod) -> Self {
        self.method = method;
        self
    }

    /// Set the request body
    pub fn with_payload<S: Into<String>>(mut self, payload: S) -> Self {
        self.payload = Some(payload.into());
        self
    }

    /// Add a header
    pub fn with_header<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Attach caller data
    pub fn with_user_data(mut self, user_data: serde_json::Value) -> Self {
        self.user_data = user_data;
        self
    }

    /// Use a caller-chosen id instead of a generated one
    pub fn with_id<I: Into<RequestId>>(mut self, id: I) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Effective dedup key: the explicit one, or the url without whitespace and fragment
    pub fn resolved_unique_key(&self) -> String {
        match &self.unique_key {
            Some(key) => key.clone(),
            None => normalize_url(&self.url),
        }
    }

    pub(crate) fn validate(&self) -> QueueResult<()> {
        if self.url.trim().is_empty() {
            return Err(QueueError::InvalidRequest("url must not be empty".to_string()));
        }
        if matches!(&self.unique_key, Some(key) if key.is_empty()) {
            return Err(QueueError::InvalidRequest("unique_key must not be empty".to_string()));
        }
        Ok(())
    }
}

fn normalize_url(url: &str) -> String {
    let trimmed = url.trim();
    match trimmed.split_once('#') {
        Some((base, _fragment)) => base.to_string(),
        None => trimmed.to_string(),
    }
}

/// Stored request record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueRequest {
    pub id: RequestId,
    pub unique_key: String,
    pub url: String,
    pub method: HttpMethod,
    pub retry_count: u32,
    pub payload: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub user_data: serde_json::Value,

    /// Inserted into the forefront list
    pub forefront: bool,

    pub added_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub lock_owner: Option<OwnerToken>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub handled_at: Option<DateTime<Utc>>,
}

impl QueueRequest {
    /// Build a fresh record from caller input
    pub fn from_source(source: RequestSource, forefront: bool) -> Self {
        let unique_key = source.resolved_unique_key();
        Self {
            id: source.id.unwrap_or_default(),
            unique_key,
            url: source.url,
            method: source.method,
            retry_count: 0,
            payload: source.payload,
            headers: source.headers,
            user_data: source.user_data,
            forefront,
            added_at: Utc::now(),
            locked_at: None,
            lock_owner: None,
            lock_expires_at: None,
            handled_at: None,
        }
    }

    pub fn is_handled(&self) -> bool {
        self.handled_at.is_some()
    }

    /// A lease is live while its expiry lies strictly in the future
    pub fn is_leased(&self, now: DateTime<Utc>) -> bool {
        matches!(self.lock_expires_at, Some(expires_at) if expires_at > now)
    }

    /// Neither handled nor under a live lease
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        !self.is_handled() && !self.is_leased(now)
    }

    pub fn is_owned_by(&self, owner: &OwnerToken) -> bool {
        self.lock_owner.as_ref() == Some(owner)
    }

    pub(crate) fn start_lease(&mut self, owner: OwnerToken, now: DateTime<Utc>, expires_at: DateTime<Utc>) {
        self.locked_at = Some(now);
        self.lock_owner = Some(owner);
        self.lock_expires_at = Some(expires_at);
    }

    pub(crate) fn clear_lease(&mut self) {
        self.locked_at = None;
        self.lock_owner = None;
        self.lock_expires_at = None;
    }

    pub(crate) fn mark_handled(&mut self, now: DateTime<Utc>) {
        self.handled_at = Some(now);
        self.clear_lease();
    }

    /// Outcome record for add, update and handle operations
    pub fn operation_info(&self, was_already_present: bool) -> OperationInfo {
        OperationInfo {
            request_id: self.id.clone(),
            unique_key: self.unique_key.clone(),
            was_already_present,
            was_already_handled: self.is_handled(),
            forefront: self.forefront,
        }
    }

    /// Dispatch-facing view
    pub fn head_item(&self) -> HeadItem {
        HeadItem {
            id: self.id.clone(),
            unique_key: self.unique_key.clone(),
            url: self.url.clone(),
            method: self.method,
            retry_count: self.retry_count,
            forefront: self.forefront,
        }
    }
}

/// Fields a caller may change on an existing request.
///
/// `id` and `unique_key` are immutable so the dedup index never goes stale.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestPatch {
    pub url: Option<String>,
    pub method: Option<HttpMethod>,
    pub retry_count: Option<u32>,
    pub payload: Option<String>,
    pub headers: Option<BTreeMap<String, String>>,
    pub user_data: Option<serde_json::Value>,
}

impl RequestPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_url<S: Into<String>>(mut self, url: S) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_method(mut self, method: HttpMethod) -> Self {
        self.method = Some(method);
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    pub fn with_payload<S: Into<String>>(mut self, payload: S) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = Some(headers);
        self
    }

    pub fn with_user_data(mut self, user_data: serde_json::Value) -> Self {
        self.user_data = Some(user_data);
        self
    }

    pub(crate) fn apply(self, request: &mut QueueRequest) -> QueueResult<()> {
        if let Some(url) = self.url {
            if url.trim().is_empty() {
                return Err(QueueError::InvalidRequest("url must not be empty".to_string()));
            }
            request.url = url;
        }
        if let Some(method) = self.method {
            request.method = method;
        }
        if let Some(retry_count) = self.retry_count {
            request.retry_count = retry_count;
        }
        if let Some(payload) = self.payload {
            request.payload = Some(payload);
        }
        if let Some(headers) = self.headers {
            request.headers = headers;
        }
        if let Some(user_data) = self.user_data {
            request.user_data = user_data;
        }
        Ok(())
    }
}

/// Dispatch-facing view of a request returned by head listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadItem {
    pub id: RequestId,
    pub unique_key: String,
    pub url: String,
    pub method: HttpMethod,
    pub retry_count: u32,
    pub forefront: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_unique_key_defaults_to_url_without_fragment() {
        let source = RequestSource::new("  https://x/a#section ");
        assert_eq!(source.resolved_unique_key(), "https://x/a");

        let explicit = RequestSource::new("https://x/a").with_unique_key("a");
        assert_eq!(explicit.resolved_unique_key(), "a");
    }

    #[test]
    fn test_validate_rejects_empty_url() {
        assert!(RequestSource::new("   ").validate().is_err());
        assert!(RequestSource::new("https://x").with_unique_key("").validate().is_err());
        assert!(RequestSource::new("https://x").validate().is_ok());
    }

    #[test]
    fn test_lease_eligibility() {
        let now = Utc::now();
        let mut request = QueueRequest::from_source(RequestSource::new("https://x/a"), false);
        assert!(request.is_eligible(now));

        let owner = OwnerToken::new();
        request.start_lease(owner.clone(), now, now + Duration::seconds(30));
        assert!(request.is_leased(now));
        assert!(!request.is_eligible(now));
        assert!(request.is_owned_by(&owner));

        // an expiry equal to now has lapsed
        assert!(!request.is_leased(now + Duration::seconds(30)));

        request.mark_handled(now);
        assert!(request.is_handled());
        assert!(request.lock_owner.is_none());
        assert!(!request.is_eligible(now + Duration::seconds(60)));
    }

    #[test]
    fn test_patch_merges_only_given_fields() {
        let mut request = QueueRequest::from_source(
            RequestSource::new("https://x/a").with_payload("body"),
            false,
        );
        RequestPatch::new()
            .with_retry_count(2)
            .with_method(HttpMethod::Post)
            .apply(&mut request)
            .unwrap();

        assert_eq!(request.retry_count, 2);
        assert_eq!(request.method, HttpMethod::Post);
        assert_eq!(request.payload.as_deref(), Some("body"));
        assert_eq!(request.url, "https://x/a");

        assert!(RequestPatch::new().with_url("").apply(&mut request).is_err());
    }
}
