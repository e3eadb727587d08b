//! Response Cache: the last response seen for a given request fingerprint,
//! plus a way to await the next response of a given message type.
//!
//! Grounded in the teacher crate's `cache.rs`, which backs a concurrent
//! request/response cache with a `DashMap` rather than a mutex-guarded
//! `HashMap` - reads and writes from unrelated keys never contend.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Notify;

use crate::wire;

pub struct ResponseCache {
    by_fingerprint: DashMap<Vec<u8>, Value>,
    latest_by_msg_type: DashMap<&'static str, Value>,
    watchers: DashMap<&'static str, Arc<Notify>>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self { by_fingerprint: DashMap::new(), latest_by_msg_type: DashMap::new(), watchers: DashMap::new() }
    }

    /// Records `response` against `request`'s fingerprint and, if the
    /// request names a recognized stream type, as that type's latest value.
    pub fn insert(&self, request: &Value, response: Value) {
        let fingerprint = wire::fingerprint(request);
        self.by_fingerprint.insert(fingerprint, response.clone());
        if let Some(msg_type) = wire::msg_type(request) {
            self.latest_by_msg_type.insert(msg_type, response);
            if let Some(notify) = self.watchers.get(msg_type) {
                notify.notify_waiters();
            }
        }
    }

    /// The last response cached for the exact request (fingerprint match),
    /// if any.
    pub fn get(&self, request: &Value) -> Option<Value> {
        self.by_fingerprint.get(&wire::fingerprint(request)).map(|entry| entry.clone())
    }

    /// Waits for (and returns) the next response carrying `msg_type`,
    /// resolving immediately if one has already arrived since the last
    /// `clear()`. Mirrors `expect_response()`'s use to synchronize with a
    /// stream the caller subscribed to on a separate task.
    pub async fn expect_response(&self, msg_type: &'static str) -> Value {
        if let Some(value) = self.latest_by_msg_type.get(msg_type) {
            return value.clone();
        }
        let notify = self.watchers.entry(msg_type).or_insert_with(|| Arc::new(Notify::new())).clone();
        loop {
            let notified = notify.notified();
            if let Some(value) = self.latest_by_msg_type.get(msg_type) {
                return value.clone();
            }
            notified.await;
            if let Some(value) = self.latest_by_msg_type.get(msg_type) {
                return value.clone();
            }
        }
    }

    pub fn clear(&self) {
        self.by_fingerprint.clear();
        self.latest_by_msg_type.clear();
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fingerprint_round_trip() {
        let cache = ResponseCache::new();
        let request = json!({"ticks": "R_100"});
        assert!(cache.get(&request).is_none());
        cache.insert(&request, json!({"tick": {"quote": 100}}));
        assert_eq!(cache.get(&request), Some(json!({"tick": {"quote": 100}})));
    }

    #[tokio::test]
    async fn expect_response_resolves_once_cached() {
        let cache = ResponseCache::new();
        cache.insert(&json!({"ticks": "R_100"}), json!({"tick": {"quote": 1}}));
        let value = cache.expect_response("ticks").await;
        assert_eq!(value, json!({"tick": {"quote": 1}}));
    }
}
