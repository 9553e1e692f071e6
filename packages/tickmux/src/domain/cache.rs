//! Last-Value Response Cache
//!
//! Stores the most recent successful response per request fingerprint.
//! Updated as a side effect of every successful request resolution and every
//! subscription event; reads are synchronous and never touch the network.
//!
//! There is no eviction beyond overwrite-on-update: the cache grows with the
//! number of distinct request shapes seen over the connection's lifetime.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::domain::fingerprint::RequestFingerprint;
use crate::domain::message::InboundMessage;

/// One cached response.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The most recent successful response for the fingerprint.
    pub response: InboundMessage,
    /// When the response was stored.
    pub stored_at: DateTime<Utc>,
}

/// Per-connection response cache keyed by request fingerprint.
#[derive(Debug, Default)]
pub struct ResponseCache {
    entries: RwLock<HashMap<RequestFingerprint, CacheEntry>>,
}

impl ResponseCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store (or overwrite) the response for a fingerprint.
    pub fn store(&self, fingerprint: &RequestFingerprint, response: &InboundMessage) {
        let entry = CacheEntry {
            response: response.clone(),
            stored_at: Utc::now(),
        };
        self.entries.write().insert(fingerprint.clone(), entry);
    }

    /// Look up the cached response for a fingerprint. Never blocks on I/O.
    #[must_use]
    pub fn get(&self, fingerprint: &RequestFingerprint) -> Option<CacheEntry> {
        self.entries.read().get(fingerprint).cloned()
    }

    /// Look up the most recently stored response of a given message type,
    /// regardless of which request produced it.
    #[must_use]
    pub fn get_by_msg_type(&self, msg_type: &str) -> Option<CacheEntry> {
        self.entries
            .read()
            .values()
            .filter(|entry| entry.response.msg_type.as_deref() == Some(msg_type))
            .max_by_key(|entry| entry.stored_at)
            .cloned()
    }

    /// Number of distinct fingerprints cached.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn message(msg_type: &str, body: serde_json::Value) -> InboundMessage {
        serde_json::from_value(json!({ "msg_type": msg_type, msg_type: body })).unwrap()
    }

    #[test]
    fn absent_fingerprint_returns_none() {
        let cache = ResponseCache::new();
        let fingerprint = RequestFingerprint::of(&json!({"ping": 1}));
        assert!(cache.get(&fingerprint).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn stores_and_returns_the_latest_response() {
        let cache = ResponseCache::new();
        let fingerprint = RequestFingerprint::of(&json!({"ticks": "R_100"}));

        cache.store(&fingerprint, &message("tick", json!({"quote": 1.0})));
        cache.store(&fingerprint, &message("tick", json!({"quote": 2.0})));

        let entry = cache.get(&fingerprint).unwrap();
        assert_eq!(entry.response.body().unwrap()["quote"], 2.0);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn distinct_fingerprints_are_independent() {
        let cache = ResponseCache::new();
        let r100 = RequestFingerprint::of(&json!({"ticks": "R_100"}));
        let r50 = RequestFingerprint::of(&json!({"ticks": "R_50"}));

        cache.store(&r100, &message("tick", json!({"quote": 1.0})));

        assert!(cache.get(&r100).is_some());
        assert!(cache.get(&r50).is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn lookup_by_msg_type_returns_newest_match() {
        let cache = ResponseCache::new();
        let ping = RequestFingerprint::of(&json!({"ping": 1}));
        let ticks = RequestFingerprint::of(&json!({"ticks": "R_100"}));

        cache.store(&ping, &message("ping", json!("pong")));
        cache.store(&ticks, &message("tick", json!({"quote": 1.0})));

        let entry = cache.get_by_msg_type("ping").unwrap();
        assert_eq!(entry.response.msg_type.as_deref(), Some("ping"));
        assert!(cache.get_by_msg_type("balance").is_none());
    }

    #[test]
    fn clear_removes_everything() {
        let cache = ResponseCache::new();
        let fingerprint = RequestFingerprint::of(&json!({"ping": 1}));
        cache.store(&fingerprint, &message("ping", json!("pong")));

        cache.clear();

        assert!(cache.is_empty());
        assert!(cache.get(&fingerprint).is_none());
    }
}
