//! Per-entity TTL cache of verification results.
//!
//! The cache is the only thing standing between a verify request and a full
//! recursive graph walk, and it is also what terminates re-verification of
//! an entity that has already settled. Entries expire lazily on access;
//! there is no background sweep and no size bound, so a caller feeding
//! unbounded distinct ids can grow it without limit (accepted risk: ids
//! come from a persisted entity population). Expired entries behave exactly
//! like absent ones.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use gradebus_types::{EntityId, VerificationData};

#[derive(Debug, Clone)]
struct CacheEntry {
    data: VerificationData,
    expires_at: Instant,
}

impl CacheEntry {
    fn live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// TTL cache of the last computed verification result per entity id.
#[derive(Debug, Default)]
pub struct VerifyCache {
    entries: Mutex<HashMap<EntityId, CacheEntry>>,
}

impl VerifyCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Live entry for `id`, if any. Expired entries are dropped on the way
    /// out.
    #[must_use]
    pub fn get(&self, id: EntityId) -> Option<VerificationData> {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("verify cache poisoned");
        match entries.get(&id) {
            Some(entry) if entry.live(now) => Some(entry.data.clone()),
            Some(_) => {
                entries.remove(&id);
                None
            }
            None => None,
        }
    }

    /// Unconditionally store `data` for `id`, visible for at most `ttl`.
    pub fn put(&self, id: EntityId, data: VerificationData, ttl: Duration) {
        let entry = CacheEntry {
            data,
            expires_at: Instant::now() + ttl,
        };
        self.entries
            .lock()
            .expect("verify cache poisoned")
            .insert(id, entry);
    }

}
