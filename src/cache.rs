//! Optional short-circuit layer consulted before the store.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

use crate::error::StoreError;
use crate::store::StorageKey;

/// Faster read layer in front of a [`Store`](crate::Store), with the same
/// miss semantics: an absent key is [`StoreError::NotFound`].
///
/// The coordinator probes the cache first, warms it on store hits and on
/// fresh production, and otherwise ignores it.
pub trait Cache {
    /// Fails with [`StoreError::NotFound`] on a miss.
    fn get(&self, key: &StorageKey) -> Result<Value, StoreError>;

    fn set(&self, key: &StorageKey, value: &Value) -> Result<(), StoreError>;
}

/// Disabled cache: every probe misses. The default.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoCache;

impl Cache for NoCache {
    fn get(&self, key: &StorageKey) -> Result<Value, StoreError> {
        Err(StoreError::NotFound {
            key: key.to_string(),
        })
    }

    fn set(&self, _key: &StorageKey, _value: &Value) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Process-scoped map cache. Clones share the same entries.
#[derive(Clone, Debug, Default)]
pub struct MemoryCache {
    entries: Arc<DashMap<String, Value>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Cache for MemoryCache {
    fn get(&self, key: &StorageKey) -> Result<Value, StoreError> {
        self.entries
            .get(key.as_str())
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::NotFound {
                key: key.to_string(),
            })
    }

    fn set(&self, key: &StorageKey, value: &Value) -> Result<(), StoreError> {
        self.entries.insert(key.to_string(), value.clone());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn no_cache_always_misses() {
        let key = StorageKey::new("k");
        assert!(NoCache.get(&key).expect_err("miss").is_not_found());
        NoCache.set(&key, &json!(1)).expect("set is a no-op");
        assert!(NoCache.get(&key).expect_err("still a miss").is_not_found());
    }

    #[test]
    fn memory_cache_round_trips() {
        let cache = MemoryCache::new();
        let key = StorageKey::new("k");
        assert!(cache.get(&key).expect_err("cold").is_not_found());
        cache.set(&key, &json!({"warm": true})).expect("set");
        assert_eq!(cache.get(&key).expect("hit"), json!({"warm": true}));
    }
}
