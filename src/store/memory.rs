//! Map-backed store for tests and single-machine runs.

use std::io;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

use crate::context::FixtureId;
use crate::error::StoreError;
use crate::lock::{InProcessGuard, KeyedLock, Lock};
use crate::store::{input_digest, InputValues, StorageKey, Store};

/// In-memory [`Store`] whose clones all share one map, standing in for a
/// medium shared by workers.
///
/// Declares no external inputs, so keys reduce to the computation
/// identity (plus a digest when inputs are supplied anyway). Default
/// mutual exclusion is a per-key in-process lock.
#[derive(Clone, Debug, Default)]
pub struct InMemoryStore {
    values: Arc<DashMap<String, Value>>,
    locks: KeyedLock,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops the entry at `key`, if any. Useful for simulating a reset of
    /// the shared medium.
    pub fn remove(&self, key: &StorageKey) {
        self.values.remove(key.as_str());
    }
}

impl Store for InMemoryStore {
    type Guard = InProcessGuard;

    fn key(&self, identity: &FixtureId, inputs: &InputValues) -> StorageKey {
        if inputs.is_empty() {
            StorageKey::new(identity.as_str())
        } else {
            StorageKey::new(format!("{}-{:016x}", identity, input_digest(inputs)))
        }
    }

    fn read(&self, key: &StorageKey) -> Result<Value, StoreError> {
        self.values
            .get(key.as_str())
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::NotFound {
                key: key.to_string(),
            })
    }

    fn write(&self, key: &StorageKey, value: &Value) -> Result<(), StoreError> {
        self.values.insert(key.to_string(), value.clone());
        Ok(())
    }

    fn exists(&self, key: &StorageKey) -> bool {
        self.values.contains_key(key.as_str())
    }

    fn lock(&self, key: &StorageKey) -> io::Result<InProcessGuard> {
        self.locks.acquire(key)
    }
}
