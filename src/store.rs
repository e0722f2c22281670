//! Keyed persistence for computed values, visible to every worker that
//! shares the backing medium.
//!
//! A [`Store`] derives a deterministic [`StorageKey`] from a computation's
//! identity plus the resolved values of whichever external inputs affect
//! it, and persists one opaque JSON payload per key. Two sibling artifacts
//! hang off every key: the consumer record (`.consumers`) tracking which
//! test invocations still owe a completion, and the lock token (`.lock`)
//! backing mutual exclusion for the key.

mod json;
mod memory;

pub use json::{JsonStore, SCRATCH_ROOT};
pub use memory::InMemoryStore;

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{BuildHasher, Hasher};
use std::io;

use serde_json::Value;

use crate::context::FixtureId;
use crate::error::StoreError;

/// Resolved external input values that participate in key derivation.
///
/// Kept sorted by name so the derived key does not depend on resolution
/// order.
pub type InputValues = BTreeMap<String, Value>;

/// Deterministic identifier for one (computation, inputs) pair.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct StorageKey(String);

impl StorageKey {
    pub fn new(raw: impl Into<String>) -> Self {
        StorageKey(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Sibling artifact holding the consumer identities still expected to
    /// use the value this run.
    pub fn consumers(&self) -> StorageKey {
        StorageKey(format!("{}.consumers", self.0))
    }

    /// Sibling artifact acting as the lock token for this key.
    pub fn lock_token(&self) -> StorageKey {
        StorageKey(format!("{}.lock", self.0))
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Keyed persistence shared by every worker process in a run.
///
/// Implementations are interchangeable behind this trait and selected at
/// registration time; [`JsonStore`] is the file-system reference backend
/// and [`InMemoryStore`] serves tests and single-machine runs.
pub trait Store {
    /// Guard returned by the store's default mutual exclusion.
    type Guard;

    /// Names of the external inputs that must be resolved before this
    /// store can derive a key, e.g. a shared scratch-directory root.
    fn required_inputs(&self) -> &[String] {
        &[]
    }

    /// Derives the storage key for one (computation, inputs) pair.
    ///
    /// Pure and deterministic: equal identity and inputs yield an equal
    /// key, distinct inputs yield distinct keys.
    fn key(&self, identity: &FixtureId, inputs: &InputValues) -> StorageKey;

    /// Reads the value stored at `key`.
    ///
    /// Fails with [`StoreError::NotFound`] when no value exists.
    fn read(&self, key: &StorageKey) -> Result<Value, StoreError>;

    /// Writes `value` at `key`, idempotently overwriting any previous
    /// value.
    fn write(&self, key: &StorageKey, value: &Value) -> Result<(), StoreError>;

    /// Whether a value currently exists at `key`.
    fn exists(&self, key: &StorageKey) -> bool;

    /// Default mutual exclusion for `key`, used when the fixture was not
    /// configured with an explicit lock.
    fn lock(&self, key: &StorageKey) -> io::Result<Self::Guard>;
}

/// Deterministic 64-bit digest of the resolved inputs.
///
/// Seeds are fixed because every worker derives the key independently and
/// all must agree; canonical form comes from `InputValues` iterating in
/// name order.
pub(crate) fn input_digest(inputs: &InputValues) -> u64 {
    let canonical =
        serde_json::to_string(inputs).expect("resolved input values are already valid json");
    let mut hasher = ahash::RandomState::with_seeds(
        0x9e37_79b9_7f4a_7c15,
        0xf39c_c060_5ced_c834,
        0x1082_276b_f3a2_7251,
        0x7109_870e_cbbf_988c,
    )
    .build_hasher();
    hasher.write(canonical.as_bytes());
    hasher.finish()
}

/// Filesystem- and log-safe rendition of a fixture identity.
pub(crate) fn sanitize_identity(identity: &FixtureId) -> String {
    identity
        .as_str()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn sibling_artifacts_extend_the_key() {
        let key = StorageKey::new("/tmp/run/demo.json");
        assert_eq!(key.consumers().as_str(), "/tmp/run/demo.json.consumers");
        assert_eq!(key.lock_token().as_str(), "/tmp/run/demo.json.lock");
    }

    #[test]
    fn digest_is_deterministic() {
        let mut inputs = InputValues::new();
        inputs.insert("scratch_root".to_string(), json!("/tmp/a"));
        inputs.insert("profile".to_string(), json!("ci"));
        assert_eq!(input_digest(&inputs), input_digest(&inputs.clone()));
    }

    #[test]
    fn digest_distinguishes_inputs() {
        let mut a = InputValues::new();
        a.insert("profile".to_string(), json!("ci"));
        let mut b = InputValues::new();
        b.insert("profile".to_string(), json!("local"));
        assert_ne!(input_digest(&a), input_digest(&b));
    }

    #[test]
    fn sanitized_identities_keep_module_paths_readable() {
        let id = FixtureId::from("tests::db::pg instance");
        assert_eq!(sanitize_identity(&id), "tests--db--pg-instance");
    }
}
