//! File-backed reference store: one JSON artifact per key in a directory
//! shared by every worker.

use std::fs;
use std::io;
use std::path::Path;

use serde_json::Value;

use crate::context::FixtureId;
use crate::error::StoreError;
use crate::lock::{FileGuard, FileLock, Lock};
use crate::store::{input_digest, sanitize_identity, InputValues, StorageKey, Store};

/// Name of the input resolving the directory every worker shares.
pub const SCRATCH_ROOT: &str = "scratch_root";

/// Stores each value as a JSON file under a shared scratch directory.
///
/// The key embeds the resolved root plus a digest of all resolved inputs,
/// so the same computation invoked with different inputs lands in
/// different artifacts. Default mutual exclusion is a [`FileLock`] on the
/// key's `.lock` sibling.
#[derive(Clone, Debug)]
pub struct JsonStore {
    inputs: Vec<String>,
}

impl JsonStore {
    pub fn new() -> Self {
        JsonStore {
            inputs: vec![SCRATCH_ROOT.to_string()],
        }
    }

    /// Declares an additional external input whose value participates in
    /// key derivation.
    pub fn with_input(mut self, name: impl Into<String>) -> Self {
        self.inputs.push(name.into());
        self
    }
}

impl Default for JsonStore {
    fn default() -> Self {
        JsonStore::new()
    }
}

impl Store for JsonStore {
    type Guard = FileGuard;

    fn required_inputs(&self) -> &[String] {
        &self.inputs
    }

    fn key(&self, identity: &FixtureId, inputs: &InputValues) -> StorageKey {
        // Callers resolve `required_inputs` first; an unresolved root
        // falls back to the current directory.
        let root = inputs
            .get(SCRATCH_ROOT)
            .and_then(Value::as_str)
            .unwrap_or(".");
        StorageKey::new(format!(
            "{}/{}-{:016x}.json",
            root.trim_end_matches('/'),
            sanitize_identity(identity),
            input_digest(inputs),
        ))
    }

    fn read(&self, key: &StorageKey) -> Result<Value, StoreError> {
        let bytes = match fs::read(key.as_str()) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound {
                    key: key.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn write(&self, key: &StorageKey, value: &Value) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(value)?;
        fs::write(key.as_str(), bytes)?;
        Ok(())
    }

    fn exists(&self, key: &StorageKey) -> bool {
        Path::new(key.as_str()).exists()
    }

    fn lock(&self, key: &StorageKey) -> io::Result<FileGuard> {
        FileLock.acquire(key)
    }
}
