//! Error taxonomy for fixture coordination.

use std::io;

use thiserror::Error;

/// Errors from a [`Store`](crate::Store) or [`Cache`](crate::Cache) backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No value exists for the key. This is the normal cold-start signal:
    /// the coordinator treats it as control flow and never surfaces it to
    /// the consumer.
    #[error("no stored value for key '{key}'")]
    NotFound { key: String },

    /// Backend I/O failure. Propagated unchanged.
    #[error("storage i/o failed: {0}")]
    Io(#[from] io::Error),

    /// A persisted payload could not be encoded or decoded.
    #[error("malformed stored payload: {0}")]
    Codec(#[from] serde_json::Error),
}

impl StoreError {
    /// True for the miss case that drives the cold-start path.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// A computation declared or exercised an invalid two-phase shape.
///
/// Raised at registration for the ambiguous produce-only shape, and at
/// runtime when the produce/cleanup state machine is driven out of order.
#[derive(Debug, Error)]
pub enum ContractViolation {
    /// The computation sets up lazily but declares no cleanup step.
    #[error(
        "computation '{id}' declares a produce phase but no cleanup phase; \
         register it as `immediate` (plain result) or `lazy_with_cleanup` \
         (produce plus teardown)"
    )]
    AmbiguousShape { id: String },

    /// The produce phase already ran in this process.
    #[error("computation '{id}' already ran its produce phase")]
    AlreadyProduced { id: String },

    /// Cleanup was requested before any value was produced here.
    #[error("computation '{id}' asked to clean up before producing a value")]
    CleanupBeforeProduce { id: String },

    /// The cleanup phase already ran in this process.
    #[error("computation '{id}' already ran its cleanup phase")]
    AlreadyCompleted { id: String },

    /// Cleanup was requested on a shape that has no cleanup phase.
    #[error("computation '{id}' has no cleanup phase to run")]
    NoCleanupPhase { id: String },
}

/// Coordinator-level errors, surfaced to the consumer as setup failures.
#[derive(Debug, Error)]
pub enum Error {
    /// The computation broke the two-phase contract.
    #[error(transparent)]
    Contract(#[from] ContractViolation),

    /// Re-running the produce phase against the stored value disagreed
    /// with it: the computation is non-deterministic or buggy.
    #[error(
        "stored value for '{id}' disagrees with its recomputation: \
         stored={stored}, recomputed={recomputed}"
    )]
    Consistency {
        id: String,
        stored: String,
        recomputed: String,
    },

    /// The store declared an input the run context did not resolve.
    #[error("store requires input '{name}' but the run context does not provide it")]
    MissingInput { name: String },

    /// Acquiring the named lock failed at the OS level.
    #[error("could not lock '{key}': {source}")]
    Lock {
        key: String,
        #[source]
        source: io::Error,
    },

    /// A backend read or write failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}
