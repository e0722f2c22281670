//! Share one expensive fixture across parallel test worker processes.
//!
//! When a suite fans out across worker *processes*, session-scoped setup
//! runs once per process unless the workers coordinate. This crate makes
//! such a computation run exactly once across every worker: the first
//! worker to reach it produces the value under a named lock and persists
//! it, every other worker reads that same value, and for two-phase
//! computations the teardown runs exactly once, in the producing process,
//! only after every expected consumer in every worker has finished.
//!
//! ```rust
//! use fixshare::{Computation, RunContext, SharedFixture};
//! use fixshare::store::InMemoryStore;
//!
//! let ctx = RunContext::controller();
//! let fixture = SharedFixture::new(
//!     "demo::expensive_setup",
//!     Computation::immediate(|| 6 * 7),
//!     InMemoryStore::new(),
//! )?;
//!
//! let handle = fixture.acquire(&ctx)?;
//! assert_eq!(*handle, 42);
//! fixture.release(handle, &ctx)?;
//! # Ok::<(), fixshare::Error>(())
//! ```
//!
//! Workers coordinate through any [`Store`] plus [`Lock`] pair sharing a
//! medium. The reference backend is [`JsonStore`](store::JsonStore) over
//! a directory visible to every worker, with
//! [`FileLock`](lock::FileLock) advisory locks; the host resolves the
//! directory into the [`RunContext`] and tells the context which
//! consumers are scheduled to use each fixture. Two-phase computations
//! are declared with [`Computation::lazy_with_cleanup`]; when cleanup may
//! run is a [`CleanupPolicy`] choice, defaulting to the barrier that
//! waits for the whole run.

mod barrier;
mod computation;
mod context;
mod coordinator;
mod error;

pub mod cache;
pub mod lock;
pub mod store;

pub use barrier::CleanupPolicy;
pub use cache::{Cache, MemoryCache, NoCache};
pub use computation::{CleanupToken, Computation, ComputationCell};
pub use context::{ConsumerId, FixtureId, RunContext, WorkerRole, WORKER_ENV};
pub use coordinator::{FixtureHandle, SharedFixture};
pub use error::{ContractViolation, Error, StoreError};
pub use lock::{FileLock, KeyedLock, Lock, SingleLock};
pub use store::{InputValues, StorageKey, Store};
