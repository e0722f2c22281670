//! Per-invocation orchestration of a registered computation.

use std::ops::Deref;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::barrier::CleanupPolicy;
use crate::cache::{Cache, NoCache};
use crate::computation::{CleanupToken, Computation, ComputationCell};
use crate::context::{FixtureId, RunContext, WorkerRole};
use crate::error::{ContractViolation, Error, StoreError};
use crate::lock::{FileLock, Lock};
use crate::store::{InputValues, StorageKey, Store};

/// How often the producing worker re-reads the consumer record while
/// waiting to run cleanup under [`CleanupPolicy::After`].
pub(crate) const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A computation registered as a shareable fixture.
///
/// One `SharedFixture` lives in each worker process. Per invocation it
/// decides the process role, derives the storage key from the identity
/// and the store's declared inputs, takes the named lock, probes the
/// cache then the store, runs the produce phase when no value exists
/// yet, persists it, and hands the value to the consumer scope as a
/// [`FixtureHandle`]. [`release`](SharedFixture::release) ends that
/// scope and drives the cleanup barrier.
#[derive(Debug)]
pub struct SharedFixture<T, S, L = FileLock, C = NoCache> {
    pub(crate) id: FixtureId,
    pub(crate) cell: Mutex<ComputationCell<T>>,
    pub(crate) store: S,
    pub(crate) lock: Option<L>,
    pub(crate) cache: C,
    pub(crate) policy: CleanupPolicy,
    pub(crate) check_consistency: bool,
    pub(crate) poll_interval: Duration,
}

impl<T: 'static, S: Store> SharedFixture<T, S> {
    /// Registers a computation under its module-qualified identity.
    ///
    /// The declared shape is validated here, so an ambiguous produce-only
    /// computation fails before any process runs it.
    pub fn new(
        id: impl Into<FixtureId>,
        computation: Computation<T>,
        store: S,
    ) -> Result<Self, ContractViolation> {
        let id = id.into();
        let cell = ComputationCell::new(id.clone(), computation)?;
        Ok(SharedFixture {
            id,
            cell: Mutex::new(cell),
            store,
            lock: None,
            cache: NoCache,
            policy: CleanupPolicy::default(),
            check_consistency: true,
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }
}

impl<T, S, L, C> SharedFixture<T, S, L, C> {
    /// Replaces the store's default mutual exclusion with an explicit
    /// lock, shared or per-key.
    pub fn with_lock<L2: Lock>(self, lock: L2) -> SharedFixture<T, S, L2, C> {
        SharedFixture {
            id: self.id,
            cell: self.cell,
            store: self.store,
            lock: Some(lock),
            cache: self.cache,
            policy: self.policy,
            check_consistency: self.check_consistency,
            poll_interval: self.poll_interval,
        }
    }

    /// Adds a short-circuit cache consulted before the store.
    pub fn with_cache<C2: Cache>(self, cache: C2) -> SharedFixture<T, S, L, C2> {
        SharedFixture {
            id: self.id,
            cell: self.cell,
            store: self.store,
            lock: self.lock,
            cache,
            policy: self.policy,
            check_consistency: self.check_consistency,
            poll_interval: self.poll_interval,
        }
    }

    /// Chooses when the cleanup phase may run. The default waits for
    /// every expected consumer everywhere.
    pub fn with_policy(mut self, policy: CleanupPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Enables or disables the warm-path recomputation check. On by
    /// default; disable it for producers that cannot recompute their
    /// stored value deterministically.
    pub fn with_consistency_check(mut self, check: bool) -> Self {
        self.check_consistency = check;
        self
    }

    /// Adjusts the barrier's re-read interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn id(&self) -> &FixtureId {
        &self.id
    }
}

impl<T, S, L, C> SharedFixture<T, S, L, C>
where
    T: Serialize + DeserializeOwned + PartialEq + 'static,
    S: Store,
    L: Lock,
    C: Cache,
{
    /// Acquires the shared value for one consumer scope, producing and
    /// persisting it if no worker has yet.
    pub fn acquire(&self, ctx: &RunContext) -> Result<FixtureHandle<T>, Error> {
        match ctx.role() {
            WorkerRole::Controller => self.acquire_direct(),
            WorkerRole::Worker => self.acquire_coordinated(ctx),
        }
    }

    /// Ends the consumer scope `handle` was serving. For two-phase
    /// computations this is where the cleanup barrier runs; errors from
    /// the cleanup phase surface here, after the value was already
    /// delivered.
    pub fn release(&self, handle: FixtureHandle<T>, ctx: &RunContext) -> Result<(), Error> {
        match handle.origin {
            Origin::Direct => {
                if self.cell.lock().two_phase() {
                    log::debug!("Running cleanup in-process. fixture={}", self.id);
                    self.cell.lock().resume(CleanupToken::Last)?;
                }
                Ok(())
            }
            Origin::Coordinated { key, produced_here } => self.settle(ctx, &key, produced_here),
        }
    }

    fn acquire_direct(&self) -> Result<FixtureHandle<T>, Error> {
        let value = self.cell.lock().start(None)?;
        log::info!("Produced value directly. fixture={}, role=controller", self.id);
        Ok(FixtureHandle {
            value,
            origin: Origin::Direct,
        })
    }

    fn acquire_coordinated(&self, ctx: &RunContext) -> Result<FixtureHandle<T>, Error> {
        let inputs = self.resolve_inputs(ctx)?;
        let key = self.store.key(&self.id, &inputs);
        let (value, produced_here) =
            self.under_lock(&key, || self.probe_or_produce(&key, ctx))?;
        log::debug!(
            "Handing value to consumer scope. fixture={}, worker={}, produced_here={}",
            self.id,
            ctx.worker_name(),
            produced_here
        );
        Ok(FixtureHandle {
            value,
            origin: Origin::Coordinated { key, produced_here },
        })
    }

    /// Collects the store's declared inputs from the context.
    fn resolve_inputs(&self, ctx: &RunContext) -> Result<InputValues, Error> {
        let mut inputs = InputValues::new();
        for name in self.store.required_inputs() {
            let value = ctx
                .input(name)
                .ok_or_else(|| Error::MissingInput { name: name.clone() })?;
            inputs.insert(name.clone(), value.clone());
        }
        Ok(inputs)
    }

    /// Runs `f` under the configured lock, or the store's default lock
    /// when none was supplied. The guard drops on every exit path.
    pub(crate) fn under_lock<R>(
        &self,
        key: &StorageKey,
        f: impl FnOnce() -> Result<R, Error>,
    ) -> Result<R, Error> {
        match &self.lock {
            Some(lock) => {
                let _guard = lock.acquire(key).map_err(|source| Error::Lock {
                    key: key.to_string(),
                    source,
                })?;
                f()
            }
            None => {
                let _guard = self.store.lock(key).map_err(|source| Error::Lock {
                    key: key.to_string(),
                    source,
                })?;
                f()
            }
        }
    }

    /// The critical section: probe cache then store; on a hit validate
    /// the stored value, on a miss produce and persist one.
    fn probe_or_produce(&self, key: &StorageKey, ctx: &RunContext) -> Result<(T, bool), Error> {
        let existing = match self.cache.get(key) {
            Ok(value) => {
                log::debug!("Cache hit. fixture={}, key={}", self.id, key);
                Some(value)
            }
            Err(miss) if miss.is_not_found() => match self.store.read(key) {
                Ok(value) => {
                    log::debug!("Found stored value. fixture={}, key={}", self.id, key);
                    self.cache.set(key, &value)?;
                    Some(value)
                }
                Err(miss) if miss.is_not_found() => None,
                Err(e) => return Err(e.into()),
            },
            Err(e) => return Err(e.into()),
        };

        match existing {
            Some(stored) => Ok((self.validate_stored(stored)?, false)),
            None => {
                let value = self.cell.lock().start(None)?;

                // The expectation set must be durable before the value is
                // visible: a reader that finds the value must also find
                // the reservation for cleanup accounting.
                if self.cell.lock().two_phase() {
                    let expected = ctx.expected_consumers(&self.id);
                    if expected.is_empty() {
                        log::debug!(
                            "No consumers declared for fixture. fixture={}, worker={}",
                            self.id,
                            ctx.worker_name()
                        );
                    }
                    let record = serde_json::to_value(expected).map_err(StoreError::Codec)?;
                    self.store.write(&key.consumers(), &record)?;
                }

                let payload = serde_json::to_value(&value).map_err(StoreError::Codec)?;
                self.store.write(key, &payload)?;
                self.cache.set(key, &payload)?;
                log::info!(
                    "Produced and persisted value. fixture={}, key={}, worker={}",
                    self.id,
                    key,
                    ctx.worker_name()
                );
                Ok((value, true))
            }
        }
    }

    /// Warm path: deserialize the stored value and, for two-phase
    /// computations, re-run the produce phase against it to catch
    /// non-deterministic producers.
    fn validate_stored(&self, stored: Value) -> Result<T, Error> {
        let mut cell = self.cell.lock();
        if cell.two_phase() && self.check_consistency {
            let prior: T = serde_json::from_value(stored.clone()).map_err(StoreError::Codec)?;
            let expected: T = serde_json::from_value(stored.clone()).map_err(StoreError::Codec)?;
            let recomputed = cell.start(Some(prior))?;
            if recomputed != expected {
                let rendered = serde_json::to_value(&recomputed)
                    .map(|v| v.to_string())
                    .unwrap_or_else(|_| "<unrenderable>".to_string());
                return Err(Error::Consistency {
                    id: self.id.to_string(),
                    stored: stored.to_string(),
                    recomputed: rendered,
                });
            }
            Ok(recomputed)
        } else {
            Ok(serde_json::from_value(stored).map_err(StoreError::Codec)?)
        }
    }
}

/// The shared value handed to one consumer scope, plus enough provenance
/// for [`SharedFixture::release`] to drive the cleanup barrier.
#[derive(Debug)]
pub struct FixtureHandle<T> {
    value: T,
    origin: Origin,
}

#[derive(Debug)]
enum Origin {
    Direct,
    Coordinated {
        key: StorageKey,
        produced_here: bool,
    },
}

impl<T> FixtureHandle<T> {
    pub fn value(&self) -> &T {
        &self.value
    }

    /// Whether this process ran the produce phase, and so holds the live
    /// cell that cleanup must eventually run in.
    pub fn produced_here(&self) -> bool {
        matches!(
            self.origin,
            Origin::Direct | Origin::Coordinated { produced_here: true, .. }
        )
    }
}

impl<T> Deref for FixtureHandle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}
