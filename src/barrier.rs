//! The cleanup barrier: teardown runs exactly once, in the producing
//! worker, only after every expected consumer anywhere has finished.
//!
//! Each worker, when its consumer scope ends, folds its own completions
//! into the shared consumer record under the key's lock. The record only
//! ever shrinks during a run. The worker that produced the value is the
//! only one holding a live [`ComputationCell`](crate::ComputationCell)
//! able to run teardown; depending on policy it either resumes the cell
//! right away or polls the record until it empties.

use std::thread;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::cache::Cache;
use crate::computation::CleanupToken;
use crate::context::{ConsumerId, RunContext};
use crate::coordinator::SharedFixture;
use crate::error::{Error, StoreError};
use crate::lock::Lock;
use crate::store::{StorageKey, Store};

/// When the cleanup phase of a two-phase computation may run.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum CleanupPolicy {
    /// As soon as this worker's own consumer scope ends, regardless of
    /// other workers' progress. Teardown may run while peers still hold
    /// the value; the cleanup phase sees [`CleanupToken::NotLast`] then.
    Immediate,
    /// Only after every expected consumer in every worker has finished:
    /// the producing worker polls the shared record until it is empty,
    /// then tears down with [`CleanupToken::Last`].
    #[default]
    After,
}

impl<T, S, L, C> SharedFixture<T, S, L, C>
where
    T: Serialize + DeserializeOwned + PartialEq + 'static,
    S: Store,
    L: Lock,
    C: Cache,
{
    /// Worker-side scope end: shrink the shared consumer record by this
    /// worker's completions, then run teardown if this process produced
    /// the value and the policy allows it.
    pub(crate) fn settle(
        &self,
        ctx: &RunContext,
        key: &StorageKey,
        produced_here: bool,
    ) -> Result<(), Error> {
        if !self.cell.lock().two_phase() {
            return Ok(());
        }

        let mut remaining = self.under_lock(key, || self.shrink_consumers(ctx, key))?;

        if !produced_here {
            log::debug!(
                "Scope ended without the live cell. fixture={}, worker={}, remaining={}",
                self.id,
                ctx.worker_name(),
                remaining
            );
            return Ok(());
        }

        match self.policy {
            CleanupPolicy::Immediate => {
                let token = if remaining == 0 {
                    CleanupToken::Last
                } else {
                    CleanupToken::NotLast
                };
                log::info!(
                    "Running cleanup immediately. fixture={}, token={:?}, remaining={}",
                    self.id,
                    token,
                    remaining
                );
                self.cell.lock().resume(token)?;
                Ok(())
            }
            CleanupPolicy::After => {
                while remaining > 0 {
                    log::trace!(
                        "Waiting for remaining consumers. fixture={}, remaining={}",
                        self.id,
                        remaining
                    );
                    thread::sleep(self.poll_interval);
                    remaining = self.under_lock(key, || self.read_remaining(key))?;
                }
                log::info!(
                    "All consumers finished; running cleanup. fixture={}, key={}",
                    self.id,
                    key
                );
                self.cell.lock().resume(CleanupToken::Last)?;
                Ok(())
            }
        }
    }

    /// Removes this worker's finished consumers from the shared record
    /// and writes the shrunk remainder back. Returns how many identities
    /// are still pending elsewhere. Callers hold the key's lock.
    fn shrink_consumers(&self, ctx: &RunContext, key: &StorageKey) -> Result<usize, Error> {
        let record = key.consumers();
        let mut pending: Vec<ConsumerId> = match self.store.read(&record) {
            Ok(value) => serde_json::from_value(value).map_err(StoreError::Codec)?,
            Err(miss) if miss.is_not_found() => {
                log::warn!(
                    "No consumer record for stored value. fixture={}, key={}",
                    self.id,
                    key
                );
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };

        let finished = ctx.finished_consumers();
        pending.retain(|consumer| !finished.contains(consumer));
        let shrunk = serde_json::to_value(&pending).map_err(StoreError::Codec)?;
        self.store.write(&record, &shrunk)?;
        log::debug!(
            "Shrunk consumer record. fixture={}, worker={}, remaining={}",
            self.id,
            ctx.worker_name(),
            pending.len()
        );
        Ok(pending.len())
    }

    /// Re-reads the consumer record. Callers hold the key's lock.
    fn read_remaining(&self, key: &StorageKey) -> Result<usize, Error> {
        match self.store.read(&key.consumers()) {
            Ok(value) => {
                let pending: Vec<ConsumerId> =
                    serde_json::from_value(value).map_err(StoreError::Codec)?;
                Ok(pending.len())
            }
            Err(miss) if miss.is_not_found() => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::computation::Computation;
    use crate::store::InMemoryStore;
    use std::sync::Arc;
    use std::sync::Mutex as StdMutex;

    const FX: &str = "tests::barrier_fx";

    fn two_phase_fixture(
        store: InMemoryStore,
        tokens: Arc<StdMutex<Vec<CleanupToken>>>,
    ) -> SharedFixture<u32, InMemoryStore> {
        SharedFixture::new(
            FX,
            Computation::lazy_with_cleanup(
                |prior: Option<u32>| prior.unwrap_or(123),
                move |token| tokens.lock().expect("token log").push(token),
            ),
            store,
        )
        .expect("valid shape")
    }

    #[test]
    fn sole_worker_cleans_up_last() {
        let store = InMemoryStore::new();
        let tokens = Arc::new(StdMutex::new(Vec::new()));
        let ctx = RunContext::worker("w1").expect_consumers(FX, ["w1::t"]);
        let fx = two_phase_fixture(store, Arc::clone(&tokens));

        let handle = fx.acquire(&ctx).expect("acquire");
        ctx.consumer_finished("w1::t");
        fx.release(handle, &ctx).expect("release");

        assert_eq!(*tokens.lock().expect("token log"), vec![CleanupToken::Last]);
    }

    #[test]
    fn immediate_policy_tears_down_while_peers_pend() {
        let store = InMemoryStore::new();
        let tokens = Arc::new(StdMutex::new(Vec::new()));
        let ctx = RunContext::worker("w1").expect_consumers(FX, ["w1::t", "w2::t"]);
        let fx = two_phase_fixture(store.clone(), Arc::clone(&tokens))
            .with_policy(CleanupPolicy::Immediate);

        let handle = fx.acquire(&ctx).expect("acquire");
        ctx.consumer_finished("w1::t");
        fx.release(handle, &ctx).expect("release");

        // w2::t never finished, so the producer saw itself as not-last.
        assert_eq!(
            *tokens.lock().expect("token log"),
            vec![CleanupToken::NotLast]
        );
    }

    #[test]
    fn non_producer_only_shrinks_the_record() {
        let store = InMemoryStore::new();
        let tokens = Arc::new(StdMutex::new(Vec::new()));

        let ctx1 = RunContext::worker("w1").expect_consumers(FX, ["w1::t", "w2::t"]);
        let fx1 = two_phase_fixture(store.clone(), Arc::clone(&tokens))
            .with_policy(CleanupPolicy::Immediate);
        let h1 = fx1.acquire(&ctx1).expect("cold acquire");

        let ctx2 = RunContext::worker("w2").expect_consumers(FX, ["w1::t", "w2::t"]);
        let fx2 = two_phase_fixture(store.clone(), Arc::clone(&tokens));
        let h2 = fx2.acquire(&ctx2).expect("warm acquire");
        assert!(!h2.produced_here());

        ctx2.consumer_finished("w2::t");
        fx2.release(h2, &ctx2).expect("warm release");
        assert!(
            tokens.lock().expect("token log").is_empty(),
            "a non-producer must never tear down"
        );

        ctx1.consumer_finished("w1::t");
        fx1.release(h1, &ctx1).expect("producer release");
        assert_eq!(*tokens.lock().expect("token log"), vec![CleanupToken::Last]);
    }

    #[test]
    fn missing_record_reads_as_empty() {
        let store = InMemoryStore::new();
        let tokens = Arc::new(StdMutex::new(Vec::new()));
        let ctx = RunContext::worker("w1").expect_consumers(FX, ["w1::t"]);
        let fx = two_phase_fixture(store.clone(), Arc::clone(&tokens));

        let handle = fx.acquire(&ctx).expect("acquire");
        // Simulate an out-of-band reset of the shared medium between
        // acquire and release.
        let key = store.key(&crate::FixtureId::from(FX), &crate::InputValues::new());
        store.remove(&key.consumers());

        ctx.consumer_finished("w1::t");
        fx.release(handle, &ctx).expect("release survives missing record");
        assert_eq!(*tokens.lock().expect("token log"), vec![CleanupToken::Last]);
    }
}
