//! Per-process run context: role, resolved inputs, expected consumers,
//! and the completion log.

use std::collections::{HashMap, HashSet};
use std::env;
use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::InputValues;

/// Role this process plays in the run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WorkerRole {
    /// No cross-process distribution is active: computations run
    /// directly, with no coordination.
    Controller,
    /// One of several peer processes that may all request the same
    /// computation; must coordinate through the store and lock.
    Worker,
}

/// Module-qualified identity of a registered computation.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct FixtureId(String);

impl FixtureId {
    pub fn new(raw: impl Into<String>) -> Self {
        FixtureId(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for FixtureId {
    fn from(raw: &str) -> Self {
        FixtureId(raw.to_string())
    }
}

impl From<String> for FixtureId {
    fn from(raw: String) -> Self {
        FixtureId(raw)
    }
}

impl fmt::Display for FixtureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one consumer (test invocation) of a shared value.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct ConsumerId(String);

impl ConsumerId {
    pub fn new(raw: impl Into<String>) -> Self {
        ConsumerId(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ConsumerId {
    fn from(raw: &str) -> Self {
        ConsumerId(raw.to_string())
    }
}

impl From<String> for ConsumerId {
    fn from(raw: String) -> Self {
        ConsumerId(raw)
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Environment variable naming this worker. Hosts that launch workers
/// through the environment set it to a distinct id per worker; absent or
/// empty means this process is the controller.
pub const WORKER_ENV: &str = "FIXSHARE_WORKER";

/// Everything the host resolves for one worker process: its role, the
/// external input values stores may need for key derivation, the
/// consumers each fixture is expected to serve anywhere in this run, and
/// the process-wide log of consumers that already finished here.
///
/// Created once at process start and threaded into every fixture call;
/// there is no hidden global state.
#[derive(Debug)]
pub struct RunContext {
    role: WorkerRole,
    worker: String,
    inputs: InputValues,
    expected: HashMap<FixtureId, Vec<ConsumerId>>,
    finished: Mutex<HashSet<ConsumerId>>,
}

impl RunContext {
    /// Context for a run with no cross-process distribution.
    pub fn controller() -> Self {
        RunContext {
            role: WorkerRole::Controller,
            worker: "controller".to_string(),
            inputs: InputValues::new(),
            expected: HashMap::new(),
            finished: Mutex::new(HashSet::new()),
        }
    }

    /// Context for one worker among several peers.
    pub fn worker(id: impl Into<String>) -> Self {
        RunContext {
            role: WorkerRole::Worker,
            worker: id.into(),
            ..RunContext::controller()
        }
    }

    /// Derives the role from [`WORKER_ENV`].
    pub fn from_env() -> Self {
        match env::var(WORKER_ENV) {
            Ok(id) if !id.is_empty() => RunContext::worker(id),
            _ => RunContext::controller(),
        }
    }

    /// Resolves one external input value, e.g. the shared scratch root a
    /// file-backed store derives keys under.
    pub fn with_input(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.inputs.insert(name.into(), value.into());
        self
    }

    /// Declares the consumers expected to request `fixture` anywhere in
    /// this run, discovered by the host from its scheduled work items.
    pub fn expect_consumers<I>(mut self, fixture: impl Into<FixtureId>, consumers: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<ConsumerId>,
    {
        self.expected.insert(
            fixture.into(),
            consumers.into_iter().map(Into::into).collect(),
        );
        self
    }

    pub fn role(&self) -> WorkerRole {
        self.role
    }

    /// Name of this worker, for logs and diagnostics.
    pub fn worker_name(&self) -> &str {
        &self.worker
    }

    pub fn input(&self, name: &str) -> Option<&Value> {
        self.inputs.get(name)
    }

    /// Consumers scheduled to use `fixture` anywhere in this run.
    pub fn expected_consumers(&self, fixture: &FixtureId) -> &[ConsumerId] {
        self.expected.get(fixture).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Records that a consumer finished in this worker. The host calls
    /// this as each test invocation completes.
    pub fn consumer_finished(&self, consumer: impl Into<ConsumerId>) {
        let consumer = consumer.into();
        log::debug!(
            "Consumer finished. worker={}, consumer={}",
            self.worker,
            consumer
        );
        self.finished.lock().insert(consumer);
    }

    /// Snapshot of the completion log.
    pub fn finished_consumers(&self) -> HashSet<ConsumerId> {
        self.finished.lock().clone()
    }

    /// Clears the completion log, the context's process-exit teardown.
    pub fn reset(&self) {
        self.finished.lock().clear();
    }
}
