//! User-supplied computations and the state machine that drives their
//! two-phase lifecycle.

use std::fmt;

use crate::context::FixtureId;
use crate::error::ContractViolation;

/// Token delivered to the cleanup phase of a two-phase computation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CleanupToken {
    /// Every expected consumer in every worker has finished; full
    /// teardown is safe.
    Last,
    /// Other workers may still hold the value; tear down accordingly.
    NotLast,
}

type ProduceFn<T> = Box<dyn FnOnce(Option<T>) -> T + Send>;
type CleanupFn = Box<dyn FnOnce(CleanupToken) + Send>;

/// A user-supplied computation with an explicitly declared shape.
///
/// The shape is declared at construction rather than inferred from the
/// body, which makes the invalid shape checkable when the computation is
/// registered, before any process runs it.
pub enum Computation<T> {
    /// A plain result: produced once, no cleanup phase.
    Immediate(Box<dyn FnOnce() -> T + Send>),
    /// Produces lazily but declares no cleanup step. This shape is
    /// ambiguous and rejected at registration; it exists so migrating
    /// callers get a descriptive error instead of a silent reshape.
    Lazy(ProduceFn<T>),
    /// The two-phase shape: produce a value now, tear it down later.
    LazyWithCleanup {
        produce: ProduceFn<T>,
        cleanup: CleanupFn,
    },
}

impl<T> Computation<T> {
    /// A plain result with no cleanup phase.
    pub fn immediate(f: impl FnOnce() -> T + Send + 'static) -> Self {
        Computation::Immediate(Box::new(f))
    }

    /// The ambiguous produce-only shape. Fails registration; see
    /// [`ContractViolation::AmbiguousShape`].
    pub fn lazy(f: impl FnOnce(Option<T>) -> T + Send + 'static) -> Self {
        Computation::Lazy(Box::new(f))
    }

    /// The two-phase shape. `produce` receives `None` on a cold start or
    /// the previously stored value on the warm validation path; `cleanup`
    /// later receives a [`CleanupToken`] and performs teardown.
    pub fn lazy_with_cleanup(
        produce: impl FnOnce(Option<T>) -> T + Send + 'static,
        cleanup: impl FnOnce(CleanupToken) + Send + 'static,
    ) -> Self {
        Computation::LazyWithCleanup {
            produce: Box::new(produce),
            cleanup: Box::new(cleanup),
        }
    }
}

impl<T> fmt::Debug for Computation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shape = match self {
            Computation::Immediate(_) => "Immediate",
            Computation::Lazy(_) => "Lazy",
            Computation::LazyWithCleanup { .. } => "LazyWithCleanup",
        };
        f.debug_tuple("Computation").field(&shape).finish()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum CellState {
    NotStarted,
    Produced,
    Completed,
}

/// The live instance of a computation within one process.
///
/// An explicit tagged state machine: [`start`](ComputationCell::start)
/// runs the produce phase (`NotStarted -> Produced`) and
/// [`resume`](ComputationCell::resume) runs the cleanup phase
/// (`Produced -> Completed`). Ownership of the cell is what authorizes
/// teardown: only the process holding the live cell can resume it, and
/// each transition happens at most once.
pub struct ComputationCell<T> {
    id: FixtureId,
    produce: Option<ProduceFn<T>>,
    cleanup: Option<CleanupFn>,
    two_phase: bool,
    state: CellState,
}

impl<T: 'static> ComputationCell<T> {
    /// Validates the declared shape and builds the live cell.
    ///
    /// The produce-only [`Computation::Lazy`] shape fails here with a
    /// descriptive error, before any value is produced anywhere.
    pub fn new(id: FixtureId, computation: Computation<T>) -> Result<Self, ContractViolation> {
        match computation {
            Computation::Immediate(f) => Ok(ComputationCell {
                id,
                produce: Some(Box::new(move |_prior| f())),
                cleanup: None,
                two_phase: false,
                state: CellState::NotStarted,
            }),
            Computation::Lazy(_) => Err(ContractViolation::AmbiguousShape { id: id.to_string() }),
            Computation::LazyWithCleanup { produce, cleanup } => Ok(ComputationCell {
                id,
                produce: Some(produce),
                cleanup: Some(cleanup),
                two_phase: true,
                state: CellState::NotStarted,
            }),
        }
    }

    /// Whether the declared shape includes a cleanup phase.
    pub fn two_phase(&self) -> bool {
        self.two_phase
    }

    /// Runs the produce phase. `prior` is `None` on a cold start, or the
    /// previously stored value on the warm validation path.
    pub fn start(&mut self, prior: Option<T>) -> Result<T, ContractViolation> {
        match self.state {
            CellState::NotStarted => {
                let produce = self
                    .produce
                    .take()
                    .expect("produce closure is present until the first start");
                self.state = CellState::Produced;
                Ok(produce(prior))
            }
            CellState::Produced => Err(ContractViolation::AlreadyProduced {
                id: self.id.to_string(),
            }),
            CellState::Completed => Err(ContractViolation::AlreadyCompleted {
                id: self.id.to_string(),
            }),
        }
    }

    /// Runs the cleanup phase with `token`.
    pub fn resume(&mut self, token: CleanupToken) -> Result<(), ContractViolation> {
        match self.state {
            CellState::NotStarted => Err(ContractViolation::CleanupBeforeProduce {
                id: self.id.to_string(),
            }),
            CellState::Produced => match self.cleanup.take() {
                Some(cleanup) => {
                    self.state = CellState::Completed;
                    cleanup(token);
                    Ok(())
                }
                None => Err(ContractViolation::NoCleanupPhase {
                    id: self.id.to_string(),
                }),
            },
            CellState::Completed => Err(ContractViolation::AlreadyCompleted {
                id: self.id.to_string(),
            }),
        }
    }
}

impl<T> fmt::Debug for ComputationCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputationCell")
            .field("id", &self.id)
            .field("two_phase", &self.two_phase)
            .field("state", &self.state)
            .finish()
    }
}
