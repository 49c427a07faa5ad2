//! Executor — orchestration of the measurement runs of a test
//!
//! The `Executor` trait is the runtime hook that executes a `Scenario`. The
//! executor decides when each run starts and how many run at once; the
//! scenario's action decides what a run does.
//!
//! The `StageExecutor` below is a fixed plan: every [`Stage`](crate::Stage)
//! starts at its offset from the beginning of the test, runs its virtual users
//! concurrently and each user performs the stage's iterations one after the
//! other. Stages overlap freely. The executor returns only once every run of
//! every stage has finished, which is the barrier aggregation relies on.
//!
//! # High-level flow
//! 1. Take the start instant of the test.
//! 2. Spawn one task per stage. Each stage task sleeps until its offset, then
//!    spawns its workers.
//! 3. Each worker calls the `action` once per iteration and folds the metrics
//!    it gets back into a worker-local `Aggregate`.
//! 4. Stage tasks join their workers and merge their aggregates; the executor
//!    joins the stage tasks and merges again.
//!
//! # Notes about correctness & robustness
//! - `merge` on aggregates must be associative & commutative; worker-local
//!   aggregates are merged in arbitrary order.
//! - A panicking worker is logged and its iterations are counted as missing
//!   runs. The other workers of the stage are not affected.
//! - Runs are never retried or cancelled. An action that never resolves keeps
//!   the executor waiting.
pub mod stage;
pub use stage::StageExecutor;

use std::future::Future;

use crate::{aggregate::Aggregate, error::ExecutorError, scenario::Scenario, stage::Stage};

/// Bookkeeping of a finished test.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExecutionStats {
    /// Runs that finished, with or without a metric.
    pub runs: usize,
    /// Runs that produced no metric.
    pub missing: usize,
}

impl ExecutionStats {
    pub fn merge(&mut self, other: ExecutionStats) {
        self.runs += other.runs;
        self.missing += other.missing;
    }
}

/// What an executor hands back once every run is over.
#[derive(Clone, Debug)]
pub struct Execution<A: Aggregate> {
    pub aggregate: A,
    pub stats: ExecutionStats,
}

impl<A: Aggregate> Execution<A> {
    pub fn empty() -> Self {
        Self {
            aggregate: A::new(),
            stats: ExecutionStats::default(),
        }
    }

    pub fn merge(&mut self, other: Execution<A>) {
        self.aggregate.merge(other.aggregate);
        self.stats.merge(other.stats);
    }
}

pub trait Executor<A, F, Fut>
where
    Self: Send + Sync + Sized,
    A: Aggregate,
    F: Fn(Stage) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = Option<A::Metric>> + Send + 'static,
{
    /// Execute the scenario and return the merged aggregate of every run.
    fn exec(
        &self,
        scenario: &Scenario<A, Self, F, Fut>,
    ) -> impl Future<Output = Result<Execution<A>, ExecutorError>> + Send;
}
