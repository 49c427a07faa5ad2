use std::{
    future::Future,
    sync::{Arc, Mutex, PoisonError},
};

use futures::future::join_all;
use tokio::{task::JoinHandle, time::Instant};
use typed_builder::TypedBuilder;

use super::{Execution, ExecutionStats, Executor};
use crate::{aggregate::Aggregate, error::ExecutorError, scenario::Scenario, stage::Stage};
use internals::*;

/// Executor that starts every stage at its offset and waits for all of them.
///
/// - Each stage spawns `vus` workers once its offset has elapsed.
/// - Each worker performs `iterations` runs back to back.
/// - `exec` returns after the last run of the last stage.
#[derive(Clone, Debug, TypedBuilder)]
pub struct StageExecutor {
    pub stages: Vec<Stage>,
}

impl<A, F, Fut> Executor<A, F, Fut> for StageExecutor
where
    Self: Send + Sync + Sized,
    A: Aggregate + 'static,
    F: Fn(Stage) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = Option<A::Metric>> + Send + 'static,
{
    async fn exec(
        &self,
        scenario: &Scenario<A, Self, F, Fut>,
    ) -> Result<Execution<A>, ExecutorError> {
        let ctx = ExecutionContext::new();
        tracing::info!(
            "Running scenario: {} ({} stages)",
            scenario.name,
            self.stages.len()
        );

        let (ids, handles): (Vec<_>, Vec<_>) = self
            .stages
            .iter()
            .map(|stage| {
                let task = stage_task(ctx, stage.clone(), scenario.action.clone());
                (stage.id.clone(), tokio::spawn(task))
            })
            .unzip();

        let mut execution = Execution::empty();
        for (id, result) in ids.into_iter().zip(join_all(handles).await) {
            match result {
                Ok(stage) => execution.merge(stage),
                Err(e) => {
                    tracing::error!("Stage {id} task failed: {e}");
                    return Err(ExecutorError::StagePanicked(id));
                }
            }
        }

        tracing::info!(
            "Done running scenario: {} ({} runs, {} without a metric)",
            scenario.name,
            execution.stats.runs,
            execution.stats.missing
        );
        Ok(execution)
    }
}

#[cfg(feature = "internals")]
pub use internals::*;

mod internals {
    use super::*;

    /// Shared timing of one test.
    #[derive(Clone, Copy, Debug)]
    pub struct ExecutionContext {
        /// Every stage offset is measured from here.
        pub start: Instant,
    }

    impl ExecutionContext {
        pub fn new() -> Self {
            Self {
                start: Instant::now(),
            }
        }

        pub fn stage_start(&self, stage: &Stage) -> Instant {
            self.start + stage.start_offset
        }
    }

    /// Waits for the stage offset, then runs every worker of the stage to
    /// completion.
    pub async fn stage_task<A, F, Fut>(ctx: ExecutionContext, stage: Stage, action: F) -> Execution<A>
    where
        A: Aggregate + 'static,
        F: Fn(Stage) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Option<A::Metric>> + Send + 'static,
    {
        tokio::time::sleep_until(ctx.stage_start(&stage)).await;
        tracing::info!(
            "Starting stage {} ({}): {} VUs x {} iterations at {} B/s",
            stage.id,
            stage.name,
            stage.vus,
            stage.iterations,
            stage.bandwidth_limit
        );

        let (handles, progress): (Vec<_>, Vec<_>) = spawn_workers(&stage, action)
            .into_iter()
            .map(|worker| (worker.handle, worker.progress))
            .unzip();

        let mut execution = Execution::empty();
        for (result, progress) in join_all(handles).await.into_iter().zip(progress) {
            let mut worker = take_progress(&progress);
            if let Err(e) = result {
                // Completed iterations keep their metrics; the one that
                // panicked and those never started are missing.
                let lost = stage.iterations.saturating_sub(worker.stats.runs);
                tracing::error!(
                    "Worker of stage {} panicked after {} runs: {e}",
                    stage.id,
                    worker.stats.runs
                );
                worker.stats.merge(ExecutionStats {
                    runs: lost,
                    missing: lost,
                });
            }
            execution.merge(worker);
        }

        tracing::info!("Finished stage {}", stage.id);
        execution
    }

    /// What a worker has done so far. Outlives the task, so the runs it
    /// completed before a panic are still accounted for.
    pub type Progress<A> = Arc<Mutex<Execution<A>>>;

    /// A spawned virtual user.
    pub struct Worker<A: Aggregate> {
        pub handle: JoinHandle<()>,
        pub progress: Progress<A>,
    }

    /// Empties `progress`, even when its worker panicked while holding it.
    pub fn take_progress<A: Aggregate>(progress: &Progress<A>) -> Execution<A> {
        let mut guard = progress.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *guard, Execution::empty())
    }

    fn record<A: Aggregate>(progress: &Progress<A>, metric: Option<A::Metric>) -> bool {
        let mut execution = progress.lock().unwrap_or_else(PoisonError::into_inner);
        execution.stats.runs += 1;
        match metric {
            Some(metric) => {
                execution.aggregate.consume(&metric);
                true
            }
            None => {
                execution.stats.missing += 1;
                false
            }
        }
    }

    /// Spawns one task per virtual user of `stage`. Each one performs the
    /// stage's iterations sequentially.
    pub fn spawn_workers<A, F, Fut>(stage: &Stage, action: F) -> Vec<Worker<A>>
    where
        A: Aggregate + 'static,
        F: Fn(Stage) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Option<A::Metric>> + Send + 'static,
    {
        (0..stage.vus)
            .map(|vu| {
                let stage = stage.clone();
                let action = action.clone();
                let progress: Progress<A> = Arc::new(Mutex::new(Execution::empty()));
                let shared = Arc::clone(&progress);
                let handle = tokio::spawn(async move {
                    for iteration in 0..stage.iterations {
                        let metric = action(stage.clone()).await;
                        if !record(&shared, metric) {
                            tracing::debug!(
                                "Stage {} VU {vu} iteration {iteration} produced no metric",
                                stage.id
                            );
                        }
                    }
                });
                Worker { handle, progress }
            })
            .collect()
    }
}
