use std::future::Future;
use std::marker::PhantomData;

use typed_builder::TypedBuilder;

use crate::{
    aggregate::Aggregate,
    error::ExecutorError,
    executor::{Execution, Executor},
    stage::Stage,
};

/// Ties the per-run `action` to the executor that schedules it.
///
/// The action is called once per run with the stage it belongs to and
/// resolves to `None` when the run produced no metric (a failed connection,
/// for instance).
#[derive(Debug, Clone, TypedBuilder)]
pub struct Scenario<A, E, F, Fut>
where
    A: Aggregate,
    E: Executor<A, F, Fut> + Send + Sync,
    F: Fn(Stage) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = Option<A::Metric>> + Send + 'static,
{
    #[builder(setter(into))]
    pub name: String,
    pub action: F,
    pub executor: E,
    #[builder(default, setter(skip))]
    aggregator: PhantomData<A>,
}

impl<A, E, F, Fut> Scenario<A, E, F, Fut>
where
    A: Aggregate,
    E: Executor<A, F, Fut> + Send + Sync,
    F: Fn(Stage) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = Option<A::Metric>> + Send + 'static,
{
    pub async fn run(&self) -> Result<Execution<A>, ExecutorError> {
        self.executor.exec(self).await
    }
}
