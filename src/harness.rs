//! The whole test: stages → runs → store → aggregation → report.
use std::sync::Arc;

use tokio::time::Instant;

use crate::{
    aggregate::{StageMetricsAggregator, SummaryAggregate},
    config::HarnessConfig,
    error::HarnessError,
    executor::StageExecutor,
    measurement::measure_and_record,
    report::HarnessReport,
    scenario::Scenario,
    stage::Stage,
    store::MetricStore,
    transport::Connector,
};

pub struct Harness<C> {
    config: HarnessConfig,
    connector: Arc<C>,
}

impl<C: Connector + 'static> Harness<C> {
    pub fn new(config: HarnessConfig, connector: C) -> Result<Self, HarnessError> {
        config.validate()?;
        Ok(Self {
            config,
            connector: Arc::new(connector),
        })
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Runs every stage and aggregates what they recorded.
    ///
    /// Failed runs only show up as missing runs and, when a whole stage
    /// failed, as an unavailable row.
    pub async fn run(&self) -> Result<HarnessReport, HarnessError> {
        let (store, sink) = MetricStore::spawn();
        let measurement = Arc::new(self.config.measurement());
        let connector = Arc::clone(&self.connector);
        let action = move |stage: Stage| {
            let connector = Arc::clone(&connector);
            let measurement = Arc::clone(&measurement);
            let sink = sink.clone();
            async move { measure_and_record(connector.as_ref(), &stage, &measurement, &sink).await }
        };

        let started = Instant::now();
        let execution = Scenario::<SummaryAggregate, _, _, _>::builder()
            .name("staged download")
            .action(action)
            .executor(
                StageExecutor::builder()
                    .stages(self.config.stages.clone())
                    .build(),
            )
            .build()
            .run()
            .await?;
        let elapsed = started.elapsed();

        let snapshot = store.finish().await?;
        tracing::info!("Test finished, aggregating {} values", snapshot.entries.len());
        let summary = StageMetricsAggregator::with_plan(&self.config.stages).collect(&snapshot);

        let returned: u64 = execution
            .aggregate
            .stages
            .values()
            .map(|s| s.throughput_count)
            .sum();
        let stored: u64 = summary.stages.values().map(|s| s.throughput_count).sum();
        if returned != stored {
            tracing::warn!("Runs returned {returned} samples but {stored} were stored");
        }

        let report = HarnessReport::from(summary)
            .with_run(elapsed, &execution.stats)
            .with_raw(snapshot);
        if let Some(raw) = &report.raw {
            tracing::warn!(
                "No stage produced any data, attaching {} raw values to the report",
                raw.len()
            );
        }
        Ok(report)
    }

    /// [`Harness::run`], then print the summary and write the JSON report
    /// when an output path is configured.
    #[cfg(feature = "builtins")]
    pub async fn run_and_report(&self) -> Result<HarnessReport, HarnessError> {
        use crate::report::{JsonFileReporter, Reporter, StdoutReporter};

        let report = self.run().await?;
        StdoutReporter.report(&report).await?;
        if let Some(path) = &self.config.output {
            let reporter = JsonFileReporter::new(path);
            Reporter::<SummaryAggregate, _>::report(&reporter, &report).await?;
        }
        Ok(report)
    }
}
