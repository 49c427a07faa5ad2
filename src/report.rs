use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt::{self, Debug};
use std::future::Future;
use std::time::Duration;

use crate::{
    aggregate::{Aggregate, StageAggregate, SummaryAggregate},
    error::ReportError,
    executor::ExecutionStats,
    macros::report,
    stage::{StageId, MIB},
    store::{MetricSnapshot, TaggedValue},
};

/// A [`Report`] represents the processed form of an [`Aggregate`].
///
/// Reports transform raw aggregated data into meaningful insights such as
/// averages and totals. They are *pure data structures*, free of side effects
/// and I/O, and should encapsulate only the logic needed to derive final,
/// human- or machine-readable results.
///
/// Implementors must define how to construct the report from an [`Aggregate`]
/// via a [`From<A>`] implementation. Once created, a report can be serialized,
/// logged, or consumed by a [`Reporter`].
///
/// # Example
/// ```rust, ignore
/// use trickle::{Aggregate, Report};
/// use serde::{Serialize, Deserialize};
///
/// #[derive(Debug, Serialize, Deserialize)]
/// struct MyReport {
///     average_bytes: f64,
/// }
///
/// impl From<MyAggregate> for MyReport {
///     fn from(a: MyAggregate) -> Self {
///         Self { average_bytes: a.sum as f64 / a.count as f64 }
///     }
/// }
///
/// impl Report<MyAggregate> for MyReport {}
/// ```
///
/// The [`report`] attribute derives the boilerplate:
/// `#[report(MyAggregate)]` on the struct replaces the derives and the empty impl.
pub trait Report<A>
where
    Self: Send + Sync + Debug + From<A> + Serialize + DeserializeOwned,
    A: Aggregate,
{
}

/// A [`Reporter`] consumes a [`Report`] and performs side effects: displaying
/// it or persisting it somewhere.
///
/// Reporters are the I/O boundary. Keeping them apart lets the computation
/// layer (metrics → aggregates → reports) stay pure and deterministic.
///
/// # Example
/// ```rust
/// use trickle::{error::ReportError, Aggregate, Report, Reporter};
/// struct MyReporter;
/// impl<A: Aggregate, R: Report<A>> Reporter<A, R> for MyReporter {
///     async fn report(&self, report: &R) -> Result<(), ReportError> {
///         println!("{:?}", report);
///         Ok(())
///     }
/// }
/// ```
pub trait Reporter<A: Aggregate, R: Report<A>> {
    fn report(&self, report: &R) -> impl Future<Output = Result<(), ReportError>>;
}

/// Final numbers of one stage.
///
/// `None` marks a series that was never recorded for the stage. A stage that
/// measured nothing but did run shows `Some(0.0)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StageSummaryRow {
    pub stage_id: StageId,
    pub stage_label: String,
    pub bandwidth_limit: Option<u64>,
    /// Throughput values seen for the stage.
    pub samples: u64,
    pub avg_throughput_mbps: Option<f64>,
    pub avg_duration_seconds: Option<f64>,
    pub total_payload_mb: Option<f64>,
    /// Samples whose header terminator never arrived. They count as zero
    /// payload, like an empty body, but are not one.
    #[serde(default)]
    pub aborted: u64,
}

impl StageSummaryRow {
    pub fn new(id: &StageId, stage: &StageAggregate) -> Self {
        let avg = |sum: f64, count: u64| (count > 0).then(|| sum / count as f64);

        Self {
            stage_id: id.clone(),
            stage_label: stage.label.clone().unwrap_or_else(|| id.to_string()),
            bandwidth_limit: stage.bandwidth_limit,
            samples: stage.throughput_count,
            avg_throughput_mbps: avg(stage.throughput_sum, stage.throughput_count),
            avg_duration_seconds: avg(stage.duration_sum, stage.duration_count),
            total_payload_mb: (stage.payload_count > 0)
                .then(|| stage.payload_bytes / MIB as f64),
            aborted: stage.aborted_count,
        }
    }

    pub fn has_data(&self) -> bool {
        self.avg_throughput_mbps.is_some()
            || self.avg_duration_seconds.is_some()
            || self.total_payload_mb.is_some()
    }
}

/// Per-stage rows with byte totals over every stage.
#[report(SummaryAggregate)]
pub struct StageSummary {
    pub rows: Vec<StageSummaryRow>,
    pub total_bytes: u64,
    pub total_payload_bytes: u64,
    pub samples: u64,
}

impl From<SummaryAggregate> for StageSummary {
    fn from(value: SummaryAggregate) -> Self {
        let stages = value.stages.values();
        Self {
            rows: value.rows(),
            total_bytes: stages.clone().map(|s| s.total_bytes).sum::<f64>() as u64,
            total_payload_bytes: stages.clone().map(|s| s.payload_bytes).sum::<f64>() as u64,
            samples: stages.map(|s| s.throughput_count).sum(),
        }
    }
}

/// Everything a finished test produces.
///
/// Built from the aggregate, then completed with the client side numbers of
/// the run with [`HarnessReport::with_run`]. When no stage has any data the
/// raw recorded values are attached with [`HarnessReport::with_raw`].
#[report(SummaryAggregate)]
pub struct HarnessReport {
    pub stages: Vec<StageSummaryRow>,
    pub total_bytes_received: u64,
    pub total_payload_bytes: u64,
    pub test_duration_seconds: f64,
    /// All bytes received over the whole test duration, MB/s.
    pub avg_throughput_mbps: f64,
    pub runs: usize,
    pub missing_runs: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Vec<TaggedValue>>,
}

impl From<SummaryAggregate> for HarnessReport {
    fn from(value: SummaryAggregate) -> Self {
        let summary = StageSummary::from(value);
        Self {
            stages: summary.rows,
            total_bytes_received: summary.total_bytes,
            total_payload_bytes: summary.total_payload_bytes,
            test_duration_seconds: 0.0,
            avg_throughput_mbps: 0.0,
            runs: 0,
            missing_runs: 0,
            raw: None,
        }
    }
}

impl HarnessReport {
    pub fn with_run(mut self, elapsed: Duration, stats: &ExecutionStats) -> Self {
        let seconds = elapsed.as_secs_f64();
        self.test_duration_seconds = seconds;
        self.avg_throughput_mbps = if seconds > 0.0 {
            self.total_bytes_received as f64 / seconds / MIB as f64
        } else {
            0.0
        };
        self.runs = stats.runs;
        self.missing_runs = stats.missing;
        self
    }

    /// Attaches the recorded values when aggregation had nothing to show.
    pub fn with_raw(mut self, snapshot: MetricSnapshot) -> Self {
        if !self.has_data() {
            self.raw = Some(snapshot.entries);
        }
        self
    }

    pub fn has_data(&self) -> bool {
        self.stages.iter().any(StageSummaryRow::has_data)
    }
}

fn or_na(value: Option<f64>, precision: usize) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{v:.precision$}"))
}

impl fmt::Display for HarnessReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== STAGE SUMMARY ===")?;
        writeln!(
            f,
            "{:<8} {:<24} {:>12} {:>8} {:>10} {:>10} {:>11} {:>8}",
            "stage", "label", "limit B/s", "samples", "avg MB/s", "avg s", "payload MB", "aborted"
        )?;
        for row in &self.stages {
            let limit = row
                .bandwidth_limit
                .map_or_else(|| "n/a".to_string(), |l| l.to_string());
            writeln!(
                f,
                "{:<8} {:<24} {:>12} {:>8} {:>10} {:>10} {:>11} {:>8}",
                row.stage_id.as_str(),
                row.stage_label,
                limit,
                row.samples,
                or_na(row.avg_throughput_mbps, 2),
                or_na(row.avg_duration_seconds, 2),
                or_na(row.total_payload_mb, 2),
                row.aborted,
            )?;
        }

        writeln!(f, "\n=== CLIENT METRICS ===")?;
        writeln!(f, "Total bytes received: {}", self.total_bytes_received)?;
        writeln!(f, "Test duration: {:.2}s", self.test_duration_seconds)?;
        writeln!(f, "Average throughput: {:.2} MB/s", self.avg_throughput_mbps)?;
        write!(f, "Runs: {} ({} missing)", self.runs, self.missing_runs)?;
        if let Some(raw) = &self.raw {
            write!(f, "\nNo stage data, {} raw values attached.", raw.len())?;
        }
        Ok(())
    }
}

#[cfg(feature = "builtins")]
pub use builtins::*;

#[cfg(feature = "builtins")]
mod builtins {
    use std::path::PathBuf;

    use super::*;

    /// Prints the summary table.
    pub struct StdoutReporter;

    impl Reporter<SummaryAggregate, HarnessReport> for StdoutReporter {
        async fn report(&self, report: &HarnessReport) -> Result<(), ReportError> {
            println!("{report}");
            Ok(())
        }
    }

    /// Writes any report as pretty-printed JSON, creating parent directories.
    #[derive(Clone, Debug)]
    pub struct JsonFileReporter {
        pub path: PathBuf,
    }

    impl JsonFileReporter {
        pub fn new(path: impl Into<PathBuf>) -> Self {
            Self { path: path.into() }
        }
    }

    impl<A: Aggregate, R: Report<A>> Reporter<A, R> for JsonFileReporter {
        async fn report(&self, report: &R) -> Result<(), ReportError> {
            let json = serde_json::to_vec_pretty(report)?;
            if let Some(parent) = self.path.parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
            tokio::fs::write(&self.path, json).await?;
            tracing::info!("Report written to {}", self.path.display());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::KIB;

    fn aggregate() -> SummaryAggregate {
        let mut summary = SummaryAggregate::new();
        summary.stages.insert(
            StageId::from(1),
            StageAggregate {
                label: Some("Stage 1".into()),
                bandwidth_limit: Some(500 * KIB),
                throughput_sum: 1.0,
                throughput_count: 2,
                duration_sum: 4.0,
                duration_count: 2,
                payload_bytes: 2.0 * MIB as f64,
                payload_count: 2,
                total_bytes: 2.0 * MIB as f64 + 200.0,
                aborted_count: 1,
            },
        );
        summary.stages.insert(
            StageId::from(2),
            StageAggregate {
                label: Some("Stage 2".into()),
                bandwidth_limit: Some(MIB),
                ..StageAggregate::default()
            },
        );
        summary
    }

    #[test]
    fn rows_average_by_count() {
        let report = HarnessReport::from(aggregate());
        let row = &report.stages[0];
        assert_eq!(row.avg_throughput_mbps, Some(0.5));
        assert_eq!(row.avg_duration_seconds, Some(2.0));
        assert_eq!(row.total_payload_mb, Some(2.0));
        assert_eq!(row.samples, 2);
        assert_eq!(row.aborted, 1);
        assert!(!report.stages[1].has_data());
        assert_eq!(report.total_bytes_received, 2 * MIB + 200);
        assert_eq!(report.total_payload_bytes, 2 * MIB);
    }

    #[test]
    fn client_totals_use_all_bytes() {
        let stats = ExecutionStats { runs: 3, missing: 1 };
        let report = HarnessReport::from(aggregate()).with_run(Duration::from_secs(4), &stats);
        let expected = (2 * MIB + 200) as f64 / 4.0 / MIB as f64;
        assert_eq!(report.avg_throughput_mbps, expected);
        assert_eq!(report.runs, 3);
        assert_eq!(report.missing_runs, 1);

        let idle = HarnessReport::from(aggregate()).with_run(Duration::ZERO, &stats);
        assert_eq!(idle.avg_throughput_mbps, 0.0);
    }

    #[test]
    fn raw_values_only_without_stage_data() {
        let snapshot = MetricSnapshot {
            entries: vec![TaggedValue {
                series: "custom".into(),
                tag_key: "x".into(),
                value: 1.0,
            }],
        };

        let with_data = HarnessReport::from(aggregate()).with_raw(snapshot.clone());
        assert_eq!(with_data.raw, None);

        let empty = HarnessReport::from(SummaryAggregate::new()).with_raw(snapshot);
        assert_eq!(empty.raw.map(|r| r.len()), Some(1));
    }

    #[test]
    fn missing_values_serialize_as_null() {
        let report = HarnessReport::from(aggregate());
        let json = serde_json::to_value(&report).unwrap();
        assert!(json["stages"][1]["avg_throughput_mbps"].is_null());
        assert_eq!(json["stages"][0]["stage_id"], "1");
        assert_eq!(json["stages"][0]["aborted"], 1);
        assert!(json.get("raw").is_none());
    }

    #[test]
    fn table_marks_unavailable_stages() {
        let text = HarnessReport::from(aggregate()).to_string();
        assert!(text.contains("Stage 1"));
        let stage_two = text.lines().find(|l| l.contains("Stage 2")).unwrap();
        assert!(stage_two.contains("n/a"));
        assert!(text.contains("Total bytes received: 2097352"));
    }

    #[cfg(feature = "builtins")]
    #[tokio::test]
    async fn json_reporter_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results").join("summary.json");
        let report = HarnessReport::from(aggregate());

        let reporter = JsonFileReporter::new(&path);
        Reporter::<SummaryAggregate, _>::report(&reporter, &report)
            .await
            .unwrap();

        let written: HarnessReport =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(written, report);
    }
}
