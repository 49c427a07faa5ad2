use std::collections::BTreeMap;
use std::fmt::Debug;

use serde::{de::DeserializeOwned, Serialize};

use crate::{
    framing::FramingOutcome,
    macros::aggregate,
    metric::{Metric, Sample},
    report::StageSummaryRow,
    stage::{Stage, StageId},
    store::{
        MetricSnapshot, Tags, ValueView, BANDWIDTH_DIM, DURATION_SERIES, FRAMING_DIM,
        PAYLOAD_SERIES, THROUGHPUT_SERIES, TOTAL_SERIES,
    },
};

/// The `Aggregate` trait defines how raw [`Metric`] values are collected and combined
/// into an intermediate, mergeable representation that preserves the information
/// necessary for later analysis.
///
/// **Important:** `Aggregate` implementations should **not** compute final statistics
/// such as averages. Those derived values belong in a [`crate::Report`], which is
/// converted from an `Aggregate` and performs the final processing. Aggregates keep
/// compact, mergeable raw data (counts and sums) so the report can compute accurate
/// summaries without losing information.
///
/// # Example
/// ```rust
/// use trickle::{Aggregate, macros::{aggregate, metric}};
///
/// #[metric]
/// struct Bytes(u64);
///
/// #[aggregate]
/// struct ByteCount {
///     count: u64,
///     sum: u64,
/// }
///
/// impl Aggregate for ByteCount {
///     type Metric = Bytes;
///
///     fn new() -> Self {
///         Self { count: 0, sum: 0 }
///     }
///
///     fn consume(&mut self, metric: &Self::Metric) {
///         self.count += 1;
///         self.sum += metric.0;
///     }
///
///     fn merge(&mut self, other: Self) {
///         self.count += other.count;
///         self.sum += other.sum;
///     }
/// }
/// ```
///
/// # Implementor notes
/// - `merge` must be **associative** and **commutative**: per-stage aggregates are
///   combined in no particular order.
/// - Leave averages and ratios to the report.
pub trait Aggregate
where
    Self: Serialize + DeserializeOwned + PartialOrd + PartialEq + Send + Sync + Debug + Clone,
{
    /// The metric type this aggregate summarizes.
    type Metric: Metric;

    /// Create a new, empty instance of the aggregate.
    fn new() -> Self;

    /// Aggregate multiple metrics into the current instance.
    fn aggregate(&mut self, metrics: &[Self::Metric]) {
        metrics.iter().for_each(|m| self.consume(m));
    }

    /// Incorporate a single metric into the aggregate.
    fn consume(&mut self, metric: &Self::Metric);

    /// Combine two different aggregates into one.
    fn merge(&mut self, other: Self);
}

/// Working record of one stage: sums and counts for every series.
///
/// A count of zero means the series was never recorded for the stage, which
/// the report shows as unavailable rather than zero.
#[aggregate]
#[derive(Default)]
pub struct StageAggregate {
    pub label: Option<String>,
    pub bandwidth_limit: Option<u64>,
    pub throughput_sum: f64,
    pub throughput_count: u64,
    pub duration_sum: f64,
    pub duration_count: u64,
    pub payload_bytes: f64,
    pub payload_count: u64,
    pub total_bytes: f64,
    /// Runs whose header terminator never arrived.
    pub aborted_count: u64,
}

impl StageAggregate {
    /// An empty record carrying what the plan says about the stage.
    pub fn planned(stage: &Stage) -> Self {
        Self {
            label: Some(stage.name.clone()),
            bandwidth_limit: Some(stage.bandwidth_limit),
            ..Self::default()
        }
    }

    /// Folds the view of one tag key into the matching running value.
    ///
    /// The tags fill in the cap when the plan did not, and mark aborted runs.
    pub fn absorb(&mut self, series: &str, tags: &Tags, view: &ValueView) {
        if self.bandwidth_limit.is_none() {
            self.bandwidth_limit = tags.dim(BANDWIDTH_DIM).and_then(|l| l.parse().ok());
        }
        match series {
            THROUGHPUT_SERIES => {
                self.throughput_sum += view.sum;
                self.throughput_count += view.count;
                if tags.dim(FRAMING_DIM) == Some(FramingOutcome::Aborted.as_str()) {
                    self.aborted_count += view.count;
                }
            }
            DURATION_SERIES => {
                self.duration_sum += view.sum;
                self.duration_count += view.count;
            }
            PAYLOAD_SERIES => {
                self.payload_bytes += view.sum;
                self.payload_count += view.count;
            }
            TOTAL_SERIES => self.total_bytes += view.sum,
            other => tracing::debug!("Ignoring unknown series `{other}`."),
        }
    }
}

impl Aggregate for StageAggregate {
    type Metric = Sample;

    fn new() -> Self {
        StageAggregate::default()
    }

    fn consume(&mut self, sample: &Sample) {
        self.label.get_or_insert_with(|| sample.stage_name.clone());
        self.bandwidth_limit.get_or_insert(sample.bandwidth_limit);
        self.throughput_sum += sample.throughput_mbps;
        self.throughput_count += 1;
        self.duration_sum += sample.duration_seconds;
        self.duration_count += 1;
        self.payload_bytes += sample.payload_bytes as f64;
        self.payload_count += 1;
        self.total_bytes += sample.total_bytes as f64;
        if sample.framing == FramingOutcome::Aborted {
            self.aborted_count += 1;
        }
    }

    fn merge(&mut self, other: Self) {
        if self.label.is_none() {
            self.label = other.label;
        }
        if self.bandwidth_limit.is_none() {
            self.bandwidth_limit = other.bandwidth_limit;
        }
        self.throughput_sum += other.throughput_sum;
        self.throughput_count += other.throughput_count;
        self.duration_sum += other.duration_sum;
        self.duration_count += other.duration_count;
        self.payload_bytes += other.payload_bytes;
        self.payload_count += other.payload_count;
        self.total_bytes += other.total_bytes;
        self.aborted_count += other.aborted_count;
    }
}

/// Every stage of a test, keyed and ordered by stage id.
#[aggregate]
#[derive(Default)]
pub struct SummaryAggregate {
    pub stages: BTreeMap<StageId, StageAggregate>,
}

impl SummaryAggregate {
    pub fn rows(&self) -> Vec<StageSummaryRow> {
        self.stages
            .iter()
            .map(|(id, stage)| StageSummaryRow::new(id, stage))
            .collect()
    }
}

impl Aggregate for SummaryAggregate {
    type Metric = Sample;

    fn new() -> Self {
        SummaryAggregate::default()
    }

    fn consume(&mut self, sample: &Sample) {
        self.stages
            .entry(sample.stage_id.clone())
            .or_default()
            .consume(sample);
    }

    fn merge(&mut self, other: Self) {
        for (id, stage) in other.stages {
            self.stages.entry(id).or_default().merge(stage);
        }
    }
}

/// Regroups the tagged values of a finished test by stage.
///
/// With a plan, every planned stage gets a row even when nothing was recorded
/// for it, and rows take their label and cap from the plan. Stages found only
/// in the data are labelled with their id and take their cap from the tags.
///
/// Aggregation is a pure function of the snapshot: running it twice yields
/// the same rows.
#[derive(Clone, Debug, Default)]
pub struct StageMetricsAggregator {
    plan: Vec<Stage>,
}

impl StageMetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plan(stages: &[Stage]) -> Self {
        Self {
            plan: stages.to_vec(),
        }
    }

    pub fn collect(&self, snapshot: &MetricSnapshot) -> SummaryAggregate {
        let mut summary = SummaryAggregate::new();
        for stage in &self.plan {
            summary
                .stages
                .insert(stage.id.clone(), StageAggregate::planned(stage));
        }

        for series in [THROUGHPUT_SERIES, DURATION_SERIES, PAYLOAD_SERIES, TOTAL_SERIES] {
            for (key, view) in snapshot.read_all_tagged_values(series) {
                let tags = match Tags::parse(&key) {
                    Ok(tags) => tags,
                    Err(e) => {
                        tracing::warn!("Skipping `{series}` entry: {e}");
                        continue;
                    }
                };
                summary
                    .stages
                    .entry(tags.stage().clone())
                    .or_default()
                    .absorb(series, &tags, &view);
            }
        }

        summary
    }

    /// One row per stage, ordered by stage id.
    pub fn aggregate(&self, snapshot: &MetricSnapshot) -> Vec<StageSummaryRow> {
        self.collect(snapshot).rows()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        stage::{KIB, MIB},
        store::TaggedValue,
    };

    fn stage(id: u32, limit: u64) -> Stage {
        Stage::builder()
            .id(StageId::from(id))
            .name(format!("Stage {id}"))
            .bandwidth_limit(limit)
            .build()
    }

    fn sample(stage: &Stage, payload: u64, seconds: f64) -> Sample {
        Sample {
            stage_id: stage.id.clone(),
            stage_name: stage.name.clone(),
            bandwidth_limit: stage.bandwidth_limit,
            payload_bytes: payload,
            total_bytes: payload + 100,
            duration_seconds: seconds,
            throughput_mbps: payload as f64 / seconds / MIB as f64,
            framing: FramingOutcome::Complete,
        }
    }

    fn entries(sample: &Sample) -> Vec<TaggedValue> {
        let key = Tags::for_sample(sample).key();
        [
            (THROUGHPUT_SERIES, sample.throughput_mbps),
            (DURATION_SERIES, sample.duration_seconds),
            (PAYLOAD_SERIES, sample.payload_bytes as f64),
            (TOTAL_SERIES, sample.total_bytes as f64),
        ]
        .into_iter()
        .map(|(series, value)| TaggedValue {
            series: series.into(),
            tag_key: key.clone(),
            value,
        })
        .collect()
    }

    fn snapshot(samples: &[Sample]) -> MetricSnapshot {
        MetricSnapshot {
            entries: samples.iter().flat_map(entries).collect(),
        }
    }

    #[test]
    fn one_row_per_stage_sorted_by_id() {
        let plan = [stage(10, 10 * MIB), stage(2, MIB), stage(1, 500 * KIB)];
        let samples: Vec<Sample> = plan.iter().map(|s| sample(s, MIB, 4.0)).collect();

        let rows = StageMetricsAggregator::with_plan(&plan).aggregate(&snapshot(&samples));

        let ids: Vec<&str> = rows.iter().map(|r| r.stage_id.as_str()).collect();
        assert_eq!(ids, ["1", "2", "10"]);
        for row in &rows {
            assert_eq!(row.avg_throughput_mbps, Some(0.25));
            assert_eq!(row.avg_duration_seconds, Some(4.0));
            assert_eq!(row.total_payload_mb, Some(1.0));
            assert_eq!(row.samples, 1);
        }
        assert_eq!(rows[0].stage_label, "Stage 1");
        assert_eq!(rows[2].bandwidth_limit, Some(10 * MIB));
    }

    #[test]
    fn repeated_samples_average_and_sum() {
        let s = stage(1, MIB);
        let rows = StageMetricsAggregator::new()
            .aggregate(&snapshot(&[sample(&s, MIB, 1.0), sample(&s, MIB, 3.0)]));

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].avg_duration_seconds, Some(2.0));
        assert_eq!(rows[0].total_payload_mb, Some(2.0));
        assert_eq!(rows[0].samples, 2);
        // Unplanned stages fall back to their id.
        assert_eq!(rows[0].stage_label, "1");
        assert_eq!(rows[0].bandwidth_limit, Some(MIB));
    }

    #[test]
    fn aborted_runs_are_counted_per_stage() {
        let s = stage(1, MIB);
        let mut aborted = sample(&s, 0, 1.0);
        aborted.framing = FramingOutcome::Aborted;
        let samples = [sample(&s, MIB, 1.0), aborted.clone(), aborted];

        let rows = StageMetricsAggregator::new().aggregate(&snapshot(&samples));
        assert_eq!(rows[0].samples, 3);
        assert_eq!(rows[0].aborted, 2);

        let mut direct = SummaryAggregate::new();
        direct.aggregate(&samples);
        assert_eq!(direct.rows()[0].aborted, 2);
    }

    #[test]
    fn planned_stage_without_data_is_unavailable() {
        let plan = [stage(1, MIB), stage(2, MIB), stage(3, MIB)];
        let samples = [sample(&plan[0], MIB, 1.0), sample(&plan[2], MIB, 1.0)];

        let rows = StageMetricsAggregator::with_plan(&plan).aggregate(&snapshot(&samples));

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1].avg_throughput_mbps, None);
        assert_eq!(rows[1].avg_duration_seconds, None);
        assert_eq!(rows[1].total_payload_mb, None);
        assert!(rows[0].avg_throughput_mbps.is_some());
        assert!(rows[2].avg_throughput_mbps.is_some());
    }

    #[test]
    fn zero_throughput_is_a_measurement() {
        let s = stage(1, MIB);
        let rows = StageMetricsAggregator::new().aggregate(&snapshot(&[sample(&s, 0, 1.0)]));
        assert_eq!(rows[0].avg_throughput_mbps, Some(0.0));
        assert_eq!(rows[0].total_payload_mb, Some(0.0));
    }

    #[test]
    fn malformed_keys_are_skipped() {
        let s = stage(1, MIB);
        let mut snap = snapshot(&[sample(&s, MIB, 1.0)]);
        snap.entries.push(TaggedValue {
            series: THROUGHPUT_SERIES.into(),
            tag_key: "garbage".into(),
            value: 99.0,
        });
        snap.entries.push(TaggedValue {
            series: PAYLOAD_SERIES.into(),
            tag_key: ":no-id".into(),
            value: 99.0,
        });
        snap.entries.push(TaggedValue {
            series: PAYLOAD_SERIES.into(),
            tag_key: "1:bandwidth_limit".into(),
            value: 99.0,
        });

        let rows = StageMetricsAggregator::new().aggregate(&snap);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].avg_throughput_mbps, Some(1.0));
        assert_eq!(rows[0].total_payload_mb, Some(1.0));
    }

    #[test]
    fn nothing_recorded_means_no_rows() {
        let rows = StageMetricsAggregator::new().aggregate(&MetricSnapshot::default());
        assert!(rows.is_empty());
    }

    #[test]
    fn aggregation_is_idempotent() {
        let plan = [stage(1, MIB), stage(2, MIB)];
        let snap = snapshot(&[sample(&plan[0], 3 * MIB, 7.0), sample(&plan[0], MIB, 0.3)]);
        let aggregator = StageMetricsAggregator::with_plan(&plan);

        assert_eq!(aggregator.aggregate(&snap), aggregator.aggregate(&snap));
    }

    #[test]
    fn tagged_path_matches_direct_consumption() {
        let plan = [stage(1, 500 * KIB), stage(2, MIB)];
        let samples = [
            sample(&plan[0], MIB, 2.0),
            sample(&plan[1], 2 * MIB, 2.0),
            sample(&plan[1], MIB, 1.5),
        ];

        let mut direct = SummaryAggregate::new();
        direct.aggregate(&samples);
        let tagged = StageMetricsAggregator::with_plan(&plan).collect(&snapshot(&samples));

        assert_eq!(direct.rows(), tagged.rows());
    }

    #[test]
    fn merge_combines_stage_records() {
        let s1 = stage(1, MIB);
        let s2 = stage(2, MIB);
        let mut a = SummaryAggregate::new();
        a.consume(&sample(&s1, MIB, 1.0));
        let mut b = SummaryAggregate::new();
        b.consume(&sample(&s1, MIB, 1.0));
        b.consume(&sample(&s2, MIB, 1.0));

        a.merge(b);
        assert_eq!(a.stages.len(), 2);
        assert_eq!(a.stages[&StageId::from(1)].throughput_count, 2);
        assert_eq!(a.stages[&StageId::from(1)].label.as_deref(), Some("Stage 1"));
    }
}
