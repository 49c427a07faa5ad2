//! Append-only store for tagged metric values.
//!
//! Runs never share counters. Each one records its results as new tagged
//! entries through a cloneable [`MetricSink`]; a single collector task drains
//! the channel in batches. Once every stage is done, [`MetricStore::finish`]
//! stops the collector and hands back a [`MetricSnapshot`] that can be grouped
//! by tag key.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};

use crate::{
    error::{StoreError, TagParseError},
    metric::Sample,
    stage::{StageId, TAG_SEPARATOR},
};

/// Average throughput of a run, MB/s.
pub const THROUGHPUT_SERIES: &str = "throughput_mbps";
/// Run duration, seconds.
pub const DURATION_SERIES: &str = "duration_seconds";
/// Body bytes, counter.
pub const PAYLOAD_SERIES: &str = "payload_bytes";
/// All bytes read, counter.
pub const TOTAL_SERIES: &str = "total_bytes";

/// Configured cap of the run, bytes per second.
pub const BANDWIDTH_DIM: &str = "bandwidth_limit";
/// [`crate::FramingOutcome`] of the run.
pub const FRAMING_DIM: &str = "framing";

const DEFAULT_CAPACITY: usize = 1024;

/// Labels attached to a recorded value. The stage is mandatory; any other
/// dimension is optional.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tags {
    stage: StageId,
    dims: BTreeMap<String, String>,
}

impl Tags {
    pub fn new(stage: StageId) -> Self {
        Self {
            stage,
            dims: BTreeMap::new(),
        }
    }

    /// Standard tags of a sample: its stage, configured cap and framing
    /// outcome.
    pub fn for_sample(sample: &Sample) -> Self {
        Self::new(sample.stage_id.clone())
            .with(BANDWIDTH_DIM, sample.bandwidth_limit.to_string())
            .with(FRAMING_DIM, sample.framing.as_str())
    }

    /// Reads a key built by [`Tags::key`] back.
    ///
    /// The stage is everything before the first separator. Keys without a
    /// separator, with an invalid stage id or with a dimension lacking `=`
    /// are rejected.
    pub fn parse(key: &str) -> Result<Self, TagParseError> {
        let (id, dims) = key
            .split_once(TAG_SEPARATOR)
            .ok_or_else(|| TagParseError::MissingSeparator(key.to_string()))?;
        let stage = StageId::new(id).map_err(|source| TagParseError::InvalidStageId {
            key: key.to_string(),
            source,
        })?;

        let mut tags = Self::new(stage);
        for dim in dims.split(',').filter(|d| !d.is_empty()) {
            let (k, v) = dim
                .split_once('=')
                .ok_or_else(|| TagParseError::MalformedDimension {
                    key: key.to_string(),
                    dim: dim.to_string(),
                })?;
            tags = tags.with(k, v);
        }
        Ok(tags)
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.dims.insert(key.into(), value.into());
        self
    }

    pub fn stage(&self) -> &StageId {
        &self.stage
    }

    pub fn dim(&self, key: &str) -> Option<&str> {
        self.dims.get(key).map(String::as_str)
    }

    /// `"<stage>:<k>=<v>,<k>=<v>"`, dimensions in key order.
    pub fn key(&self) -> String {
        let dims: Vec<String> = self.dims.iter().map(|(k, v)| format!("{k}={v}")).collect();
        format!("{}{TAG_SEPARATOR}{}", self.stage, dims.join(","))
    }
}

/// One recorded value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaggedValue {
    pub series: String,
    pub tag_key: String,
    pub value: f64,
}

/// Summary of every value recorded under one tag key of a series.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValueView {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

impl ValueView {
    fn new(value: f64) -> Self {
        Self {
            count: 1,
            sum: value,
            min: value,
            max: value,
        }
    }

    fn push(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    pub fn avg(&self) -> f64 {
        self.sum / self.count as f64
    }
}

/// Everything recorded during a test, in arrival order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub entries: Vec<TaggedValue>,
}

impl MetricSnapshot {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Groups the values of `series` by tag key.
    pub fn read_all_tagged_values(&self, series: &str) -> BTreeMap<String, ValueView> {
        let mut views: BTreeMap<String, ValueView> = BTreeMap::new();
        for entry in self.entries.iter().filter(|e| e.series == series) {
            views
                .entry(entry.tag_key.clone())
                .and_modify(|view| view.push(entry.value))
                .or_insert_with(|| ValueView::new(entry.value));
        }
        views
    }

    /// Sum of a counter series over every tag.
    pub fn total(&self, series: &str) -> f64 {
        self.entries
            .iter()
            .filter(|e| e.series == series)
            .map(|e| e.value)
            .sum()
    }
}

/// Cloneable handle used by runs to append values.
#[derive(Clone, Debug)]
pub struct MetricSink {
    tx: mpsc::Sender<TaggedValue>,
}

impl MetricSink {
    pub async fn record(&self, series: &str, value: f64, tags: &Tags) -> Result<(), StoreError> {
        let entry = TaggedValue {
            series: series.to_string(),
            tag_key: tags.key(),
            value,
        };
        self.tx.send(entry).await.map_err(|_| StoreError::Closed)
    }

    /// Records the four standard series of a sample.
    pub async fn record_sample(&self, sample: &Sample) -> Result<(), StoreError> {
        let tags = Tags::for_sample(sample);
        self.record(THROUGHPUT_SERIES, sample.throughput_mbps, &tags).await?;
        self.record(DURATION_SERIES, sample.duration_seconds, &tags).await?;
        self.record(PAYLOAD_SERIES, sample.payload_bytes as f64, &tags).await?;
        self.record(TOTAL_SERIES, sample.total_bytes as f64, &tags).await
    }
}

/// Owner side of the store: runs the collector task.
pub struct MetricStore {
    collector: JoinHandle<MetricSnapshot>,
    shutdown: watch::Sender<bool>,
}

impl MetricStore {
    pub fn spawn() -> (Self, MetricSink) {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// `capacity` bounds both the channel and the collector's batch size.
    pub fn with_capacity(capacity: usize) -> (Self, MetricSink) {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let collector = tokio::spawn(collector_task(rx, shutdown_rx, capacity));
        (
            Self {
                collector,
                shutdown,
            },
            MetricSink { tx },
        )
    }

    /// Stops accepting values and returns everything recorded so far.
    ///
    /// Values already queued are kept; sinks still alive afterwards get
    /// [`StoreError::Closed`].
    pub async fn finish(self) -> Result<MetricSnapshot, StoreError> {
        // The collector also stops on its own once every sink is gone, in
        // which case nobody listens anymore.
        let _ = self.shutdown.send(true);
        Ok(self.collector.await?)
    }
}

/// Drains `rx` in batches of up to `batch_size` until every sender is dropped
/// or shutdown is signalled.
pub(crate) async fn collector_task(
    mut rx: mpsc::Receiver<TaggedValue>,
    mut shutdown: watch::Receiver<bool>,
    batch_size: usize,
) -> MetricSnapshot {
    let mut snapshot = MetricSnapshot::default();
    let mut batch = Vec::with_capacity(batch_size);
    let mut stopped = false;

    loop {
        tokio::select! {
            biased;
            received = rx.recv_many(&mut batch, batch_size) => {
                if received == 0 {
                    break;
                }
                snapshot.entries.append(&mut batch);
            }
            _ = shutdown.wait_for(|stop| *stop) => {
                stopped = true;
                break;
            }
        }
    }

    if stopped {
        // Keep whatever was queued before the channel closed.
        rx.close();
        while let Some(entry) = rx.recv().await {
            snapshot.entries.push(entry);
        }
    }

    tracing::debug!("Metric collector stored {} values.", snapshot.entries.len());
    snapshot
}
