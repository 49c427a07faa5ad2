use std::fmt::Debug;
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};

use crate::{
    framing::{FramingOutcome, Transfer},
    macros::metric,
    stage::{Stage, StageId, MIB},
};

/// A `Metric` is a single observed measurement produced by one run.
///
/// Metrics are later folded into an [`crate::Aggregate`] and turned into a
/// [`crate::Report`]. They must be comparable, clonable, thread-safe and
/// serializable so they can be dumped raw when aggregation has nothing to show.
///
/// Use the [`metric`] attribute to derive everything at once:
///
/// ```rust
/// use trickle::{Metric, macros::metric};
///
/// #[metric]
/// struct ConnectLatency {
///     millis: u64,
/// }
/// ```
pub trait Metric
where
    Self: Serialize + DeserializeOwned + PartialOrd + PartialEq + Send + Sync + Debug + Clone,
{
}

/// Shortest duration a sample with data can report.
pub const MIN_DURATION: Duration = Duration::from_micros(1);

/// Result of one completed measurement run. Immutable once built.
#[metric]
pub struct Sample {
    pub stage_id: StageId,
    pub stage_name: String,
    /// Bytes per second cap configured for the run.
    pub bandwidth_limit: u64,
    /// Body bytes only.
    pub payload_bytes: u64,
    /// Every byte read, headers included.
    pub total_bytes: u64,
    pub duration_seconds: f64,
    pub throughput_mbps: f64,
    /// `Complete` for a zero-byte body, `Aborted` for a truncated or
    /// headerless stream; both report zero payload.
    pub framing: FramingOutcome,
}

impl Sample {
    pub fn new(stage: &Stage, transfer: &Transfer) -> Self {
        let mut duration = transfer.duration;
        if transfer.total_bytes > 0 {
            duration = duration.max(MIN_DURATION);
        }
        let duration_seconds = duration.as_secs_f64();

        Self {
            stage_id: stage.id.clone(),
            stage_name: stage.name.clone(),
            bandwidth_limit: stage.bandwidth_limit,
            payload_bytes: transfer.payload_bytes,
            total_bytes: transfer.total_bytes,
            duration_seconds,
            throughput_mbps: throughput_mbps(transfer.payload_bytes, duration_seconds),
            framing: transfer.outcome,
        }
    }

    pub fn header_bytes(&self) -> u64 {
        self.total_bytes - self.payload_bytes
    }
}

/// `bytes / seconds / 1024²`, or zero when no time elapsed.
pub fn throughput_mbps(bytes: u64, seconds: f64) -> f64 {
    if seconds > 0.0 {
        bytes as f64 / seconds / MIB as f64
    } else {
        0.0
    }
}
