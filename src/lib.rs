//! Trickle — bandwidth-throttled download measurements for staged load tests.
//!
//! Each run opens a connection through a rate-limited transport, sends a fixed
//! request and reads the HTTP response in whatever chunks the throttle lets
//! through, splitting header bytes from payload bytes on the fly. Runs are
//! grouped in stages with different bandwidth caps; every run records tagged
//! values in a shared store and, once all stages are over, those values are
//! regrouped into one summary row per stage.
//!
//! # Architecture
//!
//! The main building blocks are:
//!
//! - [`FramingReader`]: the read loop of a single run. It finds the end of the
//!   response headers even when `\r\n\r\n` is split across chunks.
//! - [`ThrottledConnection`] / [`Connector`]: the transport seam. Rate limiting
//!   is the transport's job; a scripted loopback transport ships with the
//!   `builtins` feature.
//! - [`Metric`]: a single sample produced by a run. [`Sample`] is the one
//!   trickle records.
//! - [`MetricStore`]: append-only store of tagged values shared by every run.
//! - [`Aggregate`]: a mergeable intermediate representation of metrics.
//!   [`StageMetricsAggregator`] builds one from the store, keyed by stage.
//! - [`Report`] / [`Reporter`]: final numbers and where they go.
//! - [`Scenario`] / [`Executor`]: what a run does and when runs start. The
//!   [`StageExecutor`] starts every stage at its offset and waits for all of
//!   them.
//! - [`Harness`]: the glue, driven by a [`HarnessConfig`].
//!
//! # Example
//!
//! A dry run against the scripted transport:
//!
//! ```rust
//! use trickle::{
//!     config::HarnessConfig,
//!     transport::scripted::{http_response, Script, ScriptedConnector},
//!     Harness,
//! };
//!
//! # #[tokio::main(flavor = "current_thread", start_paused = true)]
//! # async fn main() {
//! let connector = ScriptedConnector::new(
//!     Script::builder().response(http_response(64 * 1024)).build(),
//! );
//! let harness = Harness::new(HarnessConfig::default(), connector).unwrap();
//! let report = harness.run().await.unwrap();
//!
//! assert_eq!(report.stages.len(), 3);
//! assert!(report.stages.iter().all(|row| row.avg_throughput_mbps.is_some()));
//! # }
//! ```
//!
//! # Feature flags
//! - `builtins`: the scripted transport and the stdout/JSON reporters. (Enabled by default)
//! - `internals`: enable access to internal (and unstable) executor functions

extern crate self as trickle;

/// Metric aggregators
pub mod aggregate;
/// Plan and connection settings
pub mod config;
pub mod error;
/// Orchestrators that define how runs are scheduled
pub mod executor;
pub mod framing;
pub mod harness;
pub mod measurement;
/// Single metrics
pub mod metric;
/// Reports and Reporters
pub mod report;
/// Glue between an action and its executor
pub mod scenario;
pub mod stage;
pub mod store;
pub mod transport;

pub use aggregate::{Aggregate, StageMetricsAggregator};
pub use config::HarnessConfig;
pub use executor::{Executor, StageExecutor};
pub use framing::{FramingConfig, FramingOutcome, FramingReader, TerminationPolicy};
pub use harness::Harness;
pub use metric::{Metric, Sample};
pub use report::{HarnessReport, Report, Reporter, StageSummaryRow};
pub use scenario::Scenario;
pub use stage::{Stage, StageId};
pub use store::{MetricSink, MetricSnapshot, MetricStore};
pub use transport::{Connector, ThrottledConnection};

/// Procedural macros to reduce boilerplate
pub mod macros {
    pub use trickle_macros::*;
}
