//! One measurement run: connect, cap, request, read, close.
use typed_builder::TypedBuilder;

use crate::{
    error::ConnectionError,
    framing::{FramingConfig, FramingReader},
    metric::Sample,
    stage::Stage,
    store::MetricSink,
    transport::{Connector, ThrottledConnection},
};

/// `GET /test?size=<size>` with `Connection: close`, so the server ends the
/// stream after the body.
pub fn download_request(host: &str, size: u64) -> String {
    format!("GET /test?size={size} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n")
}

/// Everything a run needs besides the stage.
///
/// ```
/// use trickle::measurement::{download_request, Measurement};
///
/// let measurement = Measurement::builder()
///     .address("server:8080")
///     .request(download_request("server", 1024 * 1024))
///     .receive_buffer(64 * 1024)
///     .build();
/// assert_eq!(measurement.framing.chunk_size, 8192);
/// ```
#[derive(Clone, Debug, TypedBuilder)]
pub struct Measurement {
    /// Default target, a stage may override it.
    #[builder(setter(into))]
    pub address: String,
    /// Sent as is.
    #[builder(setter(into))]
    pub request: Vec<u8>,
    #[builder(default)]
    pub framing: FramingConfig,
    #[builder(default, setter(strip_option))]
    pub receive_buffer: Option<usize>,
}

impl Measurement {
    pub fn address_for<'a>(&'a self, stage: &'a Stage) -> &'a str {
        stage.address.as_deref().unwrap_or(&self.address)
    }
}

/// Performs one run of `stage`.
///
/// The connection is closed whatever the outcome. Transport errors are
/// returned and no sample exists for the run.
pub async fn measure<C: Connector>(
    connector: &C,
    stage: &Stage,
    measurement: &Measurement,
) -> Result<Sample, ConnectionError> {
    let addr = measurement.address_for(stage);
    let mut conn = connector.connect(addr).await?;
    let result = download(&mut conn, stage, measurement).await;
    if let Err(e) = conn.close().await {
        tracing::debug!("Closing connection to {addr} failed: {e}");
    }
    result
}

async fn download<T: ThrottledConnection>(
    conn: &mut T,
    stage: &Stage,
    measurement: &Measurement,
) -> Result<Sample, ConnectionError> {
    conn.set_bandwidth_limit(stage.bandwidth_limit);
    if let Some(bytes) = measurement.receive_buffer {
        if let Err(e) = conn.set_receive_buffer(bytes) {
            tracing::debug!("Receive buffer hint of {bytes} bytes rejected: {e}");
        }
    }
    conn.write(&measurement.request).await?;

    let transfer = FramingReader::new(conn, measurement.framing.clone())
        .run()
        .await?;
    let sample = Sample::new(stage, &transfer);
    tracing::info!(
        "Stage {}: {} bytes payload ({} total) in {:.3}s ({:.2} MB/s)",
        stage.id,
        sample.payload_bytes,
        sample.total_bytes,
        sample.duration_seconds,
        sample.throughput_mbps
    );
    Ok(sample)
}

/// [`measure`], then append the sample to the store.
///
/// Failures are contained: they are logged and the run yields `None`.
pub async fn measure_and_record<C: Connector>(
    connector: &C,
    stage: &Stage,
    measurement: &Measurement,
    sink: &MetricSink,
) -> Option<Sample> {
    let sample = match measure(connector, stage, measurement).await {
        Ok(sample) => sample,
        Err(e) => {
            tracing::warn!("Stage {} run failed: {e}", stage.id);
            return None;
        }
    };

    if let Err(e) = sink.record_sample(&sample).await {
        tracing::error!("Stage {} sample could not be recorded: {e}", stage.id);
        return None;
    }
    Some(sample)
}

#[cfg(all(test, feature = "builtins"))]
mod tests {
    use super::*;
    use crate::{
        framing::FramingOutcome,
        stage::{StageId, KIB},
        store::{MetricStore, PAYLOAD_SERIES, THROUGHPUT_SERIES},
        transport::scripted::{http_response, Script, ScriptedConnection, ScriptedConnector},
    };

    fn stage() -> Stage {
        Stage::builder()
            .id(StageId::from(1))
            .name("Stage 1")
            .bandwidth_limit(256 * KIB)
            .build()
    }

    fn measurement() -> Measurement {
        Measurement::builder()
            .address("server:8080")
            .request(download_request("server", 4096))
            .build()
    }

    #[test]
    fn request_matches_the_server_route() {
        assert_eq!(
            download_request("server", 1048576),
            "GET /test?size=1048576 HTTP/1.1\r\nHost: server\r\nConnection: close\r\n\r\n"
        );
    }

    #[test]
    fn stage_address_overrides_default() {
        let m = measurement();
        assert_eq!(m.address_for(&stage()), "server:8080");
        let mut moved = stage();
        moved.address = Some("other:9000".into());
        assert_eq!(m.address_for(&moved), "other:9000");
    }

    #[tokio::test(start_paused = true)]
    async fn measures_payload_and_sends_request() {
        let connector =
            ScriptedConnector::new(Script::builder().response(http_response(4096)).build());

        let sample = measure(&connector, &stage(), &measurement()).await.unwrap();

        assert_eq!(sample.payload_bytes, 4096);
        assert!(sample.total_bytes > 4096);
        assert_eq!(sample.framing, FramingOutcome::Complete);
        assert!(sample.throughput_mbps > 0.0);
        assert!(sample.throughput_mbps <= 0.25);
        assert_eq!(
            connector.requests().await,
            vec![download_request("server", 4096).into_bytes()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn recorded_sample_lands_in_the_store() {
        let connector =
            ScriptedConnector::new(Script::builder().response(http_response(4096)).build());
        let (store, sink) = MetricStore::spawn();

        let sample = measure_and_record(&connector, &stage(), &measurement(), &sink).await;
        assert!(sample.is_some());

        let snapshot = store.finish().await.unwrap();
        assert_eq!(snapshot.total(PAYLOAD_SERIES), 4096.0);
        assert_eq!(snapshot.read_all_tagged_values(THROUGHPUT_SERIES).len(), 1);
    }

    #[tokio::test]
    async fn cap_and_buffer_hint_reach_the_connection() {
        let script = Script::builder().response(http_response(64)).build();
        let mut conn = ScriptedConnection::new(script.clone());
        let measurement = Measurement::builder()
            .address("server:8080")
            .request(download_request("server", 64))
            .receive_buffer(32 * KIB as usize)
            .build();

        let sample = download(&mut conn, &stage(), &measurement).await.unwrap();

        assert_eq!(sample.payload_bytes, 64);
        assert_eq!(conn.bandwidth_limit(), Some(256 * KIB));
        assert_eq!(conn.receive_buffer(), Some(32 * KIB as usize));

        let mut plain = ScriptedConnection::new(script);
        download(&mut plain, &stage(), &self::measurement()).await.unwrap();
        assert_eq!(plain.receive_buffer(), None);
    }

    #[tokio::test]
    async fn failed_run_records_nothing() {
        let connector =
            ScriptedConnector::new(Script::builder().response(http_response(16)).build())
                .refuse("server:8080");
        let (store, sink) = MetricStore::spawn();

        let sample = measure_and_record(&connector, &stage(), &measurement(), &sink).await;
        assert!(sample.is_none());
        assert!(store.finish().await.unwrap().is_empty());
    }
}
