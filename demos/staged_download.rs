//! Dry run of a staged download test against the scripted transport.
//!
//! ```text
//! cargo run --example staged_download [plan.toml]
//! RUST_LOG=trickle=debug cargo run --example staged_download
//! ```
use trickle::{
    config::{HarnessConfig, DEFAULT_RESPONSE_SIZE},
    transport::scripted::{http_response, Chunking, Script, ScriptedConnector},
    Harness,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => HarnessConfig::load(path)?,
        None => HarnessConfig::default(),
    };

    // Every connection replays the test server's answer to the default request,
    // handed out in socket-sized pieces.
    let connector = ScriptedConnector::new(
        Script::builder()
            .response(http_response(DEFAULT_RESPONSE_SIZE as usize))
            .chunking(Chunking::Sizes(vec![1460, 2920, 512, 8192]))
            .build(),
    );

    let harness = Harness::new(config, connector)?;
    harness.run_and_report().await?;
    Ok(())
}
