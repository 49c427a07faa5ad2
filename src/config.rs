//! Test plan and connection settings, from TOML or built in code.
//!
//! Every field has a default, so an empty file describes the standard
//! three-stage download test:
//!
//! ```toml
//! address = "server:8080"
//! request = "GET /test?size=1048576 HTTP/1.1\r\nHost: server\r\nConnection: close\r\n\r\n"
//! receive_buffer = 65536
//! output = "results/summary.json"
//!
//! [framing]
//! chunk_size = 8192
//! termination = "on_close"
//!
//! [[stages]]
//! id = 1
//! name = "Stage 1: 500 KB/s"
//! bandwidth_limit = 512000
//! start_offset_secs = 0
//! ```
use std::{collections::HashSet, fs, path::Path, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    error::ConfigError,
    framing::FramingConfig,
    measurement::{download_request, Measurement},
    stage::{Stage, StageId, KIB, MIB},
};

pub const DEFAULT_ADDRESS: &str = "server:8080";
pub const DEFAULT_HOST: &str = "server";
/// Body size requested by the default plan.
pub const DEFAULT_RESPONSE_SIZE: u64 = MIB;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HarnessConfig {
    #[serde(default = "default_address")]
    pub address: String,
    /// Raw request written on every connection.
    #[serde(default = "default_request")]
    pub request: String,
    #[serde(default)]
    pub framing: FramingConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receive_buffer: Option<usize>,
    /// Where the JSON report goes, if anywhere.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,
    #[serde(default = "default_stages")]
    pub stages: Vec<Stage>,
}

fn default_address() -> String {
    DEFAULT_ADDRESS.to_string()
}

fn default_request() -> String {
    download_request(DEFAULT_HOST, DEFAULT_RESPONSE_SIZE)
}

/// 500 KiB/s from the start, 1 MiB/s with three users after 30s, 10 MiB/s
/// after 90s.
pub fn default_stages() -> Vec<Stage> {
    [
        (1, "Stage 1: 500 KB/s", 500 * KIB, 0, 1),
        (2, "Stage 2: 1 MB/s", MIB, 30, 3),
        (3, "Stage 3: 10 MB/s", 10 * MIB, 90, 1),
    ]
    .into_iter()
    .map(|(id, name, limit, offset, vus)| {
        Stage::builder()
            .id(StageId::from(id))
            .name(name)
            .bandwidth_limit(limit)
            .start_offset(Duration::from_secs(offset))
            .vus(vus)
            .build()
    })
    .collect()
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            request: default_request(),
            framing: FramingConfig::default(),
            receive_buffer: None,
            output: None,
            stages: default_stages(),
        }
    }
}

impl HarnessConfig {
    /// Parses and validates.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: HarnessConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        tracing::info!(
            "Loaded {} stages from {}",
            config.stages.len(),
            path.display()
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stages.is_empty() {
            return Err(ConfigError::NoStages);
        }
        if self.framing.chunk_size == 0 {
            return Err(ConfigError::ZeroChunkSize);
        }

        let mut seen = HashSet::new();
        for stage in &self.stages {
            if !seen.insert(&stage.id) {
                return Err(ConfigError::DuplicateStage(stage.id.clone()));
            }
            if stage.bandwidth_limit == 0 {
                return Err(ConfigError::ZeroBandwidth(stage.id.clone()));
            }
            if stage.vus == 0 || stage.iterations == 0 {
                return Err(ConfigError::EmptyStage(stage.id.clone()));
            }
        }
        Ok(())
    }

    pub fn measurement(&self) -> Measurement {
        Measurement {
            address: self.address.clone(),
            request: self.request.clone().into_bytes(),
            framing: self.framing.clone(),
            receive_buffer: self.receive_buffer,
        }
    }
}
