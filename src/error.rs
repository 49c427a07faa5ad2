use std::io;

use thiserror::Error;

use crate::stage::StageId;

/// Transport-level failure. Contained per run: the run is abandoned and no
/// sample is emitted for it.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection to {addr} refused: {reason}")]
    Refused { addr: String, reason: String },
    #[error("connection reset after {received} bytes")]
    Reset { received: u64 },
    #[error("write failed: {0}")]
    Write(String),
    #[error("connection already closed")]
    Closed,
    #[error("IO error")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StageIdError {
    #[error("stage id cannot be empty")]
    Empty,
    #[error("stage id `{0}` contains the tag separator `:`")]
    ContainsSeparator(String),
}

/// A tag key that could not be mapped back to a stage.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TagParseError {
    #[error("tag key `{0}` has no stage separator")]
    MissingSeparator(String),
    #[error("tag key `{key}` has an invalid stage id")]
    InvalidStageId {
        key: String,
        #[source]
        source: StageIdError,
    },
    #[error("tag key `{key}` has a dimension without `=`: `{dim}`")]
    MalformedDimension { key: String, dim: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file")]
    Io(#[from] io::Error),
    #[error("invalid config format")]
    Toml(#[from] toml::de::Error),
    #[error("no stages configured")]
    NoStages,
    #[error("stage {0} is configured more than once")]
    DuplicateStage(StageId),
    #[error("stage {0} has a zero bandwidth limit")]
    ZeroBandwidth(StageId),
    #[error("stage {0} has no virtual users or iterations")]
    EmptyStage(StageId),
    #[error("chunk size must be greater than zero")]
    ZeroChunkSize,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("metric store is closed")]
    Closed,
    #[error("metric collector task failed")]
    Collector(#[from] tokio::task::JoinError),
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("cannot write report")]
    Io(#[from] io::Error),
    #[error("cannot serialize report")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("stage {0} task panicked")]
    StagePanicked(StageId),
}

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    Report(#[from] ReportError),
}
