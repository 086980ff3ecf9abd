use std::path::PathBuf;
use std::time::Duration;

use adaptive_control_models::{ToolchainVersion, UnknownToken};

/// A single hardware probe step could not be completed.
///
/// Never surfaced to callers: the profiler logs it and substitutes a
/// conservative default.
#[derive(Debug, thiserror::Error)]
pub enum ProbeDegradation {
    #[error("probe source {source_name} unavailable: {detail}")]
    Unavailable {
        source_name: &'static str,
        detail: String,
    },
    #[error("failed to parse {field} from {source_name}: {detail}")]
    Parse {
        source_name: &'static str,
        field: &'static str,
        detail: String,
    },
    #[error("failed to run {command}: {source}")]
    Command {
        command: &'static str,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("invalid override: {0}")]
    OverrideConflict(#[from] UnknownToken),
    #[error("invalid override: {field} must be greater than zero")]
    ZeroBudget { field: &'static str },
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("engine cannot allocate a static cache: {0}")]
    Engine(#[from] EngineError),
    #[error("invalid static cache shape: batch={max_batch} seq_len={max_seq_len}")]
    InvalidShape { max_batch: usize, max_seq_len: usize },
    #[error("device-graph toolchain missing or older than {required}")]
    GraphCompileUnavailable { required: ToolchainVersion },
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{0} is not supported by this engine")]
    Unsupported(&'static str),
    #[error("model file not found: {0}")]
    ModelNotFound(PathBuf),
    #[error("tokenizer not found for model {0}")]
    TokenizerNotFound(PathBuf),
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl From<candle_core::Error> for EngineError {
    fn from(err: candle_core::Error) -> Self {
        Self::Backend(err.into())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("model execution failed: {0}")]
    Engine(#[from] EngineError),
    #[error("no output from generation worker within {0:?}")]
    StreamTimeout(Duration),
    #[error("generation worker exited without finishing")]
    WorkerLost,
    #[error("failed to spawn generation worker: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("input is {tokens} tokens, limit is {limit}")]
    InputTooLong { tokens: usize, limit: usize },
    #[error("chat template failed: {0}")]
    Template(#[from] minijinja::Error),
    #[error("invalid generation parameter: {0}")]
    InvalidParameter(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read settings file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid settings file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {detail}")]
    Invalid { key: String, detail: String },
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("execution config rejected: {0}")]
    Plan(#[from] PlanError),
    #[error("model load failed: {0}")]
    Engine(#[from] EngineError),
}
