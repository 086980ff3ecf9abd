//! Hardware-adaptive control plane for local LLM inference.
//!
//! Probes the machine once, plans an execution configuration from what it
//! finds, loads a model under that plan and serves blocking or streamed
//! generation requests with cooperative cancellation.

mod backend;
pub mod cache;
pub mod config;
pub mod engine;
pub mod errors;
pub mod generation;
pub mod planner;
pub mod profiler;
pub mod prompting;
pub mod runtime;
pub mod warmup;

#[cfg(test)]
mod testing;

pub use adaptive_control_models as models;

pub use cache::{CacheDecision, CachePreparer, CacheShape};
pub use config::Settings;
pub use engine::{CandleLoader, ModelEngine, ModelHandle, ModelLoader, TextCodec};
pub use errors::{CacheError, ConfigError, EngineError, GenerationError, LoadError, PlanError};
pub use generation::{
    CancellationToken, GenerationCoordinator, GenerationRequest, GenerationStream, TokenEvent, Transcript,
};
pub use planner::{plan_execution_config, PlanOverrides};
pub use profiler::ResourceProfiler;
pub use runtime::InferenceService;
pub use warmup::WarmupOutcome;
