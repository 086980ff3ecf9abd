//! Optional preallocation of a fixed-shape kv cache.
//!
//! A static cache lets the engine capture the decode step as a device graph.
//! Whenever that is not possible the model keeps its dynamic cache; nothing
//! here ever fails a load.

use adaptive_control_models::{CacheStrategy, DeviceTarget, ExecutionConfig, HardwareProfile};
use serde::Serialize;

use crate::engine::{Modality, ModelEngine};
use crate::errors::CacheError;
use crate::planner::MIN_GRAPH_TOOLCHAIN;

pub const DEFAULT_CACHE_BATCH: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct CacheShape {
    pub max_batch: usize,
    pub max_seq_len: usize,
}

impl CacheShape {
    /// Batch 1, room for a reply twice the generation budget.
    pub fn for_config(config: &ExecutionConfig) -> Self {
        Self {
            max_batch: DEFAULT_CACHE_BATCH,
            max_seq_len: config.max_new_tokens.saturating_mul(2),
        }
    }
}

/// Engine-issued token for a preallocated cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheHandle {
    pub shape: CacheShape,
    /// Device-graph capture happens on the first real generation call.
    pub capture_pending: bool,
}

impl CacheHandle {
    /// Whether a sequence of `seq_len` tokens fits the preallocated shape.
    pub fn admits(&self, seq_len: usize) -> bool {
        seq_len <= self.shape.max_seq_len
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Ineligibility {
    DynamicRequested,
    CpuDevice,
    MultimodalWorkload,
}

#[derive(Debug)]
pub enum CacheDecision {
    Static(CacheHandle),
    NotEligible(Ineligibility),
    Degraded(CacheError),
}

impl CacheDecision {
    pub fn effective_strategy(&self) -> CacheStrategy {
        match self {
            Self::Static(_) => CacheStrategy::Static,
            Self::NotEligible(_) | Self::Degraded(_) => CacheStrategy::Dynamic,
        }
    }

    pub fn handle(&self) -> Option<&CacheHandle> {
        match self {
            Self::Static(handle) => Some(handle),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePreparer {
    graph_compile_available: bool,
}

impl CachePreparer {
    pub fn new(graph_compile_available: bool) -> Self {
        Self {
            graph_compile_available,
        }
    }

    pub fn for_profile(profile: &HardwareProfile) -> Self {
        Self::new(profile.recommendation.graph_compile_available)
    }

    pub fn prepare(
        &self,
        config: &ExecutionConfig,
        engine: &mut dyn ModelEngine,
        workload: Modality,
        shape: CacheShape,
    ) -> CacheDecision {
        let decision = self.decide(config, engine, workload, shape);
        match &decision {
            CacheDecision::Static(handle) => {
                tracing::info!(
                    max_batch = handle.shape.max_batch,
                    max_seq_len = handle.shape.max_seq_len,
                    "static kv cache allocated"
                );
            }
            CacheDecision::NotEligible(reason) => {
                tracing::debug!(?reason, "static kv cache not applicable");
            }
            CacheDecision::Degraded(err) => {
                tracing::warn!(error = %err, "static kv cache unavailable; keeping dynamic cache");
            }
        }
        decision
    }

    fn decide(
        &self,
        config: &ExecutionConfig,
        engine: &mut dyn ModelEngine,
        workload: Modality,
        shape: CacheShape,
    ) -> CacheDecision {
        if config.cache_strategy != CacheStrategy::Static {
            return CacheDecision::NotEligible(Ineligibility::DynamicRequested);
        }
        if config.device == DeviceTarget::Cpu {
            return CacheDecision::NotEligible(Ineligibility::CpuDevice);
        }
        if workload != Modality::Text {
            return CacheDecision::NotEligible(Ineligibility::MultimodalWorkload);
        }
        if !self.graph_compile_available {
            return CacheDecision::Degraded(CacheError::GraphCompileUnavailable {
                required: MIN_GRAPH_TOOLCHAIN,
            });
        }
        if shape.max_batch == 0 || shape.max_seq_len == 0 {
            return CacheDecision::Degraded(CacheError::InvalidShape {
                max_batch: shape.max_batch,
                max_seq_len: shape.max_seq_len,
            });
        }

        match engine.allocate_static_cache(shape) {
            Ok(handle) => CacheDecision::Static(handle),
            Err(err) => CacheDecision::Degraded(CacheError::Engine(err)),
        }
    }
}
