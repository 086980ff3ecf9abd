//! Maps probed capabilities to an execution configuration.
//!
//! Pure and deterministic: the same inputs always produce the same output.

use adaptive_control_models::{
    AttentionImpl, CacheStrategy, Capabilities, ComputeTier, DeviceTarget, ExecutionConfig,
    HardwareProfile, Precision, Quantization, Recommendation, ToolchainVersion,
};
use serde::Deserialize;

use crate::errors::PlanError;

/// Oldest device-graph toolchain that supports capture of the decode step.
pub const MIN_GRAPH_TOOLCHAIN: ToolchainVersion = ToolchainVersion { major: 12, minor: 0 };

const CPU_MAX_NEW_TOKENS: usize = 512;
const CPU_MAX_INPUT_TOKENS: usize = 8192;

/// Caller-supplied replacements for individual recommended fields.
///
/// Values are kept as raw tokens until planning so that a malformed token is
/// reported as a configuration error of the load that supplied it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PlanOverrides {
    pub device: Option<String>,
    pub precision: Option<String>,
    pub quantization: Option<String>,
    pub attention: Option<String>,
    pub cache_strategy: Option<String>,
    pub max_new_tokens: Option<usize>,
    pub max_input_tokens: Option<usize>,
    pub workers: Option<usize>,
}

/// One rung of the accelerator-memory ladder.
struct MemoryRung {
    min_gb: f64,
    quantization: Quantization,
    max_new_tokens: usize,
    max_input_tokens: usize,
}

/// Ordered from the largest threshold down; the first rung whose threshold
/// is met wins.
const MEMORY_LADDER: [MemoryRung; 5] = [
    MemoryRung {
        min_gb: 24.0,
        quantization: Quantization::None,
        max_new_tokens: 4096,
        max_input_tokens: 131_072,
    },
    MemoryRung {
        min_gb: 16.0,
        quantization: Quantization::None,
        max_new_tokens: 4096,
        max_input_tokens: 65_536,
    },
    MemoryRung {
        min_gb: 10.0,
        quantization: Quantization::Int8,
        max_new_tokens: 2048,
        max_input_tokens: 32_768,
    },
    MemoryRung {
        min_gb: 6.0,
        quantization: Quantization::Int4,
        max_new_tokens: 2048,
        max_input_tokens: 16_384,
    },
    MemoryRung {
        min_gb: f64::NEG_INFINITY,
        quantization: Quantization::Int4,
        max_new_tokens: 1024,
        max_input_tokens: 8192,
    },
];

fn memory_rung(memory_gb: f64) -> &'static MemoryRung {
    MEMORY_LADDER
        .iter()
        .find(|rung| memory_gb >= rung.min_gb)
        .unwrap_or(&MEMORY_LADDER[MEMORY_LADDER.len() - 1])
}

pub fn recommend(caps: &Capabilities) -> Recommendation {
    let threads = caps.cpu_threads.max(1) as usize;

    let Some(accelerator) = &caps.accelerator else {
        return Recommendation {
            device: DeviceTarget::Cpu,
            precision: Precision::F32,
            // Large models only fit in host memory at 4 bits.
            quantization: Quantization::Int4,
            attention: AttentionImpl::Standard,
            max_new_tokens: CPU_MAX_NEW_TOKENS,
            max_input_tokens: CPU_MAX_INPUT_TOKENS,
            workers: (threads / 4).max(1),
            graph_compile_available: false,
            fused_attention_available: false,
        };
    };

    let tier = accelerator.tier();
    let (precision, fused) = match tier {
        ComputeTier::Modern => (Precision::Bf16, caps.fused_attention_kernel),
        ComputeTier::Mid | ComputeTier::Legacy => (Precision::F16, false),
    };
    let rung = memory_rung(accelerator.memory_gb);
    let graph_compile_available = caps
        .graph_toolchain
        .is_some_and(|version| version >= MIN_GRAPH_TOOLCHAIN);

    Recommendation {
        device: accelerator.target,
        precision,
        quantization: rung.quantization,
        attention: if fused {
            AttentionImpl::Fused
        } else {
            AttentionImpl::Standard
        },
        max_new_tokens: rung.max_new_tokens,
        max_input_tokens: rung.max_input_tokens,
        // One thread stays free for device dispatch.
        workers: (threads / 2).clamp(2, 8),
        graph_compile_available,
        fused_attention_available: fused,
    }
}

/// Builds the execution config: every set override replaces the recommended
/// value for that field, unset fields come from the profile.
pub fn plan_execution_config(
    profile: &HardwareProfile,
    overrides: &PlanOverrides,
) -> Result<ExecutionConfig, PlanError> {
    let rec = &profile.recommendation;

    let device = parse_or(&overrides.device, rec.device)?;
    let precision = parse_or(&overrides.precision, rec.precision)?;
    let quantization = parse_or(&overrides.quantization, rec.quantization)?;
    let attention = parse_or(&overrides.attention, rec.attention)?;
    let cache_strategy = parse_or(&overrides.cache_strategy, CacheStrategy::Dynamic)?;
    let max_new_tokens = nonzero_or("max_new_tokens", overrides.max_new_tokens, rec.max_new_tokens)?;
    let max_input_tokens =
        nonzero_or("max_input_tokens", overrides.max_input_tokens, rec.max_input_tokens)?;
    let workers = nonzero_or("workers", overrides.workers, rec.workers)?;

    if attention == AttentionImpl::Fused && !rec.fused_attention_available {
        tracing::warn!("fused attention requested but no fused kernel was detected");
    }
    if device.is_accelerator() && !profile.has_accelerator() {
        tracing::warn!(%device, "accelerator device requested on a machine without one");
    }

    let config = ExecutionConfig {
        device,
        precision,
        quantization,
        attention,
        max_input_tokens,
        max_new_tokens,
        workers,
        cache_strategy,
    };

    tracing::info!(
        device = %config.device,
        precision = %config.precision,
        quantization = %config.quantization,
        attention = %config.attention,
        max_new_tokens = config.max_new_tokens,
        max_input_tokens = config.max_input_tokens,
        workers = config.workers,
        cache = %config.cache_strategy,
        "execution config planned"
    );

    Ok(config)
}

fn parse_or<T>(raw: &Option<String>, fallback: T) -> Result<T, PlanError>
where
    T: std::str::FromStr<Err = adaptive_control_models::UnknownToken>,
{
    match raw.as_deref().map(str::trim) {
        None | Some("") | Some("auto") => Ok(fallback),
        Some(token) => Ok(token.parse()?),
    }
}

fn nonzero_or(field: &'static str, value: Option<usize>, fallback: usize) -> Result<usize, PlanError> {
    match value {
        Some(0) => Err(PlanError::ZeroBudget { field }),
        Some(v) => Ok(v),
        None => Ok(fallback),
    }
}
