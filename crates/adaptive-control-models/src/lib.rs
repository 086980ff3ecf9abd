//! Plain data types shared between the inference kernel and its consumers
//! (chat front-ends, benchmark harnesses, diagnostics pages).
//!
//! Everything here is serde-friendly and free of behavior beyond parsing
//! and display. Policy lives in the kernel crate.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A textual token did not name any known variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} '{value}' (expected one of: {expected})")]
pub struct UnknownToken {
    pub kind: &'static str,
    pub value: String,
    pub expected: &'static str,
}

impl UnknownToken {
    pub fn new(kind: &'static str, value: &str, expected: &'static str) -> Self {
        Self {
            kind,
            value: value.to_string(),
            expected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceTarget {
    Cpu,
    Cuda,
    Metal,
}

impl DeviceTarget {
    pub fn is_accelerator(self) -> bool {
        !matches!(self, Self::Cpu)
    }
}

impl fmt::Display for DeviceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cpu => "cpu",
            Self::Cuda => "cuda",
            Self::Metal => "metal",
        })
    }
}

impl FromStr for DeviceTarget {
    type Err = UnknownToken;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda),
            "metal" | "mps" => Ok(Self::Metal),
            _ => Err(UnknownToken::new("device", s, "cpu, cuda, metal")),
        }
    }
}

/// Numeric precision used for activations and unquantized weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Precision {
    #[serde(rename = "float32")]
    F32,
    #[serde(rename = "float16")]
    F16,
    #[serde(rename = "bfloat16")]
    Bf16,
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::F32 => "float32",
            Self::F16 => "float16",
            Self::Bf16 => "bfloat16",
        })
    }
}

impl FromStr for Precision {
    type Err = UnknownToken;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "float32" | "f32" | "fp32" => Ok(Self::F32),
            "float16" | "f16" | "fp16" | "half" => Ok(Self::F16),
            "bfloat16" | "bf16" => Ok(Self::Bf16),
            _ => Err(UnknownToken::new(
                "precision",
                s,
                "float32, float16, bfloat16",
            )),
        }
    }
}

/// Weight quantization tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quantization {
    None,
    Int8,
    Int4,
}

impl Quantization {
    /// Higher means fewer bits per weight.
    pub fn aggressiveness(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Int8 => 1,
            Self::Int4 => 2,
        }
    }
}

impl fmt::Display for Quantization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Int8 => "int8",
            Self::Int4 => "int4",
        })
    }
}

impl FromStr for Quantization {
    type Err = UnknownToken;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "none" | "off" => Ok(Self::None),
            "int8" | "q8" => Ok(Self::Int8),
            "int4" | "q4" | "nf4" => Ok(Self::Int4),
            _ => Err(UnknownToken::new("quantization", s, "none, int8, int4")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttentionImpl {
    Standard,
    Fused,
}

impl fmt::Display for AttentionImpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Standard => "standard",
            Self::Fused => "fused",
        })
    }
}

impl FromStr for AttentionImpl {
    type Err = UnknownToken;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "standard" | "eager" | "sdpa" => Ok(Self::Standard),
            "fused" | "flash" | "flash_attention_2" => Ok(Self::Fused),
            _ => Err(UnknownToken::new("attention", s, "standard, fused")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStrategy {
    #[default]
    Dynamic,
    Static,
}

impl fmt::Display for CacheStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Dynamic => "dynamic",
            Self::Static => "static",
        })
    }
}

impl FromStr for CacheStrategy {
    type Err = UnknownToken;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "dynamic" => Ok(Self::Dynamic),
            "static" => Ok(Self::Static),
            _ => Err(UnknownToken::new("cache strategy", s, "dynamic, static")),
        }
    }
}

/// Accelerator generation bucket driving precision and fused-attention policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeTier {
    Legacy,
    Mid,
    Modern,
}

/// `major.minor` compute capability as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComputeCapability {
    pub major: u32,
    pub minor: u32,
}

impl ComputeCapability {
    pub fn tier(self) -> ComputeTier {
        match self.major {
            m if m >= 8 => ComputeTier::Modern,
            7 => ComputeTier::Mid,
            _ => ComputeTier::Legacy,
        }
    }
}

impl fmt::Display for ComputeCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for ComputeCapability {
    type Err = UnknownToken;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let (major, minor) = raw.split_once('.').unwrap_or((raw, "0"));
        match (major.trim().parse(), minor.trim().parse()) {
            (Ok(major), Ok(minor)) => Ok(Self { major, minor }),
            _ => Err(UnknownToken::new(
                "compute capability",
                s,
                "<major>.<minor>",
            )),
        }
    }
}

/// Version of the device-graph compile toolchain (e.g. CUDA 12.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ToolchainVersion {
    pub major: u32,
    pub minor: u32,
}

impl fmt::Display for ToolchainVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceleratorInfo {
    pub target: DeviceTarget,
    pub name: String,
    pub memory_gb: f64,
    /// `None` when the driver did not report it; treated as legacy.
    pub capability: Option<ComputeCapability>,
    pub count: u32,
}

impl AcceleratorInfo {
    pub fn tier(&self) -> ComputeTier {
        self.capability
            .map(ComputeCapability::tier)
            .unwrap_or(ComputeTier::Legacy)
    }
}

/// Raw probe results, before any policy is applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    pub cpu_name: String,
    pub cpu_cores: u32,
    pub cpu_threads: u32,
    pub system_memory_gb: f64,
    pub accelerator: Option<AcceleratorInfo>,
    pub fused_attention_kernel: bool,
    pub graph_toolchain: Option<ToolchainVersion>,
}

impl Capabilities {
    /// The most conservative machine the probes can fall back to.
    pub fn cpu_only(cpu_threads: u32) -> Self {
        let cpu_threads = cpu_threads.max(1);
        Self {
            cpu_name: String::new(),
            cpu_cores: (cpu_threads / 2).max(1),
            cpu_threads,
            system_memory_gb: 0.0,
            accelerator: None,
            fused_attention_kernel: false,
            graph_toolchain: None,
        }
    }
}

/// Settings derived from [`Capabilities`] by the planner's threshold ladder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recommendation {
    pub device: DeviceTarget,
    pub precision: Precision,
    pub quantization: Quantization,
    pub attention: AttentionImpl,
    pub max_new_tokens: usize,
    pub max_input_tokens: usize,
    pub workers: usize,
    pub graph_compile_available: bool,
    pub fused_attention_available: bool,
}

/// Immutable snapshot of the machine plus what the planner recommends for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareProfile {
    pub capabilities: Capabilities,
    pub recommendation: Recommendation,
}

impl HardwareProfile {
    pub fn has_accelerator(&self) -> bool {
        self.capabilities.accelerator.is_some()
    }

    pub fn summary(&self) -> String {
        let caps = &self.capabilities;
        let rec = &self.recommendation;
        match &caps.accelerator {
            Some(acc) => format!(
                "accelerator={} name=\"{}\" memory={:.1}GB cc={} count={} precision={} quant={} fused_attn={} graph_compile={}",
                acc.target,
                acc.name,
                acc.memory_gb,
                acc.capability
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "?".to_string()),
                acc.count,
                rec.precision,
                rec.quantization,
                rec.fused_attention_available,
                rec.graph_compile_available
            ),
            None => format!(
                "accelerator=none cpu={}C/{}T ram={:.1}GB quant={} workers={}",
                caps.cpu_cores, caps.cpu_threads, caps.system_memory_gb, rec.quantization, rec.workers
            ),
        }
    }
}

/// Policy decision every generation call runs under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionConfig {
    pub device: DeviceTarget,
    pub precision: Precision,
    pub quantization: Quantization,
    pub attention: AttentionImpl,
    pub max_input_tokens: usize,
    pub max_new_tokens: usize,
    pub workers: usize,
    pub cache_strategy: CacheStrategy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Whether each streamed event carries the new text only or everything so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    #[default]
    Delta,
    Cumulative,
}

impl FromStr for StreamMode {
    type Err = UnknownToken;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "delta" => Ok(Self::Delta),
            "cumulative" | "full" => Ok(Self::Cumulative),
            _ => Err(UnknownToken::new("stream mode", s, "delta, cumulative")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Completed,
    Cancelled,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precision_aliases_parse() {
        assert_eq!("bf16".parse::<Precision>(), Ok(Precision::Bf16));
        assert_eq!("Float16".parse::<Precision>(), Ok(Precision::F16));
        assert_eq!(" fp32 ".parse::<Precision>(), Ok(Precision::F32));

        let err = "float8".parse::<Precision>().expect_err("float8 is not supported");
        assert_eq!(err.kind, "precision");
        assert!(err.to_string().contains("float8"));
    }

    #[test]
    fn compute_capability_tiers() {
        let cc: ComputeCapability = "8.9".parse().expect("parse 8.9");
        assert_eq!(cc, ComputeCapability { major: 8, minor: 9 });
        assert_eq!(cc.tier(), ComputeTier::Modern);
        assert_eq!("12.0".parse::<ComputeCapability>().map(|c| c.tier()), Ok(ComputeTier::Modern));
        assert_eq!("7.5".parse::<ComputeCapability>().map(|c| c.tier()), Ok(ComputeTier::Mid));
        assert_eq!("6.1".parse::<ComputeCapability>().map(|c| c.tier()), Ok(ComputeTier::Legacy));
        assert!("n/a".parse::<ComputeCapability>().is_err());
    }

    #[test]
    fn execution_config_serializes_with_textual_tokens() {
        let cfg = ExecutionConfig {
            device: DeviceTarget::Cuda,
            precision: Precision::Bf16,
            quantization: Quantization::Int8,
            attention: AttentionImpl::Fused,
            max_input_tokens: 32768,
            max_new_tokens: 2048,
            workers: 8,
            cache_strategy: CacheStrategy::Static,
        };
        let json = serde_json::to_value(&cfg).expect("serialize config");
        assert_eq!(json["device"], "cuda");
        assert_eq!(json["precision"], "bfloat16");
        assert_eq!(json["quantization"], "int8");
        assert_eq!(json["cache_strategy"], "static");

        let back: ExecutionConfig = serde_json::from_value(json).expect("deserialize config");
        assert_eq!(back, cfg);
    }
}
