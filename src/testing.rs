//! Fakes shared by unit tests: canned probes, a scripted engine and a
//! byte-level codec.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use adaptive_control_models::{
    AcceleratorInfo, AttentionImpl, CacheStrategy, Capabilities, ComputeCapability, DeviceTarget,
    ExecutionConfig, HardwareProfile, Message, Precision, Quantization, ToolchainVersion,
};
use anyhow::anyhow;

use crate::cache::{CacheHandle, CacheShape};
use crate::engine::{LoadOptions, LoadedModel, ModelEngine, ModelHandle, ModelLoader, ModelSpec, SamplingParams, TextCodec};
use crate::errors::{EngineError, ProbeDegradation};
use crate::planner;
use crate::profiler::ProbeSource;
use crate::prompting::{render_chat, PromptFamily};

pub fn cpu_caps(threads: u32, ram_gb: f64) -> Capabilities {
    Capabilities {
        cpu_name: "test cpu".to_string(),
        cpu_cores: (threads / 2).max(1),
        cpu_threads: threads,
        system_memory_gb: ram_gb,
        accelerator: None,
        fused_attention_kernel: false,
        graph_toolchain: None,
    }
}

pub fn accelerator_caps(memory_gb: f64, capability: ComputeCapability, threads: u32) -> Capabilities {
    Capabilities {
        accelerator: Some(AcceleratorInfo {
            target: DeviceTarget::Cuda,
            name: "test gpu".to_string(),
            memory_gb,
            capability: Some(capability),
            count: 1,
        }),
        ..cpu_caps(threads, 64.0)
    }
}

pub fn profile_from(capabilities: Capabilities) -> HardwareProfile {
    let recommendation = planner::recommend(&capabilities);
    HardwareProfile {
        capabilities,
        recommendation,
    }
}

pub fn execution_config(device: DeviceTarget) -> ExecutionConfig {
    ExecutionConfig {
        device,
        precision: Precision::F32,
        quantization: Quantization::Int4,
        attention: AttentionImpl::Standard,
        max_input_tokens: 8192,
        max_new_tokens: 512,
        workers: 2,
        cache_strategy: CacheStrategy::Dynamic,
    }
}

fn unavailable(source_name: &'static str) -> ProbeDegradation {
    ProbeDegradation::Unavailable {
        source_name,
        detail: "fake probe".to_string(),
    }
}

/// Probe with canned answers; `None` fields fail.
#[derive(Debug, Clone)]
pub struct FakeProbe {
    pub cpu_name: Option<String>,
    pub threads: Option<u32>,
    pub cores: Option<u32>,
    pub memory_gb: Option<f64>,
    pub accelerator: Option<AcceleratorInfo>,
    pub accelerator_fails: bool,
    pub toolchain: Option<ToolchainVersion>,
    pub fused_kernel: bool,
}

impl FakeProbe {
    pub fn broken() -> Self {
        Self {
            cpu_name: None,
            threads: None,
            cores: None,
            memory_gb: None,
            accelerator: None,
            accelerator_fails: true,
            toolchain: None,
            fused_kernel: false,
        }
    }

    pub fn cpu_only(threads: u32) -> Self {
        Self {
            cpu_name: Some("fake cpu".to_string()),
            threads: Some(threads),
            cores: Some((threads / 2).max(1)),
            memory_gb: Some(32.0),
            accelerator_fails: false,
            ..Self::broken()
        }
    }

    pub fn with_accelerator(memory_gb: f64, capability: ComputeCapability) -> Self {
        Self {
            accelerator: Some(AcceleratorInfo {
                target: DeviceTarget::Cuda,
                name: "fake gpu".to_string(),
                memory_gb,
                capability: Some(capability),
                count: 1,
            }),
            toolchain: Some(ToolchainVersion { major: 12, minor: 4 }),
            ..Self::cpu_only(16)
        }
    }
}

impl ProbeSource for FakeProbe {
    fn cpu_name(&self) -> Result<String, ProbeDegradation> {
        self.cpu_name.clone().ok_or_else(|| unavailable("cpu_name"))
    }

    fn cpu_threads(&self) -> Result<u32, ProbeDegradation> {
        self.threads.ok_or_else(|| unavailable("cpu_threads"))
    }

    fn cpu_cores(&self) -> Result<u32, ProbeDegradation> {
        self.cores.ok_or_else(|| unavailable("cpu_cores"))
    }

    fn system_memory_gb(&self) -> Result<f64, ProbeDegradation> {
        self.memory_gb.ok_or_else(|| unavailable("system_memory_gb"))
    }

    fn accelerator(&self) -> Result<Option<AcceleratorInfo>, ProbeDegradation> {
        if self.accelerator_fails {
            return Err(unavailable("accelerator"));
        }
        Ok(self.accelerator.clone())
    }

    fn graph_toolchain_version(&self) -> Result<Option<ToolchainVersion>, ProbeDegradation> {
        Ok(self.toolchain)
    }

    fn fused_attention_kernel(&self) -> bool {
        self.fused_kernel
    }
}

/// Byte-level codec: ids below 256 are raw bytes, higher ids are the word
/// pieces below. Decoding is lossy UTF-8, like a byte-fallback tokenizer.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScriptCodec;

const PIECES: [&str; 6] = ["Hello", " world", ",", " how", " are", " you"];

impl ScriptCodec {
    pub const HELLO: u32 = 256;
    pub const WORLD: u32 = 257;
    pub const COMMA: u32 = 258;
    pub const HOW: u32 = 259;
    pub const ARE: u32 = 260;
    pub const YOU: u32 = 261;
    /// First and second byte of "é".
    pub const PARTIAL: u32 = 0xC3;
    pub const COMPLETES: u32 = 0xA9;

    /// Encoded length of a single-turn user prompt.
    pub fn prompt_len(&self, user: &str) -> usize {
        render_chat(self.family(), &[Message::user(user)])
            .expect("render prompt")
            .len()
    }
}

impl TextCodec for ScriptCodec {
    fn encode(&self, text: &str) -> Result<Vec<u32>, EngineError> {
        Ok(text.bytes().map(u32::from).collect())
    }

    fn decode(&self, ids: &[u32]) -> Result<String, EngineError> {
        let mut bytes = Vec::new();
        for &id in ids {
            if let Ok(byte) = u8::try_from(id) {
                bytes.push(byte);
                continue;
            }
            let piece = PIECES
                .get((id - 256) as usize)
                .ok_or_else(|| EngineError::Tokenizer(format!("unknown id {id}")))?;
            bytes.extend_from_slice(piece.as_bytes());
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn family(&self) -> PromptFamily {
        PromptFamily::Unknown
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub input_len: usize,
    pub params: SamplingParams,
    pub seed: Option<u64>,
}

/// Observes a [`ScriptedEngine`] after it has been moved into a model.
#[derive(Debug, Clone, Default)]
pub struct EngineLog(Arc<Mutex<Vec<RecordedCall>>>);

impl EngineLog {
    pub fn calls(&self) -> usize {
        self.0.lock().expect("engine log").len()
    }

    pub fn last_call(&self) -> Option<RecordedCall> {
        self.0.lock().expect("engine log").last().cloned()
    }

    pub fn seeds(&self) -> Vec<Option<u64>> {
        self.0
            .lock()
            .expect("engine log")
            .iter()
            .map(|call| call.seed)
            .collect()
    }
}

/// Emits a fixed token script. A seed rotates the script so seeded runs are
/// reproducible and distinct seeds differ.
#[derive(Debug)]
pub struct ScriptedEngine {
    script: Vec<u32>,
    delay: Duration,
    fail_after: Option<usize>,
    static_cache: bool,
    pending_seed: Option<u64>,
    log: EngineLog,
}

impl ScriptedEngine {
    pub fn new(script: Vec<u32>) -> Self {
        Self {
            script,
            delay: Duration::ZERO,
            fail_after: None,
            static_cache: false,
            pending_seed: None,
            log: EngineLog::default(),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing_after(mut self, tokens: usize) -> Self {
        self.fail_after = Some(tokens);
        self
    }

    pub fn with_static_cache(mut self) -> Self {
        self.static_cache = true;
        self
    }

    pub fn log(&self) -> EngineLog {
        self.log.clone()
    }
}

impl ModelEngine for ScriptedEngine {
    fn reseed(&mut self, seed: u64) {
        self.pending_seed = Some(seed);
    }

    fn generate(
        &mut self,
        input_ids: &[u32],
        params: &SamplingParams,
        on_token: &mut dyn FnMut(u32),
    ) -> Result<Vec<u32>, EngineError> {
        let seed = self.pending_seed.take();
        self.log.0.lock().expect("engine log").push(RecordedCall {
            input_len: input_ids.len(),
            params: *params,
            seed,
        });

        let mut script = self.script.clone();
        if let Some(seed) = seed {
            if !script.is_empty() {
                let len = script.len();
                script.rotate_left((seed % len as u64) as usize);
            }
        }

        let mut tokens = input_ids.to_vec();
        for (index, token) in script.into_iter().take(params.max_new_tokens).enumerate() {
            if self.fail_after == Some(index) {
                return Err(EngineError::Backend(anyhow!("scripted failure")));
            }
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            tokens.push(token);
            on_token(token);
        }
        if self.fail_after == Some(tokens.len() - input_ids.len()) {
            return Err(EngineError::Backend(anyhow!("scripted failure")));
        }
        Ok(tokens)
    }

    fn allocate_static_cache(&mut self, shape: CacheShape) -> Result<CacheHandle, EngineError> {
        if !self.static_cache {
            return Err(EngineError::Unsupported("static kv cache"));
        }
        Ok(CacheHandle {
            shape,
            capture_pending: true,
        })
    }
}

pub fn fake_model(engine: ScriptedEngine) -> ModelHandle {
    ModelHandle::new(LoadedModel {
        engine: Box::new(engine),
        codec: Arc::new(ScriptCodec),
    })
}

/// Hands out one prepared engine, then fails.
#[derive(Debug, Default)]
pub struct FakeLoader {
    engine: Mutex<Option<ScriptedEngine>>,
    pub last_options: Mutex<Option<LoadOptions>>,
}

impl FakeLoader {
    pub fn new(engine: ScriptedEngine) -> Self {
        Self {
            engine: Mutex::new(Some(engine)),
            last_options: Mutex::new(None),
        }
    }
}

impl ModelLoader for FakeLoader {
    fn load(&self, spec: &ModelSpec, options: &LoadOptions) -> Result<LoadedModel, EngineError> {
        *self.last_options.lock().expect("options") = Some(*options);
        let engine = self
            .engine
            .lock()
            .expect("engine slot")
            .take()
            .ok_or_else(|| EngineError::ModelNotFound(spec.path.clone()))?;
        Ok(LoadedModel {
            engine: Box::new(engine),
            codec: Arc::new(ScriptCodec),
        })
    }
}
