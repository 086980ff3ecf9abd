//! Seam between the control plane and the model execution engine.
//!
//! The coordinator and cache preparer only see [`ModelEngine`] and
//! [`TextCodec`]; [`lifecycle::CandleLoader`] is the production
//! implementation.

mod lifecycle;
mod tokenizer;

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use adaptive_control_models::{AttentionImpl, DeviceTarget, ExecutionConfig, Precision, Quantization};

use crate::cache::{CacheHandle, CacheShape};
use crate::errors::EngineError;
use crate::prompting::PromptFamily;

pub use lifecycle::{CandleEngine, CandleLoader};
pub use tokenizer::CandleTokenizer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Modality {
    Text,
    Multimodal,
}

/// Sampling settings for one engine call. `None` temperature means greedy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    pub max_new_tokens: usize,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
}

impl SamplingParams {
    pub fn greedy(max_new_tokens: usize) -> Self {
        Self {
            max_new_tokens,
            temperature: None,
            top_p: None,
        }
    }
}

pub trait ModelEngine: Send {
    fn modality(&self) -> Modality {
        Modality::Text
    }

    /// Fixes the random state of the next [`generate`](Self::generate) call
    /// only. Later calls draw a fresh seed unless reseeded again.
    fn reseed(&mut self, seed: u64);

    /// Generates up to `params.max_new_tokens` tokens after `input_ids`,
    /// calling `on_token` for each one as it is produced. Returns the input
    /// followed by the generated ids.
    fn generate(
        &mut self,
        input_ids: &[u32],
        params: &SamplingParams,
        on_token: &mut dyn FnMut(u32),
    ) -> Result<Vec<u32>, EngineError>;

    fn allocate_static_cache(&mut self, _shape: CacheShape) -> Result<CacheHandle, EngineError> {
        Err(EngineError::Unsupported("static kv cache"))
    }
}

pub trait TextCodec: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<u32>, EngineError>;
    fn decode(&self, ids: &[u32]) -> Result<String, EngineError>;
    fn family(&self) -> PromptFamily;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub path: PathBuf,
    pub tokenizer: Option<PathBuf>,
    pub family: Option<PromptFamily>,
}

/// The subset of the execution config that affects how weights are loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOptions {
    pub device: DeviceTarget,
    pub precision: Precision,
    pub quantization: Quantization,
    pub attention: AttentionImpl,
    pub workers: usize,
}

impl From<&ExecutionConfig> for LoadOptions {
    fn from(config: &ExecutionConfig) -> Self {
        Self {
            device: config.device,
            precision: config.precision,
            quantization: config.quantization,
            attention: config.attention,
            workers: config.workers,
        }
    }
}

pub struct LoadedModel {
    pub engine: Box<dyn ModelEngine>,
    pub codec: Arc<dyn TextCodec>,
}

pub trait ModelLoader {
    fn load(&self, spec: &ModelSpec, options: &LoadOptions) -> Result<LoadedModel, EngineError>;
}

/// Shared handle to a loaded model. Clones share the same engine; calls into
/// it are serialized through the mutex.
#[derive(Clone)]
pub struct ModelHandle {
    engine: Arc<Mutex<Box<dyn ModelEngine>>>,
    codec: Arc<dyn TextCodec>,
    modality: Modality,
    cache: Option<CacheHandle>,
}

impl ModelHandle {
    pub fn new(loaded: LoadedModel) -> Self {
        let modality = loaded.engine.modality();
        Self {
            engine: Arc::new(Mutex::new(loaded.engine)),
            codec: loaded.codec,
            modality,
            cache: None,
        }
    }

    /// A panic inside a previous call leaves no state worth protecting: every
    /// generation starts a fresh sequence.
    pub fn lock_engine(&self) -> MutexGuard<'_, Box<dyn ModelEngine>> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn codec(&self) -> &Arc<dyn TextCodec> {
        &self.codec
    }

    pub fn modality(&self) -> Modality {
        self.modality
    }

    pub fn static_cache(&self) -> Option<&CacheHandle> {
        self.cache.as_ref()
    }

    pub(crate) fn attach_static_cache(&mut self, handle: CacheHandle) {
        self.cache = Some(handle);
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("family", &self.codec.family())
            .field("modality", &self.modality)
            .field("cache", &self.cache)
            .finish()
    }
}
