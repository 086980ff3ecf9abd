use adaptive_control_models::{AttentionImpl, DeviceTarget, Precision, Quantization};
use anyhow::Error as E;
use candle_core::{DType, Device, Tensor};
use candle_transformers::generation::LogitsProcessor;

use super::tokenizer::CandleTokenizer;
use super::{LoadOptions, LoadedModel, ModelEngine, ModelLoader, ModelSpec, SamplingParams};
use crate::backend::RuntimeModel;
use crate::errors::EngineError;
use crate::prompting::PromptFamily;

/// Loads quantized GGUF weights through candle.
#[derive(Debug, Default, Clone, Copy)]
pub struct CandleLoader;

impl ModelLoader for CandleLoader {
    fn load(&self, spec: &ModelSpec, options: &LoadOptions) -> Result<LoadedModel, EngineError> {
        if !spec.path.exists() {
            return Err(EngineError::ModelNotFound(spec.path.clone()));
        }

        let family = spec.family.unwrap_or_else(|| {
            let name = spec
                .path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            PromptFamily::infer_from_filename(&name)
        });

        apply_worker_threads(options.workers);
        let device = select_device(options.device)?;
        log_load_hints(options);

        tracing::info!(path = %spec.path.display(), %family, device = %options.device, "loading model weights");
        let model = RuntimeModel::load_from_gguf(&spec.path, family, &device)?;
        tracing::info!(architecture = model.architecture(), "weights loaded; loading tokenizer");

        let tokenizer = CandleTokenizer::load(&spec.path, spec.tokenizer.as_deref(), family)?;
        let (eos_token_id, eot_token_id) = tokenizer.stop_ids();

        Ok(LoadedModel {
            engine: Box::new(CandleEngine {
                model,
                device,
                eos_token_id,
                eot_token_id,
                pending_seed: None,
            }),
            codec: std::sync::Arc::new(tokenizer),
        })
    }
}

/// Caps the host thread pool at the planned worker count unless the
/// operator already chose one.
fn apply_worker_threads(workers: usize) {
    if std::env::var_os("RAYON_NUM_THREADS").is_none() {
        std::env::set_var("RAYON_NUM_THREADS", workers.max(1).to_string());
    }
}

fn select_device(target: DeviceTarget) -> Result<Device, EngineError> {
    let device = match target {
        DeviceTarget::Cpu => Device::Cpu,
        DeviceTarget::Cuda => Device::new_cuda(0)?,
        DeviceTarget::Metal => Device::new_metal(0)?,
    };
    Ok(device)
}

/// GGUF files carry their own quantization and compute dtype; the planned
/// values are recorded so a mismatch is visible in the log.
fn log_load_hints(options: &LoadOptions) {
    if options.quantization == Quantization::None {
        tracing::info!("unquantized weights requested; gguf tensors keep their stored quantization");
    }
    if options.precision != Precision::F32 && options.device == DeviceTarget::Cpu {
        tracing::warn!(precision = %options.precision, "reduced precision on cpu; dequantized math runs in f32");
    }
    if options.attention == AttentionImpl::Fused && !cfg!(feature = "flash-attn") {
        tracing::warn!("fused attention planned but this build has no flash-attn kernel");
    }
}

pub struct CandleEngine {
    model: RuntimeModel,
    device: Device,
    eos_token_id: u32,
    eot_token_id: u32,
    pending_seed: Option<u64>,
}

impl CandleEngine {
    fn is_stop(&self, token: u32) -> bool {
        token == self.eos_token_id || token == self.eot_token_id
    }

    fn step(&mut self, tokens: &[u32], position: usize) -> Result<Tensor, EngineError> {
        let input_tensor = Tensor::new(tokens, &self.device)?.unsqueeze(0)?;
        let logits = self.model.forward(&input_tensor, position)?;
        Ok(logits.squeeze(0)?.to_dtype(DType::F32)?)
    }
}

impl ModelEngine for CandleEngine {
    fn reseed(&mut self, seed: u64) {
        self.pending_seed = Some(seed);
    }

    fn generate(
        &mut self,
        input_ids: &[u32],
        params: &SamplingParams,
        on_token: &mut dyn FnMut(u32),
    ) -> Result<Vec<u32>, EngineError> {
        let seed = call_seed(&mut self.pending_seed, input_ids)?;
        let mut logits_processor = LogitsProcessor::new(seed, params.temperature, params.top_p);
        let mut tokens = input_ids.to_vec();

        // Prefill from position 0 resets the kv cache of the previous call.
        let mut logits = self.step(input_ids, 0)?;

        for generated in 1..=params.max_new_tokens {
            let next_token = logits_processor.sample(&logits)?;
            if self.is_stop(next_token) {
                break;
            }

            tokens.push(next_token);
            on_token(next_token);

            if generated == params.max_new_tokens {
                break;
            }
            logits = self.step(&[next_token], tokens.len() - 1)?;
        }

        Ok(tokens)
    }
}

/// Consumes the pending seed before anything can fail, so a rejected call
/// never leaves it behind for the next one.
fn call_seed(pending_seed: &mut Option<u64>, input_ids: &[u32]) -> Result<u64, EngineError> {
    let seed = pending_seed.take();
    if input_ids.is_empty() {
        return Err(EngineError::Backend(E::msg("empty input sequence")));
    }
    Ok(seed.unwrap_or_else(random_seed))
}

fn random_seed() -> u64 {
    let mut buf = [0u8; 8];
    match getrandom::getrandom(&mut buf) {
        Ok(()) => u64::from_le_bytes(buf),
        Err(e) => {
            tracing::warn!(error = %e, "os entropy unavailable; seeding from the clock");
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn missing_model_file_is_reported() {
        let spec = ModelSpec {
            path: Path::new("/nonexistent/adaptive/model.gguf").to_path_buf(),
            tokenizer: None,
            family: Some(PromptFamily::Qwen),
        };
        let options = LoadOptions {
            device: DeviceTarget::Cpu,
            precision: Precision::F32,
            quantization: Quantization::Int4,
            attention: AttentionImpl::Standard,
            workers: 1,
        };
        match CandleLoader.load(&spec, &options) {
            Err(EngineError::ModelNotFound(path)) => assert_eq!(path, spec.path),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("load of a missing file succeeded"),
        }
    }

    #[test]
    fn rejected_call_still_consumes_the_seed() {
        let mut pending = Some(7);
        assert!(call_seed(&mut pending, &[]).is_err());
        assert!(pending.is_none());

        let mut pending = Some(7);
        assert_eq!(call_seed(&mut pending, &[1, 2]).expect("seed"), 7);
        assert!(pending.is_none());
    }

    #[test]
    fn cpu_device_is_always_selectable() {
        assert!(matches!(select_device(DeviceTarget::Cpu), Ok(Device::Cpu)));
    }
}
