//! Request handling against a loaded model, blocking or streamed.
//!
//! A streamed request runs the engine on a dedicated worker thread that
//! pushes decoded text into a bounded channel; the caller drains it through
//! [`GenerationStream`]. Both paths share the same preparation and engine
//! dispatch, so for a fixed seed they produce identical text.

mod cancel;
mod stream;

use std::collections::BTreeMap;
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use adaptive_control_models::{ExecutionConfig, Message, StreamMode, StreamStatus};
use serde::Deserialize;

use crate::engine::{ModelEngine, ModelHandle};
use crate::errors::GenerationError;
use crate::prompting::{apply_generation_overrides, parse_override_payload, render_chat, GenerationParams};

pub use cancel::{CancellationRegistry, CancellationToken, Registration, RequestId};
pub use stream::{GenerationStats, GenerationStream, StreamState, TokenEvent, Transcript};

use stream::{IncrementalDecoder, WorkerMessage};

pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// How long a worker waits before retrying a send into a full channel.
const SEND_RETRY_INTERVAL: Duration = Duration::from_millis(2);

/// Process-wide generation defaults, the `[generation]` settings table.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GenerationDefaults {
    pub temperature: f64,
    pub top_p: f64,
    pub stream_timeout_secs: u64,
    pub channel_capacity: usize,
    pub stream_mode: StreamMode,
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            stream_timeout_secs: DEFAULT_STREAM_TIMEOUT.as_secs(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            stream_mode: StreamMode::Delta,
        }
    }
}

impl GenerationDefaults {
    pub fn stream_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_timeout_secs)
    }
}

#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub messages: Vec<Message>,
    /// Per-call parameter overrides (`temperature`, `top_p`, `seed`,
    /// `max_new_tokens`), validated at dispatch.
    pub overrides: BTreeMap<String, String>,
    pub stream_mode: Option<StreamMode>,
    pub cancel: Option<CancellationToken>,
}

impl GenerationRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    pub fn user(prompt: impl Into<String>) -> Self {
        Self::new(vec![Message::user(prompt)])
    }

    pub fn with_override(mut self, key: &str, value: impl ToString) -> Self {
        self.overrides.insert(key.to_lowercase(), value.to_string());
        self
    }

    /// Adds overrides from a `key=value` list separated by `,` or `;`.
    pub fn with_override_payload(mut self, payload: &str) -> Result<Self, GenerationError> {
        let parsed = parse_override_payload(payload).map_err(GenerationError::InvalidParameter)?;
        self.overrides.extend(parsed);
        Ok(self)
    }

    pub fn with_stream_mode(mut self, mode: StreamMode) -> Self {
        self.stream_mode = Some(mode);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// One request's view of the model: consumed by [`run`](Self::run) or
/// [`stream`](Self::stream).
#[derive(Debug)]
pub struct GenerationCoordinator {
    config: Arc<ExecutionConfig>,
    model: ModelHandle,
    defaults: GenerationDefaults,
}

struct Prepared {
    input_ids: Vec<u32>,
    params: GenerationParams,
}

impl GenerationCoordinator {
    pub fn new(config: Arc<ExecutionConfig>, model: ModelHandle, defaults: GenerationDefaults) -> Self {
        Self {
            config,
            model,
            defaults,
        }
    }

    pub fn run(self, request: GenerationRequest) -> Result<Transcript, GenerationError> {
        let started = Instant::now();
        let cancel = request.cancel.clone().unwrap_or_default();
        let prepared = self.prepare(&request)?;

        if cancel.is_cancelled() {
            return Ok(Transcript {
                text: String::new(),
                status: StreamStatus::Cancelled,
                error: None,
                stats: GenerationStats {
                    generated_tokens: None,
                    elapsed: started.elapsed(),
                },
            });
        }

        let generated = {
            let mut engine = self.model.lock_engine();
            dispatch(&mut **engine, &prepared.input_ids, prepared.params, &mut |_| {})?
        };
        let text = self.model.codec().decode(&generated)?;

        tracing::debug!(
            input_tokens = prepared.input_ids.len(),
            generated_tokens = generated.len(),
            "generation completed"
        );

        Ok(Transcript {
            text,
            status: StreamStatus::Completed,
            error: None,
            stats: GenerationStats {
                generated_tokens: Some(generated.len()),
                elapsed: started.elapsed(),
            },
        })
    }

    /// Validates the request, then starts the worker. Validation errors are
    /// returned here; everything after dispatch arrives as stream events.
    pub fn stream(self, request: GenerationRequest) -> Result<GenerationStream, GenerationError> {
        let started = Instant::now();
        let prepared = self.prepare(&request)?;
        let mode = request.stream_mode.unwrap_or(self.defaults.stream_mode);
        let cancel = request.cancel.unwrap_or_default();

        let (tx, rx) = mpsc::sync_channel(self.defaults.channel_capacity.max(1));
        let model = self.model;
        let worker_cancel = cancel.clone();
        std::thread::Builder::new()
            .name("generation-worker".to_string())
            .spawn(move || run_worker(model, prepared, tx, worker_cancel))
            .map_err(GenerationError::Spawn)?;

        Ok(GenerationStream::new(
            rx,
            cancel,
            mode,
            self.defaults.stream_timeout(),
            started,
        ))
    }

    fn prepare(&self, request: &GenerationRequest) -> Result<Prepared, GenerationError> {
        let base = GenerationParams {
            temperature: self.defaults.temperature,
            top_p: self.defaults.top_p,
            seed: None,
            max_new_tokens: self.config.max_new_tokens,
        };
        let mut params = apply_generation_overrides(&request.overrides, base)
            .map_err(GenerationError::InvalidParameter)?;

        let codec = self.model.codec();
        let prompt = render_chat(codec.family(), &request.messages)?;
        let input_ids = codec.encode(&prompt)?;

        if input_ids.len() > self.config.max_input_tokens {
            return Err(GenerationError::InputTooLong {
                tokens: input_ids.len(),
                limit: self.config.max_input_tokens,
            });
        }

        if let Some(cache) = self.model.static_cache() {
            if !cache.admits(input_ids.len() + 1) {
                return Err(GenerationError::InputTooLong {
                    tokens: input_ids.len(),
                    limit: cache.shape.max_seq_len.saturating_sub(1),
                });
            }
            let room = cache.shape.max_seq_len - input_ids.len();
            if params.max_new_tokens > room {
                tracing::debug!(requested = params.max_new_tokens, room, "generation budget clamped to static cache");
                params.max_new_tokens = room;
            }
        }

        Ok(Prepared { input_ids, params })
    }
}

/// Applies and consumes the seed, runs the engine, and returns only the
/// newly generated ids.
fn dispatch(
    engine: &mut dyn ModelEngine,
    input_ids: &[u32],
    mut params: GenerationParams,
    on_token: &mut dyn FnMut(u32),
) -> Result<Vec<u32>, GenerationError> {
    if let Some(seed) = params.seed.take() {
        engine.reseed(seed);
    }
    let output = engine.generate(input_ids, &params.sampling(), on_token)?;
    Ok(output.get(input_ids.len()..).map(<[u32]>::to_vec).unwrap_or_default())
}

fn run_worker(model: ModelHandle, prepared: Prepared, tx: SyncSender<WorkerMessage>, cancel: CancellationToken) {
    let codec = model.codec().clone();
    let mut decoder = IncrementalDecoder::new(codec.as_ref());
    let mut decode_error = None;

    // After cancellation the engine call still runs to the end, but nothing
    // is decoded or forwarded, so the worker never waits on the consumer.
    let mut on_token = |token: u32| {
        if decode_error.is_some() || cancel.is_cancelled() {
            return;
        }
        match decoder.push(token) {
            Ok(Some(delta)) => forward(&tx, &cancel, WorkerMessage::Text(delta)),
            Ok(None) => {}
            Err(err) => decode_error = Some(err),
        }
    };

    let mut engine = model.lock_engine();
    let result = dispatch(&mut **engine, &prepared.input_ids, prepared.params, &mut on_token);
    drop(engine);

    if cancel.is_cancelled() {
        tracing::debug!("generation worker finished after cancellation");
        return;
    }

    let terminal = match (result, decode_error) {
        (Err(err), _) => WorkerMessage::Failed(err),
        (Ok(_), Some(err)) => WorkerMessage::Failed(err.into()),
        (Ok(_), None) => match decoder.finish() {
            Ok(tail) => {
                if let Some(tail) = tail {
                    forward(&tx, &cancel, WorkerMessage::Text(tail));
                }
                WorkerMessage::Finished {
                    generated_tokens: decoder.token_count(),
                }
            }
            Err(err) => WorkerMessage::Failed(err.into()),
        },
    };
    if let WorkerMessage::Failed(err) = &terminal {
        tracing::warn!(error = %err, "generation worker failed");
    }
    forward(&tx, &cancel, terminal);
}

/// Sends with backpressure while the request is live. Gives up once the
/// request is cancelled or the consumer has gone away.
fn forward(tx: &SyncSender<WorkerMessage>, cancel: &CancellationToken, mut message: WorkerMessage) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        match tx.try_send(message) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => return,
            Err(TrySendError::Full(returned)) => {
                message = returned;
                std::thread::sleep(SEND_RETRY_INTERVAL);
            }
        }
    }
}
