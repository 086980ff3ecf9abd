use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use adaptive_control_models::{StreamMode, StreamStatus};

use super::cancel::{CancellationToken, Registration};
use crate::engine::TextCodec;
use crate::errors::{EngineError, GenerationError};

/// Worker to consumer protocol. Exactly one terminal message ends a run.
#[derive(Debug)]
pub(crate) enum WorkerMessage {
    Text(String),
    Finished { generated_tokens: usize },
    Failed(GenerationError),
}

#[derive(Debug, Clone)]
pub enum TokenEvent {
    /// The new text in delta mode, or the whole text so far in cumulative
    /// mode.
    Text(String),
    Error(Arc<GenerationError>),
    Finished(StreamStatus),
}

/// Lifecycle of a dispatched request. The terminal states are observable
/// right after the `Finished` event; the following `next()` moves to `Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Dispatched,
    Streaming,
    Completed,
    Cancelled,
    Failed,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GenerationStats {
    /// Known only when the worker finished normally.
    pub generated_tokens: Option<usize>,
    pub elapsed: Duration,
}

impl GenerationStats {
    pub fn tokens_per_second(&self) -> Option<f64> {
        let secs = self.elapsed.as_secs_f64();
        match self.generated_tokens {
            Some(tokens) if secs > 0.0 => Some(tokens as f64 / secs),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Transcript {
    pub text: String,
    pub status: StreamStatus,
    pub error: Option<Arc<GenerationError>>,
    pub stats: GenerationStats,
}

/// Consumer side of one streamed generation.
///
/// Yields text events followed by exactly one
/// [`TokenEvent::Finished`]; a failure adds one [`TokenEvent::Error`]
/// right before it. Dropping the stream detaches the worker, which then
/// finishes its engine call and discards the rest of its output.
#[derive(Debug)]
pub struct GenerationStream {
    rx: Option<Receiver<WorkerMessage>>,
    cancel: CancellationToken,
    mode: StreamMode,
    timeout: Duration,
    state: StreamState,
    status: Option<StreamStatus>,
    text: String,
    error: Option<Arc<GenerationError>>,
    generated_tokens: Option<usize>,
    started: Instant,
    registration: Option<Registration>,
}

impl GenerationStream {
    pub(crate) fn new(
        rx: Receiver<WorkerMessage>,
        cancel: CancellationToken,
        mode: StreamMode,
        timeout: Duration,
        started: Instant,
    ) -> Self {
        Self {
            rx: Some(rx),
            cancel,
            mode,
            timeout,
            state: StreamState::Dispatched,
            status: None,
            text: String::new(),
            error: None,
            generated_tokens: None,
            started,
            registration: None,
        }
    }

    pub(crate) fn attach_registration(&mut self, registration: Registration) {
        self.registration = Some(registration);
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Consumes the remaining events and returns the accumulated result.
    pub fn into_transcript(mut self) -> Transcript {
        self.by_ref().for_each(drop);
        Transcript {
            text: std::mem::take(&mut self.text),
            status: self.status.unwrap_or(StreamStatus::Failed),
            error: self.error.take(),
            stats: GenerationStats {
                generated_tokens: self.generated_tokens,
                elapsed: self.started.elapsed(),
            },
        }
    }

    fn pull(&mut self) -> TokenEvent {
        if self.cancel.is_cancelled() {
            return self.finish(StreamStatus::Cancelled);
        }
        let Some(rx) = &self.rx else {
            return self.fail(GenerationError::WorkerLost);
        };

        match rx.recv_timeout(self.timeout) {
            // Anything that arrives after cancellation is discarded.
            Ok(_) if self.cancel.is_cancelled() => self.finish(StreamStatus::Cancelled),
            Ok(WorkerMessage::Text(delta)) => {
                self.state = StreamState::Streaming;
                self.text.push_str(&delta);
                match self.mode {
                    StreamMode::Delta => TokenEvent::Text(delta),
                    StreamMode::Cumulative => TokenEvent::Text(self.text.clone()),
                }
            }
            Ok(WorkerMessage::Finished { generated_tokens }) => {
                self.generated_tokens = Some(generated_tokens);
                self.finish(StreamStatus::Completed)
            }
            Ok(WorkerMessage::Failed(err)) => self.fail(err),
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(timeout_ms = self.timeout.as_millis() as u64, "generation stream timed out");
                self.fail(GenerationError::StreamTimeout(self.timeout))
            }
            Err(RecvTimeoutError::Disconnected) => self.fail(GenerationError::WorkerLost),
        }
    }

    fn finish(&mut self, status: StreamStatus) -> TokenEvent {
        // Dropping the receiver makes further worker sends fail silently.
        self.rx = None;
        self.registration = None;
        self.state = match status {
            StreamStatus::Completed => StreamState::Completed,
            StreamStatus::Cancelled => StreamState::Cancelled,
            StreamStatus::Failed => StreamState::Failed,
        };
        self.status = Some(status);
        TokenEvent::Finished(status)
    }

    fn fail(&mut self, err: GenerationError) -> TokenEvent {
        self.rx = None;
        self.state = StreamState::Failed;
        let err = Arc::new(err);
        self.error = Some(err.clone());
        TokenEvent::Error(err)
    }
}

impl Iterator for GenerationStream {
    type Item = TokenEvent;

    fn next(&mut self) -> Option<TokenEvent> {
        match self.state {
            StreamState::Done => None,
            // An error event is always followed by the terminal event.
            StreamState::Failed if self.status.is_none() => Some(self.finish(StreamStatus::Failed)),
            StreamState::Completed | StreamState::Cancelled | StreamState::Failed => {
                self.state = StreamState::Done;
                None
            }
            StreamState::Dispatched | StreamState::Streaming => Some(self.pull()),
        }
    }
}

/// Turns a token sequence into text pieces whose concatenation equals the
/// decode of the whole sequence.
///
/// Only a trailing window is decoded per token: the tokens since the last
/// emitted piece plus the one before it as context, so leading-space and
/// byte-fallback pieces decode the same as inside the full sequence. Text is
/// held back while the window ends in an incomplete character.
pub(crate) struct IncrementalDecoder<'a> {
    codec: &'a dyn TextCodec,
    window: Vec<u32>,
    /// Start of the not yet emitted tokens inside `window`.
    read_offset: usize,
    token_count: usize,
}

impl<'a> IncrementalDecoder<'a> {
    pub(crate) fn new(codec: &'a dyn TextCodec) -> Self {
        Self {
            codec,
            window: Vec::new(),
            read_offset: 0,
            token_count: 0,
        }
    }

    pub(crate) fn push(&mut self, token: u32) -> Result<Option<String>, EngineError> {
        self.window.push(token);
        self.token_count += 1;

        let text = self.codec.decode(&self.window)?;
        if text.ends_with('\u{FFFD}') {
            return Ok(None);
        }
        let delta = self.take_new(&text)?;
        if delta.is_some() {
            // Keep the last emitted token as context for the next piece.
            let keep_from = self.window.len() - 1;
            self.window.drain(..keep_from);
            self.read_offset = self.window.len();
        }
        Ok(delta)
    }

    pub(crate) fn finish(&mut self) -> Result<Option<String>, EngineError> {
        if self.read_offset >= self.window.len() {
            return Ok(None);
        }
        let text = self.codec.decode(&self.window)?;
        let delta = self.take_new(&text)?;
        self.read_offset = self.window.len();
        Ok(delta)
    }

    pub(crate) fn token_count(&self) -> usize {
        self.token_count
    }

    /// Text of `window` past the already emitted context tokens.
    fn take_new(&self, text: &str) -> Result<Option<String>, EngineError> {
        let context = self.codec.decode(&self.window[..self.read_offset])?;
        if text.len() <= context.len() || !text.is_char_boundary(context.len()) {
            return Ok(None);
        }
        Ok(Some(text[context.len()..].to_string()))
    }
}
