//! Short throwaway generation that absorbs first-call initialization cost
//! (kernel selection, allocator growth, graph capture) before real traffic.

use std::time::{Duration, Instant};

use adaptive_control_models::{DeviceTarget, ExecutionConfig};
use serde::Serialize;

use crate::engine::{ModelEngine, SamplingParams};

pub const WARMUP_INPUT_LEN: usize = 16;
pub const WARMUP_NEW_TOKENS: usize = 4;
const WARMUP_TOKEN_ID: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WarmupOutcome {
    Skipped,
    Completed { elapsed: Duration },
    Failed { reason: String },
}

/// Never fails: any engine error is logged and reported as
/// [`WarmupOutcome::Failed`], leaving the model usable.
pub fn warmup(engine: &mut dyn ModelEngine, config: &ExecutionConfig) -> WarmupOutcome {
    if config.device == DeviceTarget::Cpu {
        tracing::debug!("warmup skipped on cpu");
        return WarmupOutcome::Skipped;
    }

    let input = [WARMUP_TOKEN_ID; WARMUP_INPUT_LEN];
    let params = SamplingParams::greedy(WARMUP_NEW_TOKENS);
    let started = Instant::now();

    match engine.generate(&input, &params, &mut |_| {}) {
        Ok(_) => {
            let elapsed = started.elapsed();
            tracing::info!(elapsed_ms = elapsed.as_millis() as u64, "warmup completed");
            WarmupOutcome::Completed { elapsed }
        }
        Err(err) => {
            tracing::warn!(error = %err, "warmup failed; continuing without it");
            WarmupOutcome::Failed {
                reason: err.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{execution_config, ScriptedEngine};

    #[test]
    fn cpu_is_skipped_without_touching_the_engine() {
        let mut engine = ScriptedEngine::new(vec![5, 6, 7]);
        let log = engine.log();
        let outcome = warmup(&mut engine, &execution_config(DeviceTarget::Cpu));
        assert_eq!(outcome, WarmupOutcome::Skipped);
        assert_eq!(log.calls(), 0);
    }

    #[test]
    fn accelerator_runs_short_greedy_pass() {
        let mut engine = ScriptedEngine::new(vec![5, 6, 7, 8, 9, 10]);
        let log = engine.log();
        let outcome = warmup(&mut engine, &execution_config(DeviceTarget::Cuda));

        assert!(matches!(outcome, WarmupOutcome::Completed { .. }));
        assert_eq!(log.calls(), 1);
        let call = log.last_call().expect("recorded call");
        assert_eq!(call.input_len, WARMUP_INPUT_LEN);
        assert_eq!(call.params, SamplingParams::greedy(WARMUP_NEW_TOKENS));
    }

    #[test]
    fn engine_failure_is_absorbed() {
        let mut engine = ScriptedEngine::new(vec![5, 6]).failing_after(0);
        let outcome = warmup(&mut engine, &execution_config(DeviceTarget::Metal));
        match outcome {
            WarmupOutcome::Failed { reason } => assert!(reason.contains("scripted failure")),
            other => panic!("expected failure, got {other:?}"),
        }
    }
}
