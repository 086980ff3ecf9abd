//! Compile-time capability checks.
//!
//! These answer "could this binary use the feature at all", independent of
//! whether the planner decides to use it.

pub fn cuda_runtime_compiled() -> bool {
    candle_core::utils::cuda_is_available()
}

pub fn metal_runtime_compiled() -> bool {
    candle_core::utils::metal_is_available()
}

pub fn fused_attention_compiled() -> bool {
    cfg!(feature = "flash-attn")
}
