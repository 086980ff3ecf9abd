//! One-shot hardware capability probe.
//!
//! Every probe step is independent and best-effort: a failed step is logged
//! and replaced by a conservative default, so [`ResourceProfiler::profile`]
//! always yields a usable [`HardwareProfile`].

mod features;
mod system;

use std::fmt::Debug;
use std::sync::{Arc, OnceLock};

use adaptive_control_models::{AcceleratorInfo, Capabilities, HardwareProfile, ToolchainVersion};

use crate::errors::ProbeDegradation;
use crate::planner;

pub use features::{cuda_runtime_compiled, fused_attention_compiled, metal_runtime_compiled};
pub use system::SystemProbe;

/// Source of raw machine facts. [`SystemProbe`] reads the live machine;
/// tests supply canned values.
pub trait ProbeSource {
    fn cpu_name(&self) -> Result<String, ProbeDegradation>;
    fn cpu_threads(&self) -> Result<u32, ProbeDegradation>;
    fn cpu_cores(&self) -> Result<u32, ProbeDegradation>;
    fn system_memory_gb(&self) -> Result<f64, ProbeDegradation>;
    /// `Ok(None)` means no accelerator, which is not a degradation.
    fn accelerator(&self) -> Result<Option<AcceleratorInfo>, ProbeDegradation>;
    fn graph_toolchain_version(&self) -> Result<Option<ToolchainVersion>, ProbeDegradation>;
    fn fused_attention_kernel(&self) -> bool;
}

pub struct ResourceProfiler<S = SystemProbe> {
    source: S,
    cached: OnceLock<Arc<HardwareProfile>>,
}

impl ResourceProfiler<SystemProbe> {
    pub fn system() -> Self {
        Self::new(SystemProbe)
    }
}

impl<S: ProbeSource> ResourceProfiler<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            cached: OnceLock::new(),
        }
    }

    /// Probes on first call; later calls return the same snapshot.
    pub fn profile(&self) -> Arc<HardwareProfile> {
        self.cached
            .get_or_init(|| Arc::new(self.probe()))
            .clone()
    }

    /// Forgets the memoized profile so the next [`profile`](Self::profile)
    /// call probes again. Snapshots already handed out are unaffected.
    pub fn invalidate(&mut self) {
        self.cached = OnceLock::new();
    }

    fn probe(&self) -> HardwareProfile {
        let capabilities = collect_capabilities(&self.source);
        let recommendation = planner::recommend(&capabilities);
        let profile = HardwareProfile {
            capabilities,
            recommendation,
        };
        tracing::info!(summary = %profile.summary(), "hardware profile ready");
        profile
    }
}

fn collect_capabilities<S: ProbeSource>(source: &S) -> Capabilities {
    let cpu_threads = or_default("cpu_threads", source.cpu_threads(), 1).max(1);
    let cpu_cores = or_default("cpu_cores", source.cpu_cores(), (cpu_threads / 2).max(1));
    let cpu_name = or_default("cpu_name", source.cpu_name(), String::new());
    let system_memory_gb = or_default("system_memory_gb", source.system_memory_gb(), 0.0);
    let accelerator = or_default("accelerator", source.accelerator(), None);

    // The toolchain only matters when there is a device to capture graphs on.
    let graph_toolchain = match accelerator {
        Some(_) => or_default("graph_toolchain", source.graph_toolchain_version(), None),
        None => None,
    };
    let fused_attention_kernel = accelerator.is_some() && source.fused_attention_kernel();

    Capabilities {
        cpu_name,
        cpu_cores,
        cpu_threads,
        system_memory_gb,
        accelerator,
        fused_attention_kernel,
        graph_toolchain,
    }
}

fn or_default<T: Debug>(field: &'static str, probed: Result<T, ProbeDegradation>, fallback: T) -> T {
    match probed {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(field, error = %err, fallback = ?fallback, "hardware probe degraded");
            fallback
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeProbe;
    use adaptive_control_models::{ComputeCapability, DeviceTarget, Quantization};
    use std::cell::Cell;

    #[test]
    fn every_failing_probe_falls_back_to_cpu_defaults() {
        let profile = ResourceProfiler::new(FakeProbe::broken()).profile();

        let caps = &profile.capabilities;
        assert_eq!(caps.cpu_threads, 1);
        assert_eq!(caps.cpu_cores, 1);
        assert_eq!(caps.system_memory_gb, 0.0);
        assert!(caps.accelerator.is_none());
        assert!(caps.graph_toolchain.is_none());

        let rec = &profile.recommendation;
        assert_eq!(rec.device, DeviceTarget::Cpu);
        assert_eq!(rec.quantization, Quantization::Int4);
        assert_eq!(rec.max_new_tokens, 512);
        assert_eq!(rec.max_input_tokens, 8192);
        assert_eq!(rec.workers, 1);
    }

    #[test]
    fn broken_accelerator_probe_keeps_cpu_facts() {
        let mut probe = FakeProbe::cpu_only(16);
        probe.accelerator_fails = true;
        let profile = ResourceProfiler::new(probe).profile();

        assert_eq!(profile.capabilities.cpu_threads, 16);
        assert!(!profile.has_accelerator());
        assert_eq!(profile.recommendation.workers, 4);
    }

    #[test]
    fn toolchain_is_ignored_without_accelerator() {
        let mut probe = FakeProbe::cpu_only(8);
        probe.toolchain = Some(ToolchainVersion { major: 12, minor: 4 });
        probe.fused_kernel = true;
        let profile = ResourceProfiler::new(probe).profile();

        assert!(profile.capabilities.graph_toolchain.is_none());
        assert!(!profile.capabilities.fused_attention_kernel);
        assert!(!profile.recommendation.graph_compile_available);
    }

    struct CountingProbe {
        inner: FakeProbe,
        calls: Cell<u32>,
    }

    impl ProbeSource for CountingProbe {
        fn cpu_name(&self) -> Result<String, ProbeDegradation> {
            self.inner.cpu_name()
        }
        fn cpu_threads(&self) -> Result<u32, ProbeDegradation> {
            self.calls.set(self.calls.get() + 1);
            self.inner.cpu_threads()
        }
        fn cpu_cores(&self) -> Result<u32, ProbeDegradation> {
            self.inner.cpu_cores()
        }
        fn system_memory_gb(&self) -> Result<f64, ProbeDegradation> {
            self.inner.system_memory_gb()
        }
        fn accelerator(&self) -> Result<Option<AcceleratorInfo>, ProbeDegradation> {
            self.inner.accelerator()
        }
        fn graph_toolchain_version(&self) -> Result<Option<ToolchainVersion>, ProbeDegradation> {
            self.inner.graph_toolchain_version()
        }
        fn fused_attention_kernel(&self) -> bool {
            self.inner.fused_attention_kernel()
        }
    }

    #[test]
    fn profile_is_memoized_until_invalidated() {
        let mut profiler = ResourceProfiler::new(CountingProbe {
            inner: FakeProbe::with_accelerator(16.0, ComputeCapability { major: 8, minor: 9 }),
            calls: Cell::new(0),
        });

        let first = profiler.profile();
        let second = profiler.profile();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(profiler.source.calls.get(), 1);

        profiler.invalidate();
        let third = profiler.profile();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(*first, *third);
        assert_eq!(profiler.source.calls.get(), 2);
    }
}
