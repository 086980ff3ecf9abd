//! Load-time orchestration and the request-facing service.
//!
//! Load runs plan, model load, optional static cache and optional warmup in
//! that order. Afterwards the service only hands out coordinators over the
//! shared model.

use std::sync::Arc;

use adaptive_control_models::{CacheStrategy, ExecutionConfig, HardwareProfile};

use crate::cache::{CacheDecision, CachePreparer, CacheShape, Ineligibility};
use crate::config::Settings;
use crate::engine::{LoadOptions, ModelHandle, ModelLoader, ModelSpec};
use crate::errors::{EngineError, GenerationError, LoadError};
use crate::generation::{
    CancellationRegistry, GenerationCoordinator, GenerationDefaults, GenerationRequest, GenerationStream,
    RequestId, Transcript,
};
use crate::planner::plan_execution_config;
use crate::warmup::{warmup, WarmupOutcome};

pub struct InferenceService {
    profile: Arc<HardwareProfile>,
    config: Arc<ExecutionConfig>,
    model: ModelHandle,
    defaults: GenerationDefaults,
    cache: CacheDecision,
    warmup: WarmupOutcome,
    cancellations: CancellationRegistry,
}

impl InferenceService {
    /// Loads the model named in `settings`. Fails only on an invalid plan or
    /// a failed model load; cache and warmup problems are logged and
    /// recorded.
    pub fn load<L>(settings: &Settings, profile: Arc<HardwareProfile>, loader: &L) -> Result<Self, LoadError>
    where
        L: ModelLoader + ?Sized,
    {
        let model_settings = settings
            .model
            .as_ref()
            .ok_or(EngineError::Unsupported("loading without a [model] section"))?;
        Self::load_spec(&model_settings.spec(), settings, profile, loader)
    }

    pub fn load_spec<L>(
        spec: &ModelSpec,
        settings: &Settings,
        profile: Arc<HardwareProfile>,
        loader: &L,
    ) -> Result<Self, LoadError>
    where
        L: ModelLoader + ?Sized,
    {
        let config = plan_execution_config(&profile, &settings.plan_overrides())?;
        let loaded = loader.load(spec, &LoadOptions::from(&config))?;
        let mut model = ModelHandle::new(loaded);

        let cache = if config.cache_strategy == CacheStrategy::Static {
            let mut shape = CacheShape::for_config(&config);
            if let Some(batch) = settings.load.static_cache_batch {
                shape.max_batch = batch;
            }
            if let Some(seq_len) = settings.load.static_cache_max_seq_len {
                shape.max_seq_len = seq_len;
            }
            let preparer = CachePreparer::for_profile(&profile);
            let decision = {
                let mut engine = model.lock_engine();
                preparer.prepare(&config, &mut **engine, model.modality(), shape)
            };
            if let Some(handle) = decision.handle() {
                model.attach_static_cache(handle.clone());
            }
            decision
        } else {
            CacheDecision::NotEligible(Ineligibility::DynamicRequested)
        };

        let warmup_outcome = if settings.load.warmup_enabled() {
            let mut engine = model.lock_engine();
            warmup(&mut **engine, &config)
        } else {
            WarmupOutcome::Skipped
        };

        tracing::info!(
            model = %spec.path.display(),
            cache = %cache.effective_strategy(),
            warmup = ?warmup_outcome,
            "model ready"
        );

        Ok(Self {
            profile,
            config: Arc::new(config),
            model,
            defaults: settings.generation.clone(),
            cache,
            warmup: warmup_outcome,
            cancellations: CancellationRegistry::default(),
        })
    }

    pub fn hardware_profile(&self) -> &HardwareProfile {
        &self.profile
    }

    pub fn execution_config(&self) -> &ExecutionConfig {
        &self.config
    }

    pub fn cache_decision(&self) -> &CacheDecision {
        &self.cache
    }

    pub fn warmup_outcome(&self) -> &WarmupOutcome {
        &self.warmup
    }

    pub fn coordinator(&self) -> GenerationCoordinator {
        GenerationCoordinator::new(self.config.clone(), self.model.clone(), self.defaults.clone())
    }

    /// Starts a streamed request that can later be cancelled by id. The id
    /// stays valid until the stream finishes or is dropped.
    pub fn start_generation(
        &self,
        mut request: GenerationRequest,
    ) -> Result<(RequestId, GenerationStream), GenerationError> {
        let token = request.cancel.get_or_insert_with(Default::default).clone();
        let registration = self.cancellations.register(token);
        let id = registration.id();

        let mut stream = self.coordinator().stream(request)?;
        stream.attach_registration(registration);
        tracing::debug!(request_id = id, "generation started");
        Ok((id, stream))
    }

    pub fn generate(&self, request: GenerationRequest) -> Result<Transcript, GenerationError> {
        self.coordinator().run(request)
    }

    /// Returns false when no in-flight request has this id.
    pub fn cancel(&self, id: RequestId) -> bool {
        let found = self.cancellations.cancel(id);
        if found {
            tracing::info!(request_id = id, "generation cancellation requested");
        }
        found
    }

    pub fn in_flight(&self) -> usize {
        self.cancellations.in_flight()
    }
}
