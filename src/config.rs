//! Settings file and environment fallbacks.
//!
//! Precedence per field: settings file, then `ADAPTIVE_*` environment
//! variables, then the hardware recommendation.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::engine::ModelSpec;
use crate::errors::ConfigError;
use crate::generation::GenerationDefaults;
use crate::planner::PlanOverrides;
use crate::prompting::PromptFamily;

pub const ENV_DEVICE: &str = "ADAPTIVE_DEVICE";
pub const ENV_PRECISION: &str = "ADAPTIVE_PRECISION";
pub const ENV_WARMUP: &str = "ADAPTIVE_WARMUP";
pub const ENV_STATIC_CACHE: &str = "ADAPTIVE_STATIC_CACHE";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub model: Option<ModelSettings>,
    pub load: LoadSettings,
    pub overrides: PlanOverrides,
    pub generation: GenerationDefaults,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelSettings {
    pub path: PathBuf,
    #[serde(default)]
    pub tokenizer: Option<PathBuf>,
    #[serde(default)]
    pub family: Option<PromptFamily>,
}

impl ModelSettings {
    pub fn spec(&self) -> ModelSpec {
        ModelSpec {
            path: self.path.clone(),
            tokenizer: self.tokenizer.clone(),
            family: self.family,
        }
    }
}

/// Optional load-time steps. Both are off unless enabled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoadSettings {
    pub warmup: Option<bool>,
    pub static_cache: Option<bool>,
    pub static_cache_batch: Option<usize>,
    pub static_cache_max_seq_len: Option<usize>,
}

impl LoadSettings {
    pub fn warmup_enabled(&self) -> bool {
        self.warmup.unwrap_or(false)
    }

    pub fn static_cache_enabled(&self) -> bool {
        self.static_cache.unwrap_or(false)
    }
}

impl Settings {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw, path)
    }

    pub fn from_toml_str(raw: &str, origin: &Path) -> Result<Self, ConfigError> {
        let settings: Self = toml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Fills fields the file left unset from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        fill_string(&mut self.overrides.device, lookup(ENV_DEVICE));
        fill_string(&mut self.overrides.precision, lookup(ENV_PRECISION));

        if self.load.warmup.is_none() {
            if let Some(raw) = lookup(ENV_WARMUP) {
                self.load.warmup = Some(parse_flag(ENV_WARMUP, &raw)?);
            }
        }
        if self.load.static_cache.is_none() {
            if let Some(raw) = lookup(ENV_STATIC_CACHE) {
                self.load.static_cache = Some(parse_flag(ENV_STATIC_CACHE, &raw)?);
            }
        }
        Ok(())
    }

    /// Overrides handed to the planner. Enabling the static cache requests
    /// the static strategy unless one was named explicitly.
    pub fn plan_overrides(&self) -> PlanOverrides {
        let mut overrides = self.overrides.clone();
        if self.load.static_cache_enabled() && overrides.cache_strategy.is_none() {
            overrides.cache_strategy = Some("static".to_string());
        }
        overrides
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let generation = &self.generation;
        if !(0.0..=2.0).contains(&generation.temperature) {
            return Err(invalid("generation.temperature", "must be in [0.0, 2.0]"));
        }
        if !(0.0..=1.0).contains(&generation.top_p) {
            return Err(invalid("generation.top_p", "must be in [0.0, 1.0]"));
        }
        if generation.stream_timeout_secs == 0 {
            return Err(invalid("generation.stream_timeout_secs", "must be > 0"));
        }
        if generation.channel_capacity == 0 {
            return Err(invalid("generation.channel_capacity", "must be > 0"));
        }
        if self.load.static_cache_batch == Some(0) {
            return Err(invalid("load.static_cache_batch", "must be > 0"));
        }
        if self.load.static_cache_max_seq_len == Some(0) {
            return Err(invalid("load.static_cache_max_seq_len", "must be > 0"));
        }
        Ok(())
    }
}

fn fill_string(slot: &mut Option<String>, fallback: Option<String>) {
    let unset = slot.as_deref().map_or(true, |s| s.trim().is_empty());
    if unset {
        if let Some(value) = fallback.filter(|v| !v.trim().is_empty()) {
            *slot = Some(value);
        }
    }
}

fn parse_flag(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(invalid(key, &format!("expected a boolean, got '{}'", other))),
    }
}

fn invalid(key: &str, detail: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        detail: detail.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adaptive_control_models::StreamMode;
    use std::collections::HashMap;

    fn parse(raw: &str) -> Result<Settings, ConfigError> {
        Settings::from_toml_str(raw, Path::new("test.toml"))
    }

    #[test]
    fn empty_file_uses_defaults() {
        let settings = parse("").expect("parse");
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.generation.stream_timeout_secs, 120);
        assert_eq!(settings.generation.channel_capacity, 64);
        assert!(!settings.load.warmup_enabled());
        assert!(settings.model.is_none());
    }

    #[test]
    fn full_file_parses() {
        let settings = parse(
            r#"
            [model]
            path = "models/qwen2.5-7b-instruct-q4_k_m.gguf"
            family = "qwen"

            [load]
            warmup = true
            static_cache = true

            [overrides]
            precision = "bf16"
            max_new_tokens = 256

            [generation]
            temperature = 0.2
            stream_mode = "cumulative"
            "#,
        )
        .expect("parse");

        let model = settings.model.as_ref().expect("model");
        assert_eq!(model.family, Some(PromptFamily::Qwen));
        assert_eq!(model.spec().path, PathBuf::from("models/qwen2.5-7b-instruct-q4_k_m.gguf"));
        assert!(settings.load.warmup_enabled());
        assert_eq!(settings.overrides.precision.as_deref(), Some("bf16"));
        assert_eq!(settings.overrides.max_new_tokens, Some(256));
        assert_eq!(settings.generation.temperature, 0.2);
        assert_eq!(settings.generation.top_p, 0.9);
        assert_eq!(settings.generation.stream_mode, StreamMode::Cumulative);
        assert_eq!(settings.plan_overrides().cache_strategy.as_deref(), Some("static"));
    }

    #[test]
    fn shipped_example_parses() {
        let settings = parse(include_str!("../adaptive.example.toml")).expect("example settings");
        assert!(settings.model.is_some());
        assert!(settings.load.warmup_enabled());
        assert!(!settings.load.static_cache_enabled());
    }

    #[test]
    fn unknown_keys_and_bad_values_are_rejected() {
        assert!(matches!(parse("[load]\nwarmpu = true\n"), Err(ConfigError::Parse { .. })));
        assert!(matches!(
            parse("[generation]\ntop_p = 1.5\n"),
            Err(ConfigError::Invalid { ref key, .. }) if key == "generation.top_p"
        ));
        assert!(matches!(
            parse("[generation]\nchannel_capacity = 0\n"),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn misspelled_override_or_generation_key_is_rejected() {
        assert!(matches!(
            parse("[overrides]\nprecison = \"float32\"\n"),
            Err(ConfigError::Parse { .. })
        ));
        assert!(matches!(
            parse("[generation]\ntemprature = 0.1\n"),
            Err(ConfigError::Parse { .. })
        ));
        let settings = parse("[overrides]\nprecision = \"float32\"\n").expect("parse");
        assert_eq!(settings.overrides.precision.as_deref(), Some("float32"));
    }

    #[test]
    fn env_fills_only_unset_fields() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_DEVICE, "cpu"),
            (ENV_PRECISION, "f16"),
            (ENV_WARMUP, "yes"),
            (ENV_STATIC_CACHE, "1"),
        ]);
        let lookup = |key: &str| env.get(key).map(|v| v.to_string());

        let mut settings = parse("[overrides]\nprecision = \"fp32\"\n[load]\nstatic_cache = false\n").expect("parse");
        settings.apply_env_from(lookup).expect("env");

        assert_eq!(settings.overrides.device.as_deref(), Some("cpu"));
        assert_eq!(settings.overrides.precision.as_deref(), Some("fp32"));
        assert_eq!(settings.load.warmup, Some(true));
        assert_eq!(settings.load.static_cache, Some(false));
        assert!(settings.plan_overrides().cache_strategy.is_none());
    }

    #[test]
    fn malformed_env_flag_is_an_error() {
        let mut settings = Settings::default();
        let err = settings
            .apply_env_from(|key| (key == ENV_WARMUP).then(|| "maybe".to_string()))
            .expect_err("bad flag");
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == ENV_WARMUP));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = Settings::from_file("/nonexistent/adaptive.toml").expect_err("missing");
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
