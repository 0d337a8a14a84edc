//! Engine configuration.
//!
//! [`EngineConfig`] gathers the knobs of every subsystem. Values come from
//! defaults, a YAML file, or `SCIFORGE_*` environment variables, in that
//! order of precedence from lowest to highest when combined by the CLI.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agents::{AgentConfig, DEFAULT_RETRY_BUDGET};
use crate::backend::{FallbackOrder, GenerativeConfig};
use crate::cache::CacheConfig;
use crate::error::ConfigError;
use crate::executor::ResourceLimits;
use crate::supervisor::SupervisorConfig;
use crate::task::StageKind;
use crate::validation::ValidatorConfig;

/// Retry budget and backend ordering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub budget: u32,
    pub fallback_order: FallbackOrder,
    /// Stages that use a different order than `fallback_order`.
    pub stage_overrides: BTreeMap<StageKind, FallbackOrder>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            budget: DEFAULT_RETRY_BUDGET,
            fallback_order: FallbackOrder::LibraryFirst,
            stage_overrides: BTreeMap::new(),
        }
    }
}

/// Configuration for the whole engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cache: CacheConfig,
    pub retry: RetryPolicy,
    pub limits: ResourceLimits,
    pub validator: ValidatorConfig,
    pub supervisor: SupervisorConfig,
    pub agent: AgentConfig,
    pub generative: GenerativeConfig,
    /// Blob store location; in-memory when unset.
    pub redis_url: Option<String>,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a YAML file. Missing sections keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read or parsed, or the
    /// result fails [`validate`](Self::validate).
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `SCIFORGE_CACHE_TTL_SECS`: Cache TTL from last use (default: 900)
    /// - `SCIFORGE_CACHE_MAX_ENTRIES`: Cache capacity (default: 1000)
    /// - `SCIFORGE_RETRY_BUDGET`: Retries after the first attempt (default: 2)
    /// - `SCIFORGE_FALLBACK_ORDER`: `library_first` or `generative_first`
    /// - `SCIFORGE_EXEC_TIMEOUT_SECS`: Execution deadline (default: 30)
    /// - `SCIFORGE_EXEC_MAX_ROWS`: Row ceiling (default: 1000000)
    /// - `SCIFORGE_EXEC_MAX_BYTES`: Memory ceiling in bytes (default: 256 MiB)
    /// - `SCIFORGE_CONCURRENCY`: Default per-stage concurrency (default: 4)
    /// - `SCIFORGE_MIN_QUALITY`: Minimum output quality (default: 0.5)
    /// - `SCIFORGE_REVALIDATE_CACHED`: Re-check cache hits (default: true)
    /// - `SCIFORGE_GENERATIVE_TIMEOUT_SECS`: Synthesis deadline (default: 60)
    /// - `SCIFORGE_REDIS_URL`: Redis blob store URL (default: in-memory)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `SCIFORGE_*` overrides read through `lookup`.
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(val) = lookup("SCIFORGE_CACHE_TTL_SECS") {
            let secs: u64 = parse_env_value(&val, "SCIFORGE_CACHE_TTL_SECS")?;
            self.cache.ttl = Duration::from_secs(secs);
        }
        if let Some(val) = lookup("SCIFORGE_CACHE_MAX_ENTRIES") {
            self.cache.max_entries = parse_env_value(&val, "SCIFORGE_CACHE_MAX_ENTRIES")?;
        }

        if let Some(val) = lookup("SCIFORGE_RETRY_BUDGET") {
            self.retry.budget = parse_env_value(&val, "SCIFORGE_RETRY_BUDGET")?;
        }
        if let Some(val) = lookup("SCIFORGE_FALLBACK_ORDER") {
            self.retry.fallback_order =
                val.parse().map_err(|message| ConfigError::InvalidValue {
                    key: "SCIFORGE_FALLBACK_ORDER".to_string(),
                    message,
                })?;
        }

        if let Some(val) = lookup("SCIFORGE_EXEC_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "SCIFORGE_EXEC_TIMEOUT_SECS")?;
            self.limits.timeout = Duration::from_secs(secs);
        }
        if let Some(val) = lookup("SCIFORGE_EXEC_MAX_ROWS") {
            self.limits.max_rows = parse_env_value(&val, "SCIFORGE_EXEC_MAX_ROWS")?;
        }
        if let Some(val) = lookup("SCIFORGE_EXEC_MAX_BYTES") {
            self.limits.max_bytes = parse_env_value(&val, "SCIFORGE_EXEC_MAX_BYTES")?;
        }

        if let Some(val) = lookup("SCIFORGE_CONCURRENCY") {
            self.supervisor.default_concurrency = parse_env_value(&val, "SCIFORGE_CONCURRENCY")?;
        }
        if let Some(val) = lookup("SCIFORGE_MIN_QUALITY") {
            self.validator.min_quality = parse_env_value(&val, "SCIFORGE_MIN_QUALITY")?;
        }
        if let Some(val) = lookup("SCIFORGE_REVALIDATE_CACHED") {
            self.agent.revalidate_cached = parse_env_bool(&val, "SCIFORGE_REVALIDATE_CACHED")?;
        }
        if let Some(val) = lookup("SCIFORGE_GENERATIVE_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "SCIFORGE_GENERATIVE_TIMEOUT_SECS")?;
            self.generative.timeout = Duration::from_secs(secs);
        }
        if let Some(val) = lookup("SCIFORGE_REDIS_URL") {
            if !val.is_empty() {
                self.redis_url = Some(val);
            }
        }

        self.validate()?;
        Ok(self)
    }

    pub fn with_retry_budget(mut self, budget: u32) -> Self {
        self.retry.budget = budget;
        self
    }

    pub fn with_fallback_order(mut self, order: FallbackOrder) -> Self {
        self.retry.fallback_order = order;
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_validator(mut self, validator: ValidatorConfig) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_supervisor(mut self, supervisor: SupervisorConfig) -> Self {
        self.supervisor = supervisor;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` naming the first offending
    /// setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.max_entries == 0 {
            return Err(ConfigError::ValidationFailed(
                "cache.max_entries must be greater than 0".to_string(),
            ));
        }
        if self.cache.ttl.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "cache.ttl must be greater than 0".to_string(),
            ));
        }
        if self.limits.timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "limits.timeout must be greater than 0".to_string(),
            ));
        }
        if self.limits.max_rows == 0 || self.limits.max_bytes == 0 {
            return Err(ConfigError::ValidationFailed(
                "limits.max_rows and limits.max_bytes must be greater than 0".to_string(),
            ));
        }
        if self.supervisor.default_concurrency == 0 {
            return Err(ConfigError::ValidationFailed(
                "supervisor.default_concurrency must be greater than 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.validator.min_quality) {
            return Err(ConfigError::ValidationFailed(
                "validator.min_quality must be between 0.0 and 1.0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.validator.max_null_ratio) {
            return Err(ConfigError::ValidationFailed(
                "validator.max_null_ratio must be between 0.0 and 1.0".to_string(),
            ));
        }
        if self.generative.timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "generative.timeout must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse an environment variable value.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.retry.budget, 2);
        assert_eq!(config.retry.fallback_order, FallbackOrder::LibraryFirst);
        assert_eq!(config.cache.ttl, Duration::from_secs(900));
        assert_eq!(config.supervisor.default_concurrency, 4);
        assert!(config.agent.revalidate_cached);
        assert!(config.redis_url.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let config = EngineConfig::default()
            .with_overrides(vars(&[
                ("SCIFORGE_CACHE_TTL_SECS", "60"),
                ("SCIFORGE_RETRY_BUDGET", "4"),
                ("SCIFORGE_FALLBACK_ORDER", "generative-first"),
                ("SCIFORGE_EXEC_MAX_ROWS", "500"),
                ("SCIFORGE_REVALIDATE_CACHED", "off"),
                ("SCIFORGE_REDIS_URL", "redis://localhost:6379"),
            ]))
            .expect("valid overrides");
        assert_eq!(config.cache.ttl, Duration::from_secs(60));
        assert_eq!(config.retry.budget, 4);
        assert_eq!(config.retry.fallback_order, FallbackOrder::GenerativeFirst);
        assert_eq!(config.limits.max_rows, 500);
        assert!(!config.agent.revalidate_cached);
        assert_eq!(config.redis_url.as_deref(), Some("redis://localhost:6379"));
    }

    #[test]
    fn test_invalid_env_values() {
        let err = EngineConfig::default()
            .with_overrides(vars(&[("SCIFORGE_RETRY_BUDGET", "many")]))
            .unwrap_err();
        assert!(err.to_string().contains("SCIFORGE_RETRY_BUDGET"));

        let err = EngineConfig::default()
            .with_overrides(vars(&[("SCIFORGE_REVALIDATE_CACHED", "maybe")]))
            .unwrap_err();
        assert!(err.to_string().contains("expected boolean"));

        let err = EngineConfig::default()
            .with_overrides(vars(&[("SCIFORGE_FALLBACK_ORDER", "random")]))
            .unwrap_err();
        assert!(err.to_string().contains("unknown fallback order"));

        let err = EngineConfig::default()
            .with_overrides(vars(&[("SCIFORGE_CACHE_TTL_SECS", "0")]))
            .unwrap_err();
        assert!(err.to_string().contains("cache.ttl"));
    }

    #[test]
    fn test_validation_rejects_bad_quality() {
        let mut config = EngineConfig::default();
        config.validator.min_quality = 1.5;
        let result = config.validate();
        assert!(result.unwrap_err().to_string().contains("min_quality"));
    }

    #[test]
    fn test_from_yaml_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            "retry:\n  budget: 1\n  stage_overrides:\n    modeling: generative_first\ncache:\n  ttl: 120\nsupervisor:\n  default_concurrency: 2"
        )
        .expect("write");

        let config = EngineConfig::from_yaml_file(file.path()).expect("load");
        assert_eq!(config.retry.budget, 1);
        assert_eq!(
            config.retry.stage_overrides.get(&StageKind::Modeling),
            Some(&FallbackOrder::GenerativeFirst)
        );
        assert_eq!(config.cache.ttl, Duration::from_secs(120));
        assert_eq!(config.cache.max_entries, 1000);
        assert_eq!(config.supervisor.default_concurrency, 2);
        assert_eq!(config.limits, ResourceLimits::default());
    }
}
