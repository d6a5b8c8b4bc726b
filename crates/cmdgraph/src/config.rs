use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};

use crate::env;
use crate::specialization::DEFAULT_IMAGE_CACHE_CAPACITY;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Registry name used by [`crate::Context::from_config`].
    pub backend: String,
    /// Record low-level API calls into the context trace.
    pub api_trace: bool,
    /// Run members of one wave concurrently when the backend allows it.
    pub parallel_waves: bool,
    /// Generate a configurable image for kernels with no registered image.
    pub jit_fallback: bool,
    pub image_cache_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            backend: "cpu".to_string(),
            api_trace: false,
            parallel_waves: true,
            jit_fallback: true,
            image_cache_capacity: DEFAULT_IMAGE_CACHE_CAPACITY,
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(backend) = env::backend_override() {
            config.backend = backend.to_string();
        }
        config.api_trace = env::api_trace_enabled();
        config
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("failed to parse runtime config")
    }

    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = backend.into();
        self
    }

    pub fn with_api_trace(mut self, enabled: bool) -> Self {
        self.api_trace = enabled;
        self
    }

    pub fn with_parallel_waves(mut self, enabled: bool) -> Self {
        self.parallel_waves = enabled;
        self
    }

    pub fn with_jit_fallback(mut self, enabled: bool) -> Self {
        self.jit_fallback = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config = RuntimeConfig::from_json_str(r#"{ "api_trace": true }"#).unwrap();
        assert!(config.api_trace);
        assert_eq!(config.backend, "cpu");
        assert!(config.parallel_waves);
        assert_eq!(config.image_cache_capacity, DEFAULT_IMAGE_CACHE_CAPACITY);
    }

    #[test]
    fn malformed_json_is_an_error() {
        let err = RuntimeConfig::from_json_str("{ backend: cpu }").unwrap_err();
        assert!(err.to_string().contains("runtime config"));
    }
}
