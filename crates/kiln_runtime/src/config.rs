//! Orchestrator configuration.

use crate::error::ConfigError;
use crate::throttle::ThrottleRule;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Disables caching when set to `0`/`false`
pub const CACHING_ENV: &str = "KILN_CACHING";
/// Enables cache verification when set to `1`/`true`
pub const VERIFY_CACHING_ENV: &str = "KILN_VERIFY_CACHING";
/// Path to a JSON array of throttle rules
pub const THROTTLE_CONFIG_ENV: &str = "KILN_THROTTLE_CONFIG";

/// Orchestrator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Consult and populate the cache
    #[serde(default = "default_caching")]
    pub caching_enabled: bool,
    /// Recompute on cache hits and report differences instead of trusting the cache
    #[serde(default)]
    pub verify_caching: bool,
    /// Concurrency limits
    #[serde(default)]
    pub throttle: Vec<ThrottleRule>,
}

fn default_caching() -> bool {
    true
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            caching_enabled: true,
            verify_caching: false,
            throttle: Vec::new(),
        }
    }
}

impl OrchestratorConfig {
    /// Enable/disable caching
    #[must_use]
    pub fn with_caching(mut self, enabled: bool) -> Self {
        self.caching_enabled = enabled;
        self
    }

    /// Enable/disable cache verification
    #[must_use]
    pub fn with_verify_caching(mut self, verify: bool) -> Self {
        self.verify_caching = verify;
        self
    }

    /// Add a throttle rule
    #[must_use]
    pub fn with_throttle_rule(mut self, rule: ThrottleRule) -> Self {
        self.throttle.push(rule);
        self
    }

    /// Load from a JSON file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = read(path)?;
        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Defaults with environment overrides applied
    ///
    /// # Errors
    ///
    /// Returns error if an override is malformed
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().apply_env()
    }

    /// Apply `KILN_CACHING`, `KILN_VERIFY_CACHING` and `KILN_THROTTLE_CONFIG`
    ///
    /// # Errors
    ///
    /// Returns error if an override is malformed
    pub fn apply_env(mut self) -> Result<Self, ConfigError> {
        if let Some(enabled) = env_flag(CACHING_ENV)? {
            self.caching_enabled = enabled;
        }
        if let Some(verify) = env_flag(VERIFY_CACHING_ENV)? {
            self.verify_caching = verify;
        }
        if let Some(path) = std::env::var_os(THROTTLE_CONFIG_ENV) {
            self.throttle = load_throttle_rules(Path::new(&path))?;
        }
        Ok(self)
    }
}

/// Read a JSON array of throttle rules
///
/// # Errors
///
/// Returns error if the file cannot be read or parsed
pub fn load_throttle_rules(path: &Path) -> Result<Vec<ThrottleRule>, ConfigError> {
    let contents = read(path)?;
    serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

fn read(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })
}

fn env_flag(var: &str) -> Result<Option<bool>, ConfigError> {
    match std::env::var(var) {
        Ok(value) => parse_flag(&value).map(Some).ok_or_else(|| ConfigError::Env {
            var: var.to_string(),
            value,
        }),
        Err(_) => Ok(None),
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
