//! Configuration for the script host.

use serde::Deserialize;
use std::path::Path;

use crate::script::{ResourceLimits, SandboxPolicy};
use crate::{Result, ScriptError};

/// Settings a [`ScriptHost`](crate::ScriptHost) is constructed with.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ScriptConfig {
    /// Sandbox and diagnostics policy.
    #[serde(default)]
    pub sandbox: SandboxPolicy,
    /// Execution limits.
    #[serde(default)]
    pub limits: ResourceLimits,
}

impl ScriptConfig {
    /// Configuration for trusted content: sandbox off, no limits.
    pub fn trusted() -> Self {
        Self {
            sandbox: SandboxPolicy::trusted(),
            limits: ResourceLimits::unlimited(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Optional log file; console only when unset.
    #[serde(default)]
    pub file: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Script host settings.
    #[serde(default)]
    pub script: ScriptConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML file and apply environment overrides.
    pub fn load_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| ScriptError::Config(format!("config parse error: {e}")))
    }

    /// Apply environment variable overrides.
    ///
    /// Supported environment variables:
    /// - `SCRIPTHOST_DISABLE_SANDBOX`: `1`/`true` runs scripts unsandboxed
    /// - `SCRIPTHOST_DEBUG`: `1`/`true` enables debug diagnostics
    pub fn apply_env_overrides(&mut self) {
        if let Some(value) = env_flag("SCRIPTHOST_DISABLE_SANDBOX") {
            self.script.sandbox.disable_sandbox = value;
        }
        if let Some(value) = env_flag("SCRIPTHOST_DEBUG") {
            self.script.sandbox.debug_mode = value;
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        self.script.sandbox.validate()
    }
}

fn env_flag(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?;
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
