//! Runtime Configuration
//!
//! Configuration for the event loop that drives fibers. Configuration can be
//! set programmatically or loaded from environment variables.
//!
//! # Environment Variables
//!
//! All environment variables use the `EFFECT_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `EFFECT_YIELD_BUDGET` | Steps a fiber runs before yielding the loop | 1024 |
//! | `EFFECT_THREAD_NAME` | Name of the event-loop thread | `effect-loop` |
//!
//! # Example
//!
//! ```rust,ignore
//! use effect_runtime::config::RuntimeConfig;
//!
//! // Load from environment with defaults
//! let config = RuntimeConfig::from_env();
//!
//! // Or use the builder pattern
//! let config = RuntimeConfig::builder()
//!     .yield_budget(256)
//!     .thread_name("app-loop")
//!     .build()?;
//! ```

use std::env;

use thiserror::Error;

/// Default number of trampoline steps between yields.
pub const DEFAULT_YIELD_BUDGET: usize = 1024;

/// Default event-loop thread name.
pub const DEFAULT_THREAD_NAME: &str = "effect-loop";

/// Runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Steps a fiber may run before it re-queues itself so other fibers
    /// sharing the loop make progress.
    pub yield_budget: usize,

    /// Name of the event-loop thread.
    pub thread_name: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            yield_budget: DEFAULT_YIELD_BUDGET,
            thread_name: DEFAULT_THREAD_NAME.to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Create a new builder for RuntimeConfig.
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Unset variables use defaults. Invalid values are logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        match parse_env_usize("EFFECT_YIELD_BUDGET") {
            Ok(Some(val)) if val > 0 => config.yield_budget = val,
            Ok(Some(_)) => {
                tracing::warn!(var = "EFFECT_YIELD_BUDGET", "ignoring zero yield budget")
            }
            Ok(None) => {}
            Err(err) => tracing::warn!(error = %err, "ignoring invalid environment variable"),
        }

        if let Ok(val) = env::var("EFFECT_THREAD_NAME") {
            if !val.trim().is_empty() {
                config.thread_name = val;
            }
        }

        config
    }

    /// Load configuration from environment variables, rejecting bad values.
    pub fn try_from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(val) = parse_env_usize("EFFECT_YIELD_BUDGET")? {
            config.yield_budget = val;
        }
        if let Ok(val) = env::var("EFFECT_THREAD_NAME") {
            config.thread_name = val;
        }
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.yield_budget == 0 {
            return Err(ConfigError::InvalidValue {
                field: "yield_budget".into(),
                message: "must be at least 1".into(),
            });
        }

        if self.thread_name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "thread_name".into(),
                message: "must not be empty".into(),
            });
        }

        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Invalid configuration value.
    #[error("invalid configuration for '{field}': {message}")]
    InvalidValue {
        /// Field name.
        field: String,
        /// Error message.
        message: String,
    },
    /// Environment variable parse error.
    #[error("failed to parse environment variable '{var}': {message}")]
    EnvParse {
        /// Variable name.
        var: String,
        /// Error message.
        message: String,
    },
}

/// Builder for RuntimeConfig.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of steps between yields.
    pub fn yield_budget(mut self, steps: usize) -> Self {
        self.config.yield_budget = steps;
        self
    }

    /// Set the event-loop thread name.
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.config.thread_name = name.into();
        self
    }

    /// Build the configuration.
    ///
    /// This validates the configuration and returns an error if invalid.
    pub fn build(self) -> Result<RuntimeConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build the configuration without validation.
    pub fn build_unchecked(self) -> RuntimeConfig {
        self.config
    }
}

/// Parse an environment variable as usize.
fn parse_env_usize(name: &str) -> Result<Option<usize>, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: std::num::ParseIntError| ConfigError::EnvParse {
                var: name.to_string(),
                message: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}
