//! Engine Configuration
//!
//! Configuration can be set programmatically, loaded from a TOML file, or
//! read from environment variables.
//!
//! # Environment Variables
//!
//! All environment variables use the `PULLSTREAM_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `PULLSTREAM_INTERRUPTIBLE_ROOT` | Root scope accepts interruption ("true"/"false") | true |
//! | `PULLSTREAM_CATCH_PANICS` | Turn panics in effects and folds into errors | true |
//! | `PULLSTREAM_LOG_LEVEL` | Log level (off/error/warn/info/debug/trace) | info |
//! | `PULLSTREAM_LOG_FILTER` | Full `tracing` filter directive, overrides the level | unset |
//!
//! # File Format
//!
//! ```toml
//! [compile]
//! interruptible_root = true
//! catch_panics = true
//!
//! [log]
//! level = "debug"
//! filter = "pullstream=trace"
//! timestamps = false
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use pullstream::config::{EngineConfig, LogLevel};
//!
//! let config = EngineConfig::builder()
//!     .catch_panics(false)
//!     .log_level(LogLevel::Debug)
//!     .build()?;
//! ```

use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Log level for engine logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// No logging.
    Off,
    /// Error messages only.
    Error,
    /// Warnings and errors.
    Warn,
    /// Informational messages (default).
    #[default]
    Info,
    /// Debug messages.
    Debug,
    /// Trace-level messages.
    Trace,
}

impl LogLevel {
    const ALL: [LogLevel; 6] = [
        LogLevel::Off,
        LogLevel::Error,
        LogLevel::Warn,
        LogLevel::Info,
        LogLevel::Debug,
        LogLevel::Trace,
    ];

    /// The `tracing` filter directive for this level.
    pub fn directive(self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.directive())
    }
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    /// Accepts the directive names, case-insensitively, plus `warning`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        if wanted == "warning" {
            return Ok(LogLevel::Warn);
        }
        Self::ALL
            .into_iter()
            .find(|level| level.directive() == wanted)
            .ok_or_else(|| ConfigError::InvalidValue {
                field: "log.level".into(),
                message: format!("unknown level '{}'", s),
            })
    }
}

/// Interpreter settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileConfig {
    /// Whether the root scope of a compiled stream can be interrupted.
    pub interruptible_root: bool,
    /// Whether panics in effects, finalizers and folds become
    /// [`Error::Panicked`](crate::Error::Panicked) instead of unwinding.
    pub catch_panics: bool,
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            interruptible_root: true,
            catch_panics: true,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default level when no filter is given.
    pub level: LogLevel,
    /// A full filter directive such as `pullstream=trace,tokio=warn`.
    pub filter: Option<String>,
    /// Whether log lines carry timestamps.
    pub timestamps: bool,
}

impl LogConfig {
    /// The filter directive to install.
    pub fn directive(&self) -> String {
        match &self.filter {
            Some(filter) => filter.clone(),
            None => self.level.to_string(),
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Interpreter configuration.
    pub compile: CompileConfig,
    /// Logging configuration.
    pub log: LogConfig,
}

impl EngineConfig {
    /// Create a new builder for EngineConfig.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Variables that are not set, or do not parse, keep their defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(val) = parse_env_bool("PULLSTREAM_INTERRUPTIBLE_ROOT") {
            config.compile.interruptible_root = val;
        }

        if let Some(val) = parse_env_bool("PULLSTREAM_CATCH_PANICS") {
            config.compile.catch_panics = val;
        }

        if let Some(level) = env::var("PULLSTREAM_LOG_LEVEL")
            .ok()
            .and_then(|s| s.parse::<LogLevel>().ok())
        {
            config.log.level = level;
        }

        if let Ok(filter) = env::var("PULLSTREAM_LOG_FILTER") {
            if !filter.trim().is_empty() {
                config.log.filter = Some(filter);
            }
        }

        config
    }

    /// Parse configuration from TOML text and validate it.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file and validate it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(filter) = &self.log.filter {
            if filter.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "log.filter".into(),
                    message: "must not be blank".into(),
                });
            }
            if let Err(error) = tracing_subscriber::EnvFilter::try_new(filter) {
                return Err(ConfigError::InvalidValue {
                    field: "log.filter".into(),
                    message: error.to_string(),
                });
            }
        }

        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Invalid configuration value.
    #[error("invalid configuration for '{field}': {message}")]
    InvalidValue {
        /// Field name.
        field: String,
        /// Error message.
        message: String,
    },
    /// The configuration file could not be read.
    #[error("failed to read configuration file '{path}': {source}")]
    Io {
        /// Path of the file.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The configuration file is not valid TOML.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    /// A logging subscriber could not be installed.
    #[error("failed to install log subscriber: {0}")]
    Subscriber(String),
}

/// Builder for EngineConfig.
#[derive(Debug, Clone, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set whether the root scope can be interrupted.
    pub fn interruptible_root(mut self, enabled: bool) -> Self {
        self.config.compile.interruptible_root = enabled;
        self
    }

    /// Set whether panics become errors.
    pub fn catch_panics(mut self, enabled: bool) -> Self {
        self.config.compile.catch_panics = enabled;
        self
    }

    /// Set the log level.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log.level = level;
        self
    }

    /// Set a full log filter directive.
    pub fn log_filter(mut self, filter: impl Into<String>) -> Self {
        self.config.log.filter = Some(filter.into());
        self
    }

    /// Set whether log lines carry timestamps.
    pub fn log_timestamps(mut self, enabled: bool) -> Self {
        self.config.log.timestamps = enabled;
        self
    }

    /// Build the configuration.
    ///
    /// This validates the configuration and returns an error if invalid.
    pub fn build(self) -> Result<EngineConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build the configuration without validation.
    pub fn build_unchecked(self) -> EngineConfig {
        self.config
    }
}

/// Parse an environment variable as bool.
fn parse_env_bool(name: &str) -> Option<bool> {
    env::var(name).ok().and_then(|s| match s.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    })
}
