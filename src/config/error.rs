//! Configuration error types.

use thiserror::Error;

use super::Mode;

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A mode was selected without its required sub-configuration.
    #[error("missing {section} configuration for {mode} mode")]
    MissingModeConfig { mode: Mode, section: &'static str },

    /// A mode was selected whose sub-configuration is present but disabled.
    #[error("{mode} mode is configured but not enabled")]
    ModeDisabled { mode: Mode },

    /// Unrecognized log level string.
    #[error("invalid log level '{value}', expected debug|info|warn|error")]
    InvalidLogLevel { value: String },

    /// Empty configuration file.
    #[error("configuration file is empty")]
    EmptyConfigFile,

    /// YAML parsing error.
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yml::Error),

    /// I/O error reading a config file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
