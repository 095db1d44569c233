//! Configuration for the network mode controller.
//!
//! This module provides:
//! - The YAML configuration schema ([`Config`] and its sections)
//! - Centralized safe defaults (full isolation, half mode disabled)
//! - Whole-config validation, run at controller construction and again by
//!   health checks
//! - A file loader
//!
//! # Example
//!
//! ```yaml
//! mode: half
//!
//! half_mode:
//!   enabled: true
//!   default_action: simulate
//!   proxy:
//!     listen_address: "0.0.0.0:8888"
//!   traffic_modifier:
//!     enabled: true
//!     strip_auth_headers: true
//!     sandbox_executables: true
//!     sandbox_dir: /logs/executables
//!
//! logging:
//!   level: info
//!   traffic_log_file: /logs/traffic.log
//!   decisions_file: /logs/decisions.log
//! ```

mod duration_format;
mod error;

pub use error::ConfigError;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::decision::Action;

/// The controller's top-level operating stance.
///
/// Exactly one mode is active at a time. The enum is closed: an unknown mode
/// string is rejected at deserialization, so no "invalid mode" state is
/// representable at runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Complete isolation: every request is answered by simulation services.
    #[default]
    Full,
    /// Rule-driven selective forwarding through the decision engine.
    Half,
    /// Pure passive observation; traffic is never blocked or modified.
    Transparent,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Full => "full",
            Self::Half => "half",
            Self::Transparent => "transparent",
        };
        f.write_str(s)
    }
}

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Initial network mode.
    pub mode: Mode,

    /// Full mode settings. Always present: full mode is the fail-safe and
    /// must never be unconfigurable.
    pub full_mode: FullModeConfig,

    /// Half mode settings. Must be present and enabled to run in half mode.
    pub half_mode: Option<HalfModeConfig>,

    /// Transparent mode settings. Must be present and enabled to run in
    /// transparent mode.
    pub transparent_mode: Option<TransparentModeConfig>,

    /// Logging settings.
    pub logging: LoggingConfig,
}

impl Default for Config {
    /// Safe defaults: full mode, complete isolation, half mode present but
    /// disabled.
    fn default() -> Self {
        Self {
            mode: Mode::Full,
            full_mode: FullModeConfig::default(),
            half_mode: Some(HalfModeConfig::default()),
            transparent_mode: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Validate the configuration as a whole.
    ///
    /// Full mode needs no enablement guard; half and transparent modes must
    /// be both configured and explicitly enabled.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.mode {
            Mode::Full => {}
            Mode::Half => {
                let half = self
                    .half_mode
                    .as_ref()
                    .ok_or(ConfigError::MissingModeConfig {
                        mode: Mode::Half,
                        section: "half_mode",
                    })?;
                if !half.enabled {
                    return Err(ConfigError::ModeDisabled { mode: Mode::Half });
                }
            }
            Mode::Transparent => {
                let transparent =
                    self.transparent_mode
                        .as_ref()
                        .ok_or(ConfigError::MissingModeConfig {
                            mode: Mode::Transparent,
                            section: "transparent_mode",
                        })?;
                if !transparent.enabled {
                    return Err(ConfigError::ModeDisabled {
                        mode: Mode::Transparent,
                    });
                }
            }
        }

        self.logging.validate()?;

        Ok(())
    }
}

/// Load a configuration file (YAML).
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let text = std::fs::read_to_string(path)?;
    if text.trim().is_empty() {
        return Err(ConfigError::EmptyConfigFile);
    }
    let config: Config = serde_yml::from_str(&text)?;
    Ok(config)
}

/// Load and validate a configuration file.
pub fn load_and_validate(path: &Path) -> Result<Config, ConfigError> {
    let config = load_config(path)?;
    config.validate()?;
    Ok(config)
}

/// Full mode settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FullModeConfig {
    /// Block all external traffic; everything is answered by simulation.
    pub complete_isolation: bool,

    /// Which simulation service answers which protocol.
    pub services: ServiceConfig,
}

impl Default for FullModeConfig {
    fn default() -> Self {
        Self {
            complete_isolation: true,
            services: ServiceConfig::default(),
        }
    }
}

/// Simulation service endpoints, per protocol.
///
/// Each protocol carries a handler name (e.g. `inetsim`, `fakenet-ng`) and
/// an address; the address wins when both are set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub dns: String,
    pub dns_address: String,
    pub http: String,
    pub http_address: String,
    pub https: String,
    pub https_address: String,
    pub smtp: String,
    pub smtp_address: String,
    pub ftp: String,
    pub ftp_address: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            dns: "inetsim".to_string(),
            dns_address: "172.20.0.2:53".to_string(),
            http: "fakenet-ng".to_string(),
            http_address: "172.20.0.3:80".to_string(),
            https: "fakenet-ng".to_string(),
            https_address: "172.20.0.3:443".to_string(),
            smtp: "inetsim".to_string(),
            smtp_address: "172.20.0.2:25".to_string(),
            ftp: "inetsim".to_string(),
            ftp_address: "172.20.0.2:21".to_string(),
        }
    }
}

/// Half mode settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HalfModeConfig {
    /// Must be explicitly enabled; half mode can reach the real network.
    pub enabled: bool,

    /// Proxy settings.
    pub proxy: ProxyConfig,

    /// Optional YAML file of additional decision rules, loaded after the
    /// built-in defaults.
    pub decision_rules_file: Option<PathBuf>,

    /// Action taken when no rule matches.
    pub default_action: Action,

    /// Traffic modifier settings.
    pub traffic_modifier: TrafficModifierConfig,

    /// Timeout for forwarded external requests.
    #[serde(with = "duration_format")]
    pub external_request_timeout: Duration,
}

impl Default for HalfModeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            proxy: ProxyConfig::default(),
            decision_rules_file: None,
            default_action: Action::Simulate,
            traffic_modifier: TrafficModifierConfig::default(),
            external_request_timeout: Duration::from_secs(10),
        }
    }
}

/// Proxy settings for half mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Use a transparent proxy.
    pub transparent: bool,

    /// Proxy listen address.
    pub listen_address: String,

    /// Intercept DNS queries.
    pub dns_interception: bool,

    /// Intercept HTTPS traffic.
    pub ssl_interception: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            transparent: true,
            listen_address: "0.0.0.0:8888".to_string(),
            dns_interception: true,
            ssl_interception: true,
        }
    }
}

/// Traffic modifier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrafficModifierConfig {
    /// Enable traffic modification.
    pub enabled: bool,

    /// Remove authentication headers from every modified request.
    pub strip_auth_headers: bool,

    /// Stamp analysis-identifying headers on every modified request.
    pub inject_tracking_headers: bool,

    /// Replace executable downloads with a harmless placeholder.
    pub sandbox_executables: bool,

    /// Directory where sandboxed artifacts are stored.
    pub sandbox_dir: PathBuf,

    /// Maximum response body size in bytes; larger bodies are truncated.
    pub max_response_size: u64,
}

impl Default for TrafficModifierConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strip_auth_headers: true,
            inject_tracking_headers: false,
            sandbox_executables: true,
            sandbox_dir: PathBuf::from("/logs/executables"),
            max_response_size: 10 * 1024 * 1024,
        }
    }
}

/// Transparent mode settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransparentModeConfig {
    /// Must be explicitly enabled.
    pub enabled: bool,

    /// Extract protocol-specific payload data for supported protocols.
    pub extract_payloads: bool,

    /// Log connection events.
    pub log_connections: bool,

    /// Count and log ICMP packets.
    pub log_icmp: bool,

    /// Maximum captured payload size in bytes; larger payloads are
    /// truncated in the payload log.
    pub max_payload_size: u64,

    /// Application protocols eligible for payload extraction.
    pub supported_protocols: Vec<String>,

    /// Connection event log (JSON lines). Falls back to the structured
    /// logger when unset.
    pub connection_log_file: Option<PathBuf>,

    /// Extracted payload log (JSON lines). Falls back to the structured
    /// logger when unset.
    pub payload_log_file: Option<PathBuf>,
}

impl Default for TransparentModeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            extract_payloads: true,
            log_connections: true,
            log_icmp: true,
            max_payload_size: 4096,
            supported_protocols: vec![
                "http".to_string(),
                "https".to_string(),
                "dns".to_string(),
                "smtp".to_string(),
                "ftp".to_string(),
            ],
            connection_log_file: None,
            payload_log_file: None,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: debug, info, warn, or error.
    pub level: String,

    /// Log every request.
    pub log_requests: bool,

    /// Log responses.
    pub log_responses: bool,

    /// Log decision engine decisions.
    pub log_decisions: bool,

    /// Log traffic modifications.
    pub log_modifications: bool,

    /// Combined traffic event log (JSON lines).
    pub traffic_log_file: Option<PathBuf>,

    /// Decision log (JSON lines).
    pub decisions_file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_requests: true,
            log_responses: true,
            log_decisions: true,
            log_modifications: true,
            traffic_log_file: None,
            decisions_file: None,
        }
    }
}

impl LoggingConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        match self.level.as_str() {
            "debug" | "info" | "warn" | "error" => Ok(()),
            other => Err(ConfigError::InvalidLogLevel {
                value: other.to_string(),
            }),
        }
    }
}
