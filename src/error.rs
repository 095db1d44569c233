//! Error types for the sandgate controller.

use std::path::PathBuf;
use thiserror::Error;

use crate::config::{ConfigError, Mode};

/// Errors surfaced by the controller and its components.
///
/// Per-request recoverable failures (rule-condition evaluation, traffic
/// modification) are absorbed internally with logged fallbacks and never
/// appear here.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration was rejected at construction or by a health check.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// Mode switch target requires a sub-configuration that is absent or
    /// disabled.
    #[error("{0} mode is not enabled")]
    ModeNotEnabled(Mode),

    /// A rule was rejected before it could join the rule set.
    #[error("invalid rule '{name}': {reason}")]
    InvalidRule { name: String, reason: String },

    /// A rule file failed to parse.
    #[error("failed to load rules from {}: {source}", path.display())]
    RuleFile {
        path: PathBuf,
        #[source]
        source: serde_yml::Error,
    },

    /// A rule condition failed to evaluate. Absorbed inside the decision
    /// engine: the offending rule is skipped for that request.
    #[error("condition evaluation failed: {0}")]
    Condition(String),

    /// The decision engine's rule list lock was poisoned by a panicking
    /// writer; the caller falls back to a safe decision.
    #[error("decision engine state is poisoned")]
    EnginePoisoned,

    /// Operation is only valid in a specific mode.
    #[error("{operation} is only available in {required} mode")]
    NotInMode {
        operation: &'static str,
        required: Mode,
    },

    /// A mode-specific component has not been initialized.
    #[error("{0} not initialized")]
    ComponentNotInitialized(&'static str),

    /// Routing failed. Reserved for the real-forwarding extension point;
    /// the placeholder router never produces it.
    #[error("routing failed: {0}")]
    Routing(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for controller operations.
pub type Result<T> = std::result::Result<T, Error>;
