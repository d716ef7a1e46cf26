//! Error handling for the acquisition engine
//!
//! This module defines the engine error type and a Result alias for use
//! throughout the crate.
//!
//! Errors fall in two groups:
//!
//! - **Configuration-time** errors ([`EngineError::is_config_error`]) are
//!   returned synchronously from registry writes and leave the registry
//!   untouched.
//! - **Cycle-time** errors (bus timeouts, hardware faults) never leave the
//!   node that produced them; the scheduler records them in that node's
//!   live value and retries on the next cycle.

use thiserror::Error;

/// A single rejected node within a configuration batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigIssue {
    /// Display name or external node id of the offending node
    pub node: String,
    /// What was wrong with it
    pub message: String,
}

impl ConfigIssue {
    /// Create a new issue
    pub fn new(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.node, self.message)
    }
}

fn format_issues(issues: &[ConfigIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Main error type for engine operations
#[derive(Error, Debug)]
pub enum EngineError {
    /// Malformed or incomplete configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// One or more nodes of a batch failed validation
    #[error("Configuration rejected ({} issue(s)): {}", .issues.len(), format_issues(.issues))]
    ConfigRejected { issues: Vec<ConfigIssue> },

    /// Update or delete referenced a node id the registry does not hold
    #[error("Unknown node id {0}")]
    UnknownNode(u32),

    /// Scaling range with `voltage_min == voltage_max`
    #[error("Scaling domain error: voltage range [{voltage_min}, {voltage_max}] is degenerate")]
    ScalingDomain { voltage_min: f64, voltage_max: f64 },

    /// Arbiter lock not obtained in time
    #[error("Bus timeout: {key} not acquired within {timeout_ms} ms")]
    BusTimeout { key: String, timeout_ms: u64 },

    /// Transaction or pin I/O failure
    #[error("Hardware read error: {0}")]
    HardwareRead(String),

    /// Persistence collaborator failure
    #[error("Store error: {0}")]
    Store(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<EngineError>,
    },
}

impl EngineError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        EngineError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Shorthand for a single-node rejection
    pub fn rejected(node: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::ConfigRejected {
            issues: vec![ConfigIssue::new(node, message)],
        }
    }

    /// Returns true for errors raised while validating or applying configuration
    pub fn is_config_error(&self) -> bool {
        match self {
            EngineError::Config(_)
            | EngineError::ConfigRejected { .. }
            | EngineError::UnknownNode(_)
            | EngineError::ScalingDomain { .. } => true,
            EngineError::WithContext { source, .. } => source.is_config_error(),
            _ => false,
        }
    }

    /// Innermost error beneath any added context
    pub fn root_cause(&self) -> &EngineError {
        match self {
            EngineError::WithContext { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Issues carried by a rejection, empty for every other variant
    pub fn issues(&self) -> &[ConfigIssue] {
        match self {
            EngineError::ConfigRejected { issues } => issues,
            EngineError::WithContext { source, .. } => source.issues(),
            _ => &[],
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::HardwareRead("pin 40 out of range".to_string());
        assert_eq!(err.to_string(), "Hardware read error: pin 40 out of range");
    }

    #[test]
    fn test_error_with_context() {
        let err = EngineError::Config("missing key".to_string());
        let with_ctx = err.with_context("Failed to load engine config");
        assert!(with_ctx.to_string().contains("Failed to load engine config"));
        assert!(with_ctx.is_config_error());
    }

    #[test]
    fn test_rejection_lists_every_issue() {
        let err = EngineError::ConfigRejected {
            issues: vec![
                ConfigIssue::new("tank_level", "missing source_config key 'channel'"),
                ConfigIssue::new("pump", "pin must be an integer"),
            ],
        };
        let text = err.to_string();
        assert!(text.contains("2 issue(s)"));
        assert!(text.contains("tank_level"));
        assert!(text.contains("pump"));
        assert_eq!(err.issues().len(), 2);
    }

    #[test]
    fn test_cycle_errors_are_not_config_errors() {
        let timeout = EngineError::BusTimeout {
            key: "i2c-1@0x48".to_string(),
            timeout_ms: 250,
        };
        assert!(!timeout.is_config_error());
        assert!(timeout.to_string().contains("i2c-1@0x48"));
        assert!(!EngineError::HardwareRead("nack".into()).is_config_error());
        assert!(EngineError::ScalingDomain {
            voltage_min: 1.0,
            voltage_max: 1.0
        }
        .is_config_error());
    }
}
