//! Error types for Skill Factory.
//!
//! Library crates use [`SkillFactoryError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all Skill Factory operations.
#[derive(Debug, thiserror::Error)]
pub enum SkillFactoryError {
    /// Configuration loading or validation error, including missing model credentials.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error while fetching baseline sources.
    #[error("network error: {0}")]
    Network(String),

    /// Malformed JSON, TOML or model output.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Model call failed after retries.
    #[error("model error: {0}")]
    Model(String),

    /// Consecutive billing errors tripped the circuit breaker. Aborts the run.
    #[error("model credits exhausted: {0}")]
    CreditExhausted(String),

    /// A phase could not produce its output (missing artifact, empty input).
    #[error("phase {phase} failed: {message}")]
    Phase { phase: String, message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad resolution request, invalid manifest, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// HTML-to-Markdown conversion error.
    #[error("conversion error: {0}")]
    Conversion(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, SkillFactoryError>;

impl SkillFactoryError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a phase error for the given phase identifier.
    pub fn phase(phase: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Phase {
            phase: phase.into(),
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Fatal errors abort the whole run instead of degrading a single item.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::CreditExhausted(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = SkillFactoryError::config("missing API key");
        assert_eq!(err.to_string(), "config error: missing API key");

        let err = SkillFactoryError::phase("p2", "no atoms extracted");
        assert_eq!(err.to_string(), "phase p2 failed: no atoms extracted");
    }

    #[test]
    fn only_credit_exhaustion_is_fatal() {
        assert!(SkillFactoryError::CreditExhausted("3 in a row".into()).is_fatal());
        assert!(!SkillFactoryError::Model("timeout".into()).is_fatal());
        assert!(!SkillFactoryError::parse("bad json").is_fatal());
    }
}
