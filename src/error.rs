//! Error types for the Turnstile admission controller.

use thiserror::Error;

/// Errors raised while building a limiter entry.
///
/// These never poison the registry: nothing is cached when construction fails.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConstructionError {
    /// Rate is negative, NaN or infinite
    #[error("invalid rate {rate}: {reason}")]
    InvalidRate { rate: f64, reason: &'static str },

    /// Resource key is empty
    #[error("resource key must not be empty")]
    EmptyResource,
}

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Limiter construction errors
    #[error("Construction error: {0}")]
    Construction(#[from] ConstructionError),

    /// Admission denied for the caller
    #[error("{message}")]
    RateLimited { code: u16, message: String },

    /// JSON rendering errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TurnstileError {
    /// Returns `true` for the documented "admission denied" outcome.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, TurnstileError::RateLimited { .. })
    }
}

impl From<config::ConfigError> for TurnstileError {
    fn from(err: config::ConfigError) -> Self {
        TurnstileError::Config(err.to_string())
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_construction_error_converts() {
        let err: TurnstileError = ConstructionError::EmptyResource.into();
        assert!(matches!(err, TurnstileError::Construction(ConstructionError::EmptyResource)));
        assert!(!err.is_rate_limited());
    }

    #[test]
    fn test_rate_limited_displays_message() {
        let err = TurnstileError::RateLimited {
            code: 500,
            message: "busy".to_string(),
        };
        assert!(err.is_rate_limited());
        assert_eq!(err.to_string(), "busy");
    }
}
