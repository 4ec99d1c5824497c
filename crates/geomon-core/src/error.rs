//! Error types for geomon
//!
//! The monitoring path itself never surfaces these to sample producers; they
//! are returned by configuration loading and operator-facing helpers.

use thiserror::Error;

/// Result type alias for geomon operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for geomon
#[derive(Debug, Error)]
pub enum Error {
    // ==========================================================================
    // Validation Errors
    // ==========================================================================
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unknown metric: {0}")]
    UnknownMetric(String),

    // ==========================================================================
    // Configuration Errors
    // ==========================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    // ==========================================================================
    // I/O Errors
    // ==========================================================================
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Returns the error type string (for structured log fields and CLI output)
    #[must_use]
    pub const fn error_type(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::UnknownMetric(_) => "UNKNOWN_METRIC",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Exhaustive test: every Error variant maps to the correct `error_type` string.
    #[test]
    fn test_error_type_mapping_exhaustive() {
        let bad_json = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let cases: Vec<(Error, &str)> = vec![
            (Error::InvalidArgument("x".into()), "INVALID_ARGUMENT"),
            (Error::UnknownMetric("x".into()), "UNKNOWN_METRIC"),
            (Error::Config("x".into()), "CONFIG_ERROR"),
            (Error::Io(std::io::Error::other("x")), "IO_ERROR"),
            (Error::Serialization(bad_json), "SERIALIZATION_ERROR"),
        ];
        for (err, expected) in cases {
            assert_eq!(err.error_type(), expected, "{err}");
        }
    }

    #[test]
    fn io_error_converts_via_from() {
        let err: Error = std::io::Error::other("disk gone").into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("disk gone"));
    }
}
