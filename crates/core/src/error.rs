//! FarmRelay Error Types
//!
//! This module defines a layered error hierarchy:
//! - `DomainError`: Relay-level failures (config, malformed input, storage operations)
//! - `InfraError`: Infrastructure errors (IO, serialization)
//! - `RelayError`: Top-level error that wraps both categories

use std::fmt;

/// Domain-level errors representing relay logic failures
#[derive(Debug)]
pub enum DomainError {
    /// Configuration file not found at the specified path
    ConfigNotFound { path: String },
    /// Configuration validation failed
    ConfigInvalid { field: String, reason: String },
    /// Configuration parsing failed
    ConfigParse { source: String },
    /// Undecodable payload from a device or dashboard
    MalformedInput { reason: String },
    /// Storage gateway call failed
    Storage { operation: String, reason: String },
}

impl fmt::Display for DomainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConfigNotFound { path } => write!(f, "Config not found: {}", path),
            Self::ConfigInvalid { field, reason } => {
                write!(f, "Config invalid [{}]: {}", field, reason)
            }
            Self::ConfigParse { source } => write!(f, "Config parse error: {}", source),
            Self::MalformedInput { reason } => write!(f, "Malformed input: {}", reason),
            Self::Storage { operation, reason } => {
                write!(f, "Storage {} failed: {}", operation, reason)
            }
        }
    }
}

impl std::error::Error for DomainError {}

/// Infrastructure-level errors representing external system failures
#[derive(Debug)]
pub enum InfraError {
    /// IO operation failed
    Io(std::io::Error),
    /// JSON serialization/deserialization failed
    Json(serde_json::Error),
    /// YAML serialization/deserialization failed
    Yaml(serde_yml::Error),
}

impl fmt::Display for InfraError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "IO error: {}", err),
            Self::Json(err) => write!(f, "JSON error: {}", err),
            Self::Yaml(err) => write!(f, "YAML error: {}", err),
        }
    }
}

impl std::error::Error for InfraError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Json(e) => Some(e),
            Self::Yaml(e) => Some(e),
        }
    }
}

impl From<std::io::Error> for InfraError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<serde_json::Error> for InfraError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err)
    }
}

impl From<serde_yml::Error> for InfraError {
    fn from(err: serde_yml::Error) -> Self {
        Self::Yaml(err)
    }
}

/// Top-level error type for FarmRelay
///
/// Wraps both domain and infrastructure errors so the binary has a single
/// error type while callers can still match on the category.
#[derive(Debug)]
pub enum RelayError {
    /// Relay logic error
    Domain(DomainError),
    /// Infrastructure/external system error
    Infra(InfraError),
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Domain(e) => write!(f, "{}", e),
            Self::Infra(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for RelayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Domain(e) => Some(e),
            Self::Infra(e) => Some(e),
        }
    }
}

impl From<DomainError> for RelayError {
    fn from(err: DomainError) -> Self {
        Self::Domain(err)
    }
}

impl From<InfraError> for RelayError {
    fn from(err: InfraError) -> Self {
        Self::Infra(err)
    }
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        Self::Infra(InfraError::Io(err))
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Infra(InfraError::Json(err))
    }
}

impl From<serde_yml::Error> for RelayError {
    fn from(err: serde_yml::Error) -> Self {
        Self::Infra(InfraError::Yaml(err))
    }
}

impl RelayError {
    pub fn config_not_found(path: impl Into<String>) -> Self {
        Self::Domain(DomainError::ConfigNotFound { path: path.into() })
    }

    pub fn config_parse_error(source: impl Into<String>) -> Self {
        Self::Domain(DomainError::ConfigParse {
            source: source.into(),
        })
    }

    pub fn config_invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Domain(DomainError::ConfigInvalid {
            field: field.into(),
            reason: reason.into(),
        })
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::Domain(DomainError::MalformedInput {
            reason: reason.into(),
        })
    }

    pub fn storage(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Domain(DomainError::Storage {
            operation: operation.into(),
            reason: reason.into(),
        })
    }

    /// True for errors a peer caused by sending bad data.
    pub fn is_malformed_input(&self) -> bool {
        matches!(self, Self::Domain(DomainError::MalformedInput { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_layers() {
        let err = RelayError::config_invalid("server.port", "must not be 0");
        assert_eq!(err.to_string(), "Config invalid [server.port]: must not be 0");

        let err = RelayError::storage("save_reading", "disk full");
        assert_eq!(err.to_string(), "Storage save_reading failed: disk full");
        assert!(!err.is_malformed_input());
    }

    #[test]
    fn test_malformed_input_is_flagged() {
        let err = RelayError::malformed("expected a JSON object");
        assert!(err.is_malformed_input());
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_json_error_converts_to_infra() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: RelayError = json_err.into();
        assert!(matches!(err, RelayError::Infra(InfraError::Json(_))));
    }
}
