//! # Error Handling
//!
//! Crate-wide error type for the controller. Validation-class failures of a
//! configuration payload are not errors in this sense: they are recorded on the
//! object's status (see [`crate::xds::validate::ValidationError`]).

use crate::kubernetes::StoreError;

/// Custom result type for controller operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the controller
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network transport errors (gRPC)
    #[error("Transport error: {0}")]
    Transport(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Manifest or bootstrap (de)serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input rejected before it reached the object store
    #[error("Validation error: {0}")]
    Validation(String),

    /// The object is gone from the object store
    #[error("Not found: {0}")]
    NotFound(String),

    /// Optimistic-concurrency race lost against the object store
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The object store could not be reached
    #[error("Object store unavailable: {0}")]
    Unavailable(String),
}

impl Error {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config(message.into())
    }

    /// Create a new transport error
    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport(message.into())
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation(message.into())
    }

    /// Whether retrying the same operation later can succeed. Reconcile workers
    /// give up on anything else straight away.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Conflict(_) | Error::Unavailable(_) | Error::Transport(_))
    }
}

impl From<StoreError> for Error {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound(key) => Error::NotFound(key),
            StoreError::Conflict(key) => Error::Conflict(key),
            StoreError::AlreadyExists(key) => Error::Conflict(format!("{} already exists", key)),
            StoreError::Invalid(message) => Error::Validation(message),
            StoreError::Unavailable(message) => Error::Unavailable(message),
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(error: serde_yaml::Error) -> Self {
        Error::Serialization(error.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Serialization(error.to_string())
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(errors: validator::ValidationErrors) -> Self {
        let message = errors
            .field_errors()
            .iter()
            .map(|(field, field_errors)| {
                let messages: Vec<String> = field_errors
                    .iter()
                    .map(|e| e.message.as_ref().map_or("Invalid value".to_string(), |m| m.to_string()))
                    .collect();
                format!("{}: {}", field, messages.join(", "))
            })
            .collect::<Vec<_>>()
            .join("; ");

        Error::Validation(format!("Validation failed: {}", message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let error = Error::config("Test configuration error");
        assert!(matches!(error, Error::Config(_)));
        assert_eq!(error.to_string(), "Configuration error: Test configuration error");

        let error = Error::validation("port out of range");
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_store_error_conversion() {
        let error: Error = StoreError::Conflict("default/listener/foo".into()).into();
        assert!(matches!(error, Error::Conflict(_)));
        assert!(error.is_retryable());

        let error: Error = StoreError::NotFound("default/listener/foo".into()).into();
        assert!(matches!(error, Error::NotFound(_)));
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_error_conversions() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error: Error = io_error.into();
        assert!(matches!(error, Error::Io(_)));

        let json_error = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let error: Error = json_error.into();
        assert!(matches!(error, Error::Serialization(_)));
    }
}
