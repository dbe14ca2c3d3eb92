//! Core error types for the edge tunnel service

use std::path::PathBuf;
use thiserror::Error;

use crate::ipc::ResponseCode;
use crate::types::Fingerprint;

/// Top-level error type surfaced by service operations
#[derive(Error, Debug)]
pub enum TunnelError {
    /// Malformed request line or payload
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Unknown fingerprint
    #[error("identity with fingerprint {0} not found")]
    NotFound(Fingerprint),

    /// Enrollment failed
    #[error("Enrollment error: {0}")]
    Enrollment(#[from] EnrollmentError),

    /// State or identity file could not be written
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Tunnel engine call failed
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl TunnelError {
    /// Response code reported to IPC clients for this error
    pub fn code(&self) -> ResponseCode {
        match self {
            TunnelError::Protocol(_) => ResponseCode::ProtocolError,
            TunnelError::NotFound(_) => ResponseCode::IdentityNotFound,
            TunnelError::Enrollment(EnrollmentError::WriteFile(_)) => {
                ResponseCode::CouldNotWriteFile
            }
            TunnelError::Enrollment(_) => ResponseCode::CouldNotEnroll,
            TunnelError::Persistence(_) => ResponseCode::PersistenceError,
            TunnelError::Engine(_) => ResponseCode::EngineError,
            TunnelError::Configuration(_) => ResponseCode::UnknownError,
        }
    }
}

/// Enrollment-related errors
#[derive(Error, Debug)]
pub enum EnrollmentError {
    /// Enrollment token could not be parsed or validated
    #[error("failed to parse JWT: {0}")]
    InvalidToken(#[from] TokenError),

    /// An identity with the enrolled certificate already exists
    #[error("identity {0} is already enrolled")]
    AlreadyEnrolled(Fingerprint),

    /// The engine rejected the enrollment
    #[error("failed to enroll: {0}")]
    Engine(EngineError),

    /// Temporary credential file could not be created or written
    #[error("could not write the identity file: {0}")]
    WriteFile(std::io::Error),

    /// Temporary credential file could not be moved to its final path
    #[error("a problem occurred while writing the identity file to {path:?}: {source}")]
    Rename {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Errors reported by the tunnel engine collaborator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Identity could not be loaded or connected
    #[error("failed to load identity: {0}")]
    Load(String),

    /// Identity was expected to hold an engine handle but does not
    #[error("identity has not been initialized properly: {0}")]
    NotLoaded(String),

    /// Intercept removal failed
    #[error("failed to remove intercept for service {service}: {reason}")]
    Intercept { service: String, reason: String },

    /// Enrollment was rejected by the controller
    #[error("enrollment rejected: {0}")]
    Enrollment(String),

    /// Engine does not support the requested operation
    #[error("operation not supported by engine: {0}")]
    Unsupported(String),

    /// Any other engine failure
    #[error("{0}")]
    Other(String),
}

/// Enrollment token errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    /// Token does not have three dot-separated segments
    #[error("token is not a JWT (expected 3 segments, found {0})")]
    Segments(usize),

    /// A segment is not valid base64url
    #[error("token segment is not valid base64: {0}")]
    Encoding(String),

    /// Header or claims are not valid JSON
    #[error("token claims are not valid JSON: {0}")]
    Claims(String),

    /// A required claim is missing or blank
    #[error("token is missing required claim: {0}")]
    MissingClaim(&'static str),

    /// Token has expired
    #[error("token expired at {0}")]
    Expired(u64),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            TunnelError::NotFound(Fingerprint::new("abc")).code(),
            ResponseCode::IdentityNotFound
        );
        assert_eq!(
            TunnelError::from(EnrollmentError::InvalidToken(TokenError::Segments(1))).code(),
            ResponseCode::CouldNotEnroll
        );
        assert_eq!(
            TunnelError::from(EngineError::Other("boom".into())).code(),
            ResponseCode::EngineError
        );
    }

    #[test]
    fn test_not_found_message_names_fingerprint() {
        let err = TunnelError::NotFound(Fingerprint::new("abc"));
        assert_eq!(err.to_string(), "identity with fingerprint abc not found");
    }
}
