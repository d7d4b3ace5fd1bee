//! Error types for telemetry decoding and pipeline sessions.
//!
//! Every error in this crate is scoped to the request or session lifecycle that
//! triggered it. None of them should take down the surrounding service.
//!
//! ## Error Categories
//!
//! - **Decode Errors**: Truncated or malformed satellite relay payloads
//! - **State Errors**: Operations that are invalid for the current session state
//! - **Argument Errors**: Missing or empty required input
//! - **Process/Socket Errors**: Spawn failures and refused connections
//! - **Config Errors**: Unreadable or invalid configuration
//!
//! ## Recovery and Retry
//!
//! ```rust
//! use skyrelay::RelayError;
//!
//! let error = RelayError::NotRunning;
//! if !error.is_retryable() {
//!     for suggestion in error.recovery_suggestions() {
//!         println!("  - {}", suggestion);
//!     }
//! }
//! ```

use std::net::SocketAddr;
use thiserror::Error;

use crate::session::SessionState;

/// Result type alias for relay operations.
pub type Result<T, E = RelayError> = std::result::Result<T, E>;

/// Failure to decode a hex-encoded satellite payload.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("payload too short: {len} bytes, need at least {required}")]
    TooShort { len: usize, required: usize },

    #[error("invalid hex digit at position {position}")]
    InvalidHex { position: usize },
}

/// Main error type for relay operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RelayError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("pipeline session is {state}, cannot start another")]
    Conflict { state: SessionState },

    #[error("invalid argument '{name}': {reason}")]
    InvalidArgument { name: &'static str, reason: String },

    #[error("no pipeline session is running")]
    NotRunning,

    #[error("failed to spawn '{program}'")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to connect to {addr}")]
    Connection {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration error in {context}: {details}")]
    Config { context: String, details: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Returns whether this error is potentially recoverable through retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            RelayError::Connection { .. } => true,
            RelayError::Conflict { .. } => true,
            RelayError::Io(_) => true,
            RelayError::Decode(_) => false,
            RelayError::InvalidArgument { .. } => false,
            RelayError::NotRunning => false,
            RelayError::Spawn { .. } => false,
            RelayError::Config { .. } => false,
        }
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            RelayError::Decode(DecodeError::TooShort { .. }) => vec![
                "Check the relay message was not truncated in transit",
                "Verify the modem firmware sends the full telemetry record",
            ],
            RelayError::Decode(DecodeError::InvalidHex { .. }) => vec![
                "Ensure the payload is hex encoded",
                "Strip whitespace and separators from the payload",
            ],
            RelayError::Conflict { .. } => vec![
                "Stop the running pipeline before starting a new one",
                "Wait for the current session to finish stopping",
            ],
            RelayError::InvalidArgument { .. } => vec![
                "Provide a non-empty value for the named argument",
            ],
            RelayError::NotRunning => vec![
                "Start a pipeline session before opening a live view",
                "Check the relay log for an unexpected pipeline exit",
            ],
            RelayError::Spawn { .. } => vec![
                "Check the pipeline program is installed and on PATH",
                "Verify the configured program name",
            ],
            RelayError::Connection { .. } => vec![
                "Check the pipeline is writing to the configured sink port",
                "Verify no other process holds the sink port",
                "Increase the connect timeout",
            ],
            RelayError::Config { .. } => vec![
                "Check the configuration file syntax",
                "Compare against the documented defaults",
            ],
            RelayError::Io(_) => vec![
                "Check system resources and permissions",
                "Retry the operation",
            ],
        }
    }

    /// Helper constructor for invalid argument errors.
    pub fn invalid_argument(name: &'static str, reason: impl Into<String>) -> Self {
        RelayError::InvalidArgument { name, reason: reason.into() }
    }

    /// Helper constructor for configuration errors.
    pub fn config(context: impl Into<String>, details: impl Into<String>) -> Self {
        RelayError::Config { context: context.into(), details: details.into() }
    }

    /// Helper constructor for spawn failures.
    pub fn spawn_failed(program: impl Into<String>, source: std::io::Error) -> Self {
        RelayError::Spawn { program: program.into(), source }
    }

    /// Helper constructor for connection failures.
    pub fn connection_failed(addr: SocketAddr, source: std::io::Error) -> Self {
        RelayError::Connection { addr, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn decode_error_messages_carry_lengths(len in 0usize..18, position in 0usize..1000) {
            let short = RelayError::from(DecodeError::TooShort { len, required: 18 });
            prop_assert!(short.to_string().contains(&len.to_string()));

            let bad_hex = RelayError::from(DecodeError::InvalidHex { position });
            prop_assert!(bad_hex.to_string().contains(&position.to_string()));
        }

        #[test]
        fn invalid_argument_names_the_argument(reason in ".*") {
            let error = RelayError::invalid_argument("pipeline", reason.clone());
            let message = error.to_string();
            prop_assert!(message.contains("pipeline"));
            prop_assert!(message.contains(&reason));
        }
    }

    #[test]
    fn error_traits_validation() {
        fn assert_send_sync_static<T: Send + Sync + 'static>() {}
        assert_send_sync_static::<RelayError>();
        assert_send_sync_static::<DecodeError>();
    }

    #[test]
    fn retry_classification() {
        let addr: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);

        assert!(RelayError::connection_failed(addr, refused).is_retryable());
        assert!(RelayError::Conflict { state: SessionState::Running }.is_retryable());
        assert!(!RelayError::NotRunning.is_retryable());
        assert!(!RelayError::from(DecodeError::TooShort { len: 3, required: 18 }).is_retryable());
    }

    #[test]
    fn every_variant_has_suggestions() {
        let errors = [
            RelayError::from(DecodeError::InvalidHex { position: 1 }),
            RelayError::Conflict { state: SessionState::Stopping },
            RelayError::invalid_argument("pipeline", "empty"),
            RelayError::NotRunning,
            RelayError::spawn_failed("gst-launch-1.0", std::io::Error::other("missing")),
            RelayError::config("pipeline", "bad port"),
            RelayError::Io(std::io::Error::other("boom")),
        ];

        for error in &errors {
            let suggestions = error.recovery_suggestions();
            assert!(!suggestions.is_empty(), "no suggestions for {error}");
            assert!(suggestions.iter().all(|s| s.len() > 5));
        }
    }

    #[test]
    fn spawn_error_keeps_source() {
        let error = RelayError::spawn_failed("gst-launch-1.0", std::io::Error::other("not found"));
        let source = std::error::Error::source(&error).expect("source should be kept");
        assert_eq!(source.to_string(), "not found");
    }
}
