//! Communication error taxonomy
//!
//! Every failure a step can raise falls in one of three classes, and the
//! link worker's policy is a match on that class:
//!
//! | class           | examples                                   | policy                          |
//! |-----------------|--------------------------------------------|---------------------------------|
//! | transient       | timeout, stale message id, socket reset    | retry same step, bounded        |
//! | protocol        | wrong field count, bad checksum, bad code  | fail transaction, no retry      |
//! | configuration   | drop address out of range, missing pin     | fail before any I/O             |

use crate::core::transport::TransportError;
use thiserror::Error;

/// Error raised while performing a transaction step
#[derive(Error, Debug)]
pub enum CommError {
    /// No response before the receive timeout
    #[error("READ TIMED OUT")]
    Timeout,

    /// A response arrived but is not the one being waited for
    #[error("NOT RECEIVED: {0}")]
    NotReceived(String),

    /// Transport level failure (connection refused, reset, ...)
    #[error("{0}")]
    Transport(#[from] TransportError),

    /// Device answered with a 5xx-style "try again" status
    #[error("CONTROLLER BUSY: {0}")]
    Busy(String),

    /// Framing disagreement which a retry cannot fix
    #[error("PROTOCOL ERROR: {0}")]
    Protocol(String),

    /// Checksum mismatch on a received frame
    #[error("CHECKSUM ERROR: {0}")]
    Checksum(String),

    /// Invalid device or link configuration
    #[error("CONFIGURATION ERROR: {0}")]
    Configuration(String),
}

/// Failure class, deciding retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Retried at the same step up to the link's retry bound
    Transient,
    /// Fails the transaction immediately
    Protocol,
    /// Fails the transaction before any bytes are sent
    Configuration,
}

impl CommError {
    /// Shorthand for a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Shorthand for a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Shorthand for a not-received condition
    pub fn not_received(msg: impl Into<String>) -> Self {
        Self::NotReceived(msg.into())
    }

    /// Classify the error
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Timeout | Self::NotReceived(_) | Self::Transport(_) | Self::Busy(_) => {
                ErrorClass::Transient
            }
            Self::Protocol(_) | Self::Checksum(_) => ErrorClass::Protocol,
            Self::Configuration(_) => ErrorClass::Configuration,
        }
    }

    /// Check if the transport should be closed and reopened
    pub fn needs_reconnect(&self) -> bool {
        matches!(self, Self::Transport(e) if e.is_fatal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classes() {
        assert_eq!(CommError::Timeout.class(), ErrorClass::Transient);
        assert_eq!(CommError::not_received("id").class(), ErrorClass::Transient);
        assert_eq!(
            CommError::Transport(TransportError::Disconnected).class(),
            ErrorClass::Transient
        );
        assert_eq!(CommError::protocol("arity").class(), ErrorClass::Protocol);
        assert_eq!(CommError::Checksum("0x83".into()).class(), ErrorClass::Protocol);
        assert_eq!(CommError::config("drop 0").class(), ErrorClass::Configuration);
    }

    #[test]
    fn test_reconnect_only_on_fatal_transport_errors() {
        assert!(CommError::Transport(TransportError::Disconnected).needs_reconnect());
        assert!(!CommError::Timeout.needs_reconnect());
        assert!(!CommError::protocol("x").needs_reconnect());
    }

    #[test]
    fn test_display() {
        assert_eq!(CommError::Timeout.to_string(), "READ TIMED OUT");
        assert_eq!(
            CommError::protocol("wrong field count").to_string(),
            "PROTOCOL ERROR: wrong field count"
        );
    }
}
