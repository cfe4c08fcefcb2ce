//! CLI Exit Codes
//!
//! Exit codes for one-shot device actions, derived from how the
//! transaction ended.

use crate::config::ConfigError;
use crate::core::comm::{CommError, ErrorClass, FailureKind, OperationResult, OperationState};
use std::process::ExitCode;

/// Exit code constants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCodes;

impl ExitCodes {
    /// Success
    pub const SUCCESS: u8 = 0;

    /// General error
    pub const ERROR: u8 = 1;

    /// Invalid arguments
    pub const INVALID_ARGS: u8 = 2;

    /// Communication failed after retries
    pub const COMM_ERROR: u8 = 3;

    /// Configuration error
    pub const CONFIG_ERROR: u8 = 8;

    /// Protocol error
    pub const PROTOCOL_ERROR: u8 = 9;

    /// Transaction cancelled
    pub const CANCELLED: u8 = 11;

    /// Device not found
    pub const DEVICE_NOT_FOUND: u8 = 12;

    /// Port not found
    pub const PORT_NOT_FOUND: u8 = 14;

    /// Frame or checksum validation failed
    pub const VALIDATION_FAILED: u8 = 17;

    /// Internal error
    pub const INTERNAL_ERROR: u8 = 127;
}

/// CLI operation result
#[derive(Debug)]
pub enum CliResult {
    /// Success with optional message
    Success(Option<String>),

    /// Error with code and message
    Error(u8, String),
}

impl CliResult {
    /// Plain success
    pub fn success() -> Self {
        Self::Success(None)
    }

    /// Success with a message for the user
    pub fn success_with_message(msg: impl Into<String>) -> Self {
        Self::Success(Some(msg.into()))
    }

    /// Failure with an exit code
    pub fn error(code: u8, msg: impl Into<String>) -> Self {
        Self::Error(code, msg.into())
    }

    /// Unknown device name
    pub fn device_not_found(name: &str) -> Self {
        Self::Error(
            ExitCodes::DEVICE_NOT_FOUND,
            format!("Device not found: {}", name),
        )
    }

    /// Map a terminal transaction result
    pub fn from_operation(result: &OperationResult) -> Self {
        match &result.state {
            OperationState::Done => Self::success(),
            OperationState::Pending => Self::error(ExitCodes::INTERNAL_ERROR, "still pending"),
            OperationState::Cancelled(reason) => Self::error(ExitCodes::CANCELLED, reason.clone()),
            OperationState::Failed(msg) => {
                let code = match result.failure {
                    Some(FailureKind::Comm) => ExitCodes::COMM_ERROR,
                    Some(FailureKind::Protocol) => ExitCodes::PROTOCOL_ERROR,
                    Some(FailureKind::Configuration) => ExitCodes::CONFIG_ERROR,
                    None => ExitCodes::ERROR,
                };
                Self::error(code, msg.clone())
            }
        }
    }

    /// Get exit code
    pub fn code(&self) -> u8 {
        match self {
            Self::Success(_) => ExitCodes::SUCCESS,
            Self::Error(code, _) => *code,
        }
    }

    /// Get message
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Success(Some(msg)) | Self::Error(_, msg) => Some(msg),
            Self::Success(None) => None,
        }
    }

    /// Convert to ExitCode
    pub fn to_exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }

    /// Is success?
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

impl From<CommError> for CliResult {
    fn from(err: CommError) -> Self {
        let code = match err.class() {
            ErrorClass::Transient => ExitCodes::COMM_ERROR,
            ErrorClass::Protocol => ExitCodes::PROTOCOL_ERROR,
            ErrorClass::Configuration => ExitCodes::CONFIG_ERROR,
        };
        Self::Error(code, err.to_string())
    }
}

impl From<ConfigError> for CliResult {
    fn from(err: ConfigError) -> Self {
        Self::Error(ExitCodes::CONFIG_ERROR, err.to_string())
    }
}

/// Exit code description
pub fn exit_code_description(code: u8) -> &'static str {
    match code {
        0 => "Success",
        1 => "General error",
        2 => "Invalid arguments",
        3 => "Communication error",
        8 => "Configuration error",
        9 => "Protocol error",
        11 => "Operation cancelled",
        12 => "Device not found",
        14 => "Port not found",
        17 => "Validation failed",
        127 => "Internal error",
        _ => "Unknown error",
    }
}

/// Print exit code table
pub fn print_exit_codes() {
    println!("Exit Codes:");
    for code in [0, 1, 2, 3, 8, 9, 11, 12, 14, 17, 127] {
        println!("  {:>3}  {}", code, exit_code_description(code));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn result(state: OperationState, failure: Option<FailureKind>) -> OperationResult {
        OperationResult {
            id: Uuid::new_v4(),
            state,
            failure,
        }
    }

    #[test]
    fn test_cli_result() {
        let success = CliResult::success();
        assert!(success.is_success());
        assert_eq!(success.code(), 0);

        let error = CliResult::error(3, "READ TIMED OUT");
        assert!(!error.is_success());
        assert_eq!(error.message(), Some("READ TIMED OUT"));
    }

    #[test]
    fn test_from_operation() {
        let done = CliResult::from_operation(&result(OperationState::Done, None));
        assert!(done.is_success());

        let comm = CliResult::from_operation(&result(
            OperationState::Failed("READ TIMED OUT".into()),
            Some(FailureKind::Comm),
        ));
        assert_eq!(comm.code(), ExitCodes::COMM_ERROR);

        let proto = CliResult::from_operation(&result(
            OperationState::Failed("bad checksum".into()),
            Some(FailureKind::Protocol),
        ));
        assert_eq!(proto.code(), ExitCodes::PROTOCOL_ERROR);

        let cancelled =
            CliResult::from_operation(&result(OperationState::Cancelled("SKIPPED".into()), None));
        assert_eq!(cancelled.code(), ExitCodes::CANCELLED);
    }

    #[test]
    fn test_from_comm_error() {
        assert_eq!(
            CliResult::from(CommError::config("drop 0")).code(),
            ExitCodes::CONFIG_ERROR
        );
        assert_eq!(CliResult::from(CommError::Timeout).code(), ExitCodes::COMM_ERROR);
    }
}
