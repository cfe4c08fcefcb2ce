//! CLI Module
//!
//! Exit codes for the one-shot tool

pub mod exit_codes;

pub use exit_codes::{exit_code_description, print_exit_codes, CliResult, ExitCodes};
