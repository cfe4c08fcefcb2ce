//! Priority classes for link queues

use serde::{Deserialize, Serialize};
use std::fmt;

/// Scheduling tier of a transaction, highest first.
///
/// The derived ordering puts `Command` lowest, so the smallest key in a
/// queue is always the most urgent one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityClass {
    /// Direct operator action
    Command,
    /// Configuration push
    Settings,
    /// Frequent periodic status
    PollHigh,
    /// Infrequent periodic status
    PollLow,
    /// Background listeners
    Idle,
    /// Test-harness traffic
    Diagnostic,
}

impl PriorityClass {
    /// All classes, highest first
    pub fn all() -> &'static [PriorityClass] {
        &[
            Self::Command,
            Self::Settings,
            Self::PollHigh,
            Self::PollLow,
            Self::Idle,
            Self::Diagnostic,
        ]
    }

    /// Check if this class should be serviced before `other`
    pub fn is_higher_than(self, other: Self) -> bool {
        self < other
    }

    /// Get name of priority class
    pub fn name(&self) -> &'static str {
        match self {
            Self::Command => "COMMAND",
            Self::Settings => "SETTINGS",
            Self::PollHigh => "POLL_HIGH",
            Self::PollLow => "POLL_LOW",
            Self::Idle => "IDLE",
            Self::Diagnostic => "DIAGNOSTIC",
        }
    }
}

impl fmt::Display for PriorityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
