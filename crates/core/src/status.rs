//! Flat status codes for collaborators that only branch on the outcome kind.
//!
//! Every value the core hands back (errors, publish receipts, execution
//! outcomes) can be reduced to one [`Status`]. Callers that need the details
//! keep the original value; callers that just want to log or count outcomes
//! compare codes.

use serde::{Deserialize, Serialize};

use crate::error::DispatchError;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ok,
    DuplicateHandling,
    NoSubscribers,
    WorkTimeout,
    /// A caught panic in user work; the worker or loop carried on.
    Panicked,
    Stopped,
    UnknownHandling,
    InvalidConfig,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Ok => "ok",
            Status::DuplicateHandling => "duplicate_handling",
            Status::NoSubscribers => "no_subscribers",
            Status::WorkTimeout => "work_timeout",
            Status::Panicked => "panicked",
            Status::Stopped => "stopped",
            Status::UnknownHandling => "unknown_handling",
            Status::InvalidConfig => "invalid_config",
        }
    }

    /// `NoSubscribers` is informational; only the remaining codes are failures.
    pub fn is_failure(self) -> bool {
        !matches!(self, Status::Ok | Status::NoSubscribers)
    }
}

impl core::fmt::Display for Status {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&DispatchError> for Status {
    fn from(err: &DispatchError) -> Self {
        match err {
            DispatchError::DuplicateHandling { .. } => Status::DuplicateHandling,
            DispatchError::UnknownHandling { .. } => Status::UnknownHandling,
            // A worker that never started behaves like a stopped one.
            DispatchError::Stopped | DispatchError::Spawn { .. } => Status::Stopped,
            DispatchError::InvalidConfig(_) => Status::InvalidConfig,
        }
    }
}
