//! Dispatch error model.

use thiserror::Error;

/// Result type used across the dispatch layer.
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Dispatch-level error.
///
/// Every variant is returned as a value from the call that caused it; nothing
/// in the core retries on the caller's behalf. Timeouts are not errors here:
/// they surface as [`Status::WorkTimeout`](crate::Status::WorkTimeout) on the
/// execution that overran.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// A handling with this name already exists for the event type.
    #[error("handling `{name}` is already registered for event type `{event_type}`")]
    DuplicateHandling {
        event_type: &'static str,
        name: String,
    },

    /// No handling with this name exists for the event type.
    #[error("no handling `{name}` registered for event type `{event_type}`")]
    UnknownHandling {
        event_type: &'static str,
        name: String,
    },

    /// The operation was attempted after shutdown began.
    #[error("dispatcher stopped")]
    Stopped,

    /// A configuration value failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A background thread could not be spawned.
    #[error("failed to spawn thread `{name}`: {reason}")]
    Spawn { name: String, reason: String },
}

impl DispatchError {
    pub fn duplicate_handling(event_type: &'static str, name: impl Into<String>) -> Self {
        Self::DuplicateHandling {
            event_type,
            name: name.into(),
        }
    }

    pub fn unknown_handling(event_type: &'static str, name: impl Into<String>) -> Self {
        Self::UnknownHandling {
            event_type,
            name: name.into(),
        }
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    pub fn stopped() -> Self {
        Self::Stopped
    }

    pub fn spawn(name: impl Into<String>, err: std::io::Error) -> Self {
        Self::Spawn {
            name: name.into(),
            reason: err.to_string(),
        }
    }
}
