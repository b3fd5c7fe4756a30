//! Identifiers for handlings.
//!
//! A handling has two identities:
//! - [`HandlingName`]: caller-supplied, unique per event type, used by
//!   `subscribe`/lookup.
//! - [`HandlingId`]: generated per instance, so two handlings that reuse a
//!   name across an unsubscribe/subscribe cycle stay distinguishable in logs.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DispatchError;

/// Identifier of one handling instance.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandlingId(Uuid);

macro_rules! impl_uuid_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Create a new identifier.
            ///
            /// Uses UUIDv7 (time-ordered), so ids sort by creation time.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $t {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl FromStr for $t {
            type Err = DispatchError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = Uuid::from_str(s)
                    .map_err(|e| DispatchError::invalid_config(format!("{}: {}", $name, e)))?;
                Ok(Self(uuid))
            }
        }
    };
}

impl_uuid_newtype!(HandlingId, "HandlingId");

/// Caller-supplied name of a handling.
///
/// Non-empty, no surrounding whitespace. Uniqueness is enforced per event type
/// by the dispatcher registry, not here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HandlingName(String);

impl HandlingName {
    pub fn new(name: impl Into<String>) -> Result<Self, DispatchError> {
        let name = name.into();
        if name.is_empty() {
            return Err(DispatchError::invalid_config("handling name must not be empty"));
        }
        if name.trim() != name {
            return Err(DispatchError::invalid_config(format!(
                "handling name `{name}` has surrounding whitespace"
            )));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for HandlingName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for HandlingName {
    type Error = DispatchError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for HandlingName {
    type Error = DispatchError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<HandlingName> for String {
    fn from(value: HandlingName) -> Self {
        value.0
    }
}

impl FromStr for HandlingName {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl PartialEq<str> for HandlingName {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for HandlingName {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}
