//! Delivery priority of a handling.

use serde::{Deserialize, Serialize};

/// Ordinal priority. Higher values are enqueued first by `publish`.
///
/// Priority only orders the sequence in which one publish call fills the
/// handling queues; it says nothing about which handler finishes first.
#[derive(
    Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Priority(u32);

impl Priority {
    pub const LOW: Priority = Priority(0);
    pub const NORMAL: Priority = Priority(50);
    pub const HIGH: Priority = Priority(100);

    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u32 {
        self.0
    }
}

impl From<u32> for Priority {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl core::fmt::Display for Priority {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}
