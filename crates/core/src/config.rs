//! Configuration for handlings, worker pools and sleeping loops.
//!
//! All durations are (de)serialized as whole milliseconds (`*_ms` fields) so
//! configs can live in plain JSON documents.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, DispatchResult};
use crate::id::HandlingName;
use crate::priority::Priority;

/// What a queue does when a producer pushes into it while it is full.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Block the producer until a consumer makes room (backpressure).
    #[default]
    Block,
    /// Evict the oldest queued item to make room (ring buffer).
    DropOldest,
}

/// Identity and sizing of one handling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlingConfig {
    pub name: HandlingName,
    #[serde(default = "default_priority")]
    pub priority: Priority,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Per-invocation deadline for the handler. `None` runs the handler inline
    /// on the worker thread without a deadline.
    #[serde(default, rename = "timeout_ms", with = "option_duration_ms")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub overflow: OverflowPolicy,
}

fn default_priority() -> Priority {
    Priority::NORMAL
}

fn default_worker_count() -> usize {
    1
}

fn default_queue_capacity() -> usize {
    64
}

impl HandlingConfig {
    pub fn new(name: HandlingName) -> Self {
        Self {
            name,
            priority: default_priority(),
            worker_count: default_worker_count(),
            queue_capacity: default_queue_capacity(),
            timeout: None,
            overflow: OverflowPolicy::default(),
        }
    }

    /// Shorthand for `HandlingConfig::new(HandlingName::new(name)?)`.
    pub fn named(name: impl Into<String>) -> DispatchResult<Self> {
        Ok(Self::new(HandlingName::new(name)?))
    }

    pub fn with_priority(mut self, priority: impl Into<Priority>) -> Self {
        self.priority = priority.into();
        self
    }

    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }

    pub fn validate(&self) -> DispatchResult<()> {
        if self.worker_count == 0 {
            return Err(DispatchError::invalid_config(format!(
                "handling `{}`: worker_count must be at least 1",
                self.name
            )));
        }
        if self.queue_capacity == 0 {
            return Err(DispatchError::invalid_config(format!(
                "handling `{}`: queue_capacity must be at least 1",
                self.name
            )));
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(DispatchError::invalid_config(format!(
                "handling `{}`: timeout must be positive",
                self.name
            )));
        }
        Ok(())
    }
}

/// Timing of a sleeping loop.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopConfig {
    #[serde(rename = "interval_ms", with = "duration_ms")]
    pub interval: Duration,
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(1),
        }
    }
}

impl LoopConfig {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    pub fn validate(&self) -> DispatchResult<()> {
        if self.interval.is_zero() {
            return Err(DispatchError::invalid_config("loop interval must be positive"));
        }
        if self.timeout.is_zero() {
            return Err(DispatchError::invalid_config("loop timeout must be positive"));
        }
        Ok(())
    }
}

/// Longest accepted [`PoolConfig::poll_interval`]. An idle worker only sees a
/// stop request between polls, so this also bounds how long `stop` can take.
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Worker pool tuning shared by every worker group of a pool.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Upper bound on how long an idle worker waits for an item before it
    /// re-checks the stop flag.
    #[serde(rename = "poll_interval_ms", with = "duration_ms")]
    pub poll_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
        }
    }
}

impl PoolConfig {
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn validate(&self) -> DispatchResult<()> {
        if self.poll_interval.is_zero() {
            return Err(DispatchError::invalid_config("poll interval must be positive"));
        }
        if self.poll_interval > MAX_POLL_INTERVAL {
            return Err(DispatchError::invalid_config(format!(
                "poll interval must be at most {}ms",
                MAX_POLL_INTERVAL.as_millis()
            )));
        }
        Ok(())
    }
}

pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

pub mod option_duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
