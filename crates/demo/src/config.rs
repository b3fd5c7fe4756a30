//! Runtime configuration of the demo process.
//!
//! Loaded from the JSON file named by `SWITCHYARD_CONFIG`; built-in defaults
//! are used when the variable is unset.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use switchyard_core::config::duration_ms;
use switchyard_core::{HandlingConfig, LoopConfig, OverflowPolicy, PoolConfig, Priority};
use switchyard_observability::LogFormat;

pub const CONFIG_ENV: &str = "SWITCHYARD_CONFIG";

/// Which built-in handler a configured handling runs.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    /// Log every reading at debug level.
    Log,
    /// Fold readings into a running min/max/mean summary.
    Aggregate,
    /// Warn when a reading crosses `alarm_threshold`.
    Alarm,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HandlingSpec {
    pub kind: HandlerKind,
    #[serde(flatten)]
    pub handling: HandlingConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub log_format: LogFormat,
    /// How long the demo publishes before shutting down.
    #[serde(rename = "run_for_ms", with = "duration_ms", default = "default_run_for")]
    pub run_for: Duration,
    #[serde(default)]
    pub sensor: LoopConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default = "default_alarm_threshold")]
    pub alarm_threshold: f64,
    #[serde(default = "default_handlings")]
    pub handlings: Vec<HandlingSpec>,
}

fn default_run_for() -> Duration {
    Duration::from_secs(3)
}

fn default_alarm_threshold() -> f64 {
    24.0
}

fn builtin(kind: HandlerKind, name: &str) -> HandlingSpec {
    HandlingSpec {
        kind,
        handling: HandlingConfig::named(name).expect("built-in handling names are valid"),
    }
}

fn default_handlings() -> Vec<HandlingSpec> {
    let mut alarm = builtin(HandlerKind::Alarm, "alarm");
    alarm.handling = alarm
        .handling
        .with_priority(Priority::HIGH)
        .with_timeout(Duration::from_millis(100));

    let mut aggregate = builtin(HandlerKind::Aggregate, "aggregate");
    aggregate.handling = aggregate.handling.with_queue_capacity(16);

    let mut log = builtin(HandlerKind::Log, "log");
    log.handling = log
        .handling
        .with_priority(Priority::LOW)
        .with_worker_count(2)
        .with_queue_capacity(8)
        .with_overflow(OverflowPolicy::DropOldest);

    vec![alarm, aggregate, log]
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::default(),
            run_for: default_run_for(),
            sensor: LoopConfig::new(Duration::from_millis(200), Duration::from_millis(100)),
            pool: PoolConfig::default(),
            alarm_threshold: default_alarm_threshold(),
            handlings: default_handlings(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(json).context("invalid runtime config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("in {}", path.display()))
    }

    /// `SWITCHYARD_CONFIG` if set, defaults otherwise.
    pub fn load() -> anyhow::Result<Self> {
        match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::from_path(path),
            Err(_) => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.sensor.validate()?;
        self.pool.validate()?;
        for spec in &self.handlings {
            spec.handling.validate()?;
        }
        anyhow::ensure!(!self.run_for.is_zero(), "run_for_ms must be positive");
        Ok(())
    }
}
