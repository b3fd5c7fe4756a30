//! Wiring: one sensor loop publishing into one dispatcher.

use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use tracing::{debug, info, warn};

use switchyard_events::{Dispatcher, HandlingInfo, Published};
use switchyard_runtime::{LoopStats, SleepingLoop};

use crate::config::{HandlerKind, RuntimeConfig};
use crate::sensor::{self, Reading, Sensor, Summary};

/// How long shutdown waits for handlings to finish queued readings.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub struct App {
    config: RuntimeConfig,
    dispatcher: Arc<Dispatcher>,
    sensor_loop: SleepingLoop,
    summary: Arc<Mutex<Summary>>,
}

/// What the demo prints on exit.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub sensor: LoopStats,
    pub handlings: Vec<HandlingInfo>,
    pub summary: Summary,
    pub mean_celsius: Option<f64>,
}

impl App {
    pub fn build(config: RuntimeConfig) -> anyhow::Result<Self> {
        let dispatcher = Arc::new(Dispatcher::with_pool_config(config.pool)?);
        let summary = Arc::new(Mutex::new(Summary::default()));

        for spec in &config.handlings {
            let handling = spec.handling.clone();
            let info = match spec.kind {
                HandlerKind::Log => dispatcher.subscribe(handling, sensor::log_reading),
                HandlerKind::Aggregate => {
                    dispatcher.subscribe(handling, sensor::aggregate(summary.clone()))
                }
                HandlerKind::Alarm => {
                    dispatcher.subscribe(handling, sensor::alarm(config.alarm_threshold))
                }
            }
            .with_context(|| format!("subscribing `{}`", spec.handling.name))?;
            debug!(handling = %info.name, kind = ?spec.kind, "handling registered");
        }

        let sensor = Sensor::new("t1");
        let publisher = dispatcher.clone();
        let sensor_loop = SleepingLoop::new("sensor", config.sensor, move || {
            match publisher.publish(sensor.sample()) {
                Ok(Published::Queued { .. }) => {}
                Ok(Published::NoSubscribers) => debug!("no handlings for readings"),
                Err(err) => warn!(error = %err, "reading not published"),
            }
        })?
        .with_timeout_hook(|timeout| {
            warn!(
                iteration = timeout.iteration,
                timeout_ms = timeout.timeout.as_millis() as u64,
                "sensor publish overran its interval budget"
            );
        });

        Ok(Self {
            config,
            dispatcher,
            sensor_loop,
            summary,
        })
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Publish for `run_for`, then stop the sensor, let handlings drain and
    /// shut the dispatcher down.
    pub fn run(self) -> anyhow::Result<Report> {
        info!(run_for_ms = self.config.run_for.as_millis() as u64, "demo starting");
        self.sensor_loop.start()?;
        thread::sleep(self.config.run_for);
        self.sensor_loop.stop();

        if !self.dispatcher.wait_idle::<Reading>(DRAIN_TIMEOUT) {
            warn!("handlings still busy at shutdown; pending readings are discarded");
        }
        let handlings = self.dispatcher.handlings::<Reading>();
        self.dispatcher.shutdown();

        let summary = self
            .summary
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        Ok(Report {
            sensor: self.sensor_loop.stats(),
            handlings,
            mean_celsius: summary.mean(),
            summary,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_config() -> RuntimeConfig {
        RuntimeConfig::from_json(
            r#"{
                "run_for_ms": 300,
                "sensor": { "interval_ms": 50, "timeout_ms": 40 },
                "alarm_threshold": 100.0
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn run_publishes_to_every_configured_handling() {
        let report = App::build(quick_config()).unwrap().run().unwrap();

        assert!(report.sensor.iterations >= 4, "{:?}", report.sensor);
        assert_eq!(report.handlings.len(), 3);
        assert_eq!(report.handlings[0].name, "alarm");
        assert_eq!(report.summary.count, report.sensor.iterations);
        assert!(report.mean_celsius.is_some());

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["handlings"][2]["overflow"], "drop_oldest");
    }

    #[test]
    fn duplicate_configured_names_fail_to_build() {
        let config = RuntimeConfig::from_json(
            r#"{ "handlings": [
                { "kind": "log", "name": "same" },
                { "kind": "aggregate", "name": "same" }
            ] }"#,
        )
        .unwrap();
        let err = App::build(config).err().unwrap();
        assert!(format!("{err:#}").contains("same"));
    }
}
