//! Simulated temperature sensor and the handlers that consume its readings.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use switchyard_events::Flow;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    pub sensor: String,
    pub seq: u64,
    pub celsius: f64,
    pub taken_at: DateTime<Utc>,
}

/// Deterministic sensor: a slow sine wave around 21 °C.
#[derive(Debug)]
pub struct Sensor {
    name: String,
    seq: AtomicU64,
}

impl Sensor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            seq: AtomicU64::new(0),
        }
    }

    pub fn sample(&self) -> Reading {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        Reading {
            sensor: self.name.clone(),
            seq,
            celsius: 21.0 + 4.0 * (seq as f64 * 0.4).sin(),
            taken_at: Utc::now(),
        }
    }
}

/// Running summary folded by the aggregate handler.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Summary {
    pub count: u64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub sum: f64,
}

impl Summary {
    pub fn record(&mut self, celsius: f64) {
        self.count += 1;
        self.sum += celsius;
        self.min = Some(self.min.map_or(celsius, |m| m.min(celsius)));
        self.max = Some(self.max.map_or(celsius, |m| m.max(celsius)));
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

pub fn log_reading(reading: Reading) -> Flow {
    debug!(
        sensor = %reading.sensor,
        seq = reading.seq,
        celsius = reading.celsius,
        "reading"
    );
    Flow::Continue
}

pub fn aggregate(summary: Arc<Mutex<Summary>>) -> impl Fn(Reading) -> Flow + Send + Sync + 'static {
    move |reading| {
        summary
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(reading.celsius);
        Flow::Continue
    }
}

pub fn alarm(threshold: f64) -> impl Fn(Reading) -> Flow + Send + Sync + 'static {
    move |reading| {
        if reading.celsius > threshold {
            warn!(
                sensor = %reading.sensor,
                seq = reading.seq,
                celsius = reading.celsius,
                threshold,
                "temperature above threshold"
            );
        }
        Flow::Continue
    }
}
