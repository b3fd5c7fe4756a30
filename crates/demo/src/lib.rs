//! Demo wiring for switchyard: a periodic sensor publishing temperature
//! readings to several handlings.

pub mod app;
pub mod config;
pub mod sensor;

pub use app::{App, Report};
pub use config::RuntimeConfig;
