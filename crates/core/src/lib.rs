//! `switchyard-core`: shared vocabulary of the dispatch core.
//!
//! This crate contains **no threads and no queues**: only the error model,
//! status codes, identifiers and configuration types the runtime and
//! dispatcher crates agree on.

pub mod config;
pub mod error;
pub mod id;
pub mod priority;
pub mod status;

pub use config::{HandlingConfig, LoopConfig, OverflowPolicy, PoolConfig};
pub use error::{DispatchError, DispatchResult};
pub use id::{HandlingId, HandlingName};
pub use priority::Priority;
pub use status::Status;
