//! `switchyard-runtime`: threaded execution primitives.
//!
//! Leaf-first:
//! - [`queue`]: the bounded, blocking FIFO every other component is built on
//! - [`deadline`]: report-only timeouts for work running on helper threads
//! - [`sleeping_loop`]: periodic execution on a dedicated thread
//! - [`worker_pool`]: N threads draining one queue
//!
//! Everything here runs on plain OS threads; there is no async runtime.

pub mod deadline;
pub mod queue;
pub mod sleeping_loop;
pub mod worker_pool;

pub use deadline::{Abandoned, Execution, Reaper, run_guarded, run_inline, run_with_deadline};
pub use queue::{BoundedQueue, PopError, PushError};
pub use sleeping_loop::{LoopState, LoopStats, SleepingLoop, WorkTimeout};
pub use worker_pool::{Flow, PoolStats, WorkerPool};
