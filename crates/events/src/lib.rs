//! `switchyard-events`: typed in-process publish/subscribe.
//!
//! - [`Dispatcher`]: registers handlings and fans published events out to them
//! - [`Handling`]: one named consumer group (private queue + worker pool)
//! - [`Event`]: marker for anything `Clone + Send + 'static`
//!
//! The queue, loop and pool primitives live in `switchyard-runtime`.

pub mod dispatcher;
pub mod event;
pub mod handling;

pub use dispatcher::{Dispatcher, Published};
pub use event::Event;
pub use handling::{Handling, HandlingInfo};
pub use switchyard_runtime::Flow;
