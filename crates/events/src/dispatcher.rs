//! Registration and fan-out of typed events.
//!
//! The [`Dispatcher`] is the single point where handlings are registered and
//! events are published.
//!
//! ```text
//! publisher ── publish(event) ──► Dispatcher ──┬─► Handling "audit"   (queue → workers)
//!                                              ├─► Handling "metrics" (queue → workers)
//!                                              └─► ...
//! ```
//!
//! ## Delivery
//!
//! - `publish` pushes the event into the queue of **every** handling registered
//!   for its type, in priority order (higher first, ties by registration order).
//! - Pushing blocks under backpressure, so `publish` may block once per full
//!   queue. It returns once the event is queued everywhere; handlers may or may
//!   not have started by then.
//! - Handler outcomes never flow back to the publisher.
//! - Once every worker of a handling returned [`Flow::Stop`], its queue is
//!   closed and `publish` skips it.
//! - A type with no handlings is not an error: the event is dropped and
//!   [`Published::NoSubscribers`] is returned.
//!
//! ## Shutdown
//!
//! [`Dispatcher::shutdown`] first closes every handling queue, so publishers
//! blocked on a full queue wake up and get [`DispatchError::Stopped`]; it then
//! stops each handling's workers in registration order and discards whatever
//! is still queued. Every later `publish`/`subscribe` fails with `Stopped`.
//!
//! ## Ownership
//!
//! There is no global dispatcher. Create one, wrap it in an `Arc` if several
//! producers need it, and pass it to them explicitly.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;
use tracing::{debug, info, warn};

use switchyard_core::{DispatchError, DispatchResult, HandlingConfig, PoolConfig, Status};
use switchyard_runtime::{Flow, PushError};

use crate::event::{Event, EventType};
use crate::handling::{Handling, HandlingInfo, Lifecycle};

/// Handlings of one event type in delivery order. Replaced wholesale on every
/// registry change so `publish` can work on a snapshot without holding a lock.
type HandlingSet<E> = Arc<Vec<Arc<Handling<E>>>>;

/// Receipt of a successful publish.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Published {
    /// The event was queued for this many handlings.
    Queued { handlings: usize },
    /// No live handling is registered for the event type; the event was
    /// dropped.
    NoSubscribers,
}

impl Published {
    pub fn status(&self) -> Status {
        match self {
            Published::Queued { .. } => Status::Ok,
            Published::NoSubscribers => Status::NoSubscribers,
        }
    }
}

#[derive(Default)]
struct Registry {
    by_type: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
    /// Every handling, in registration order.
    order: Vec<Arc<dyn Lifecycle>>,
}

impl Registry {
    fn set<E: Event>(&self) -> Option<HandlingSet<E>> {
        self.by_type
            .get(&TypeId::of::<E>())
            .and_then(|set| set.downcast_ref::<HandlingSet<E>>())
            .cloned()
    }

    fn replace_set<E: Event>(&mut self, set: Vec<Arc<Handling<E>>>) {
        let id = TypeId::of::<E>();
        if set.is_empty() {
            self.by_type.remove(&id);
        } else {
            let set: HandlingSet<E> = Arc::new(set);
            self.by_type.insert(id, Box::new(set));
        }
    }
}

pub struct Dispatcher {
    registry: RwLock<Registry>,
    stopped: AtomicBool,
    next_seq: AtomicU64,
    pool_config: PoolConfig,
    /// Serializes concurrent `shutdown` calls so each returns after teardown.
    shutdown_lock: Mutex<()>,
}

impl core::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("handlings", &self.read().order.len())
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::build(PoolConfig::default())
    }

    /// Dispatcher whose handlings use `pool_config` for their worker pools.
    pub fn with_pool_config(pool_config: PoolConfig) -> DispatchResult<Self> {
        pool_config.validate()?;
        Ok(Self::build(pool_config))
    }

    fn build(pool_config: PoolConfig) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            stopped: AtomicBool::new(false),
            next_seq: AtomicU64::new(0),
            pool_config,
            shutdown_lock: Mutex::new(()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Register a handling whose workers share one stateless handler.
    ///
    /// Fails with [`DispatchError::DuplicateHandling`] if `config.name` is
    /// already registered for `E`; the existing handling is left untouched.
    pub fn subscribe<E, H>(&self, config: HandlingConfig, handler: H) -> DispatchResult<HandlingInfo>
    where
        E: Event,
        H: Fn(E) -> Flow + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        self.subscribe_with(config, move || {
            let handler = handler.clone();
            move |event: E| (*handler)(event)
        })
    }

    /// Register a handling whose workers each get their own handler from
    /// `factory`.
    ///
    /// A worker whose handler timed out or panicked gets a fresh one.
    pub fn subscribe_with<E, F, W>(
        &self,
        config: HandlingConfig,
        factory: F,
    ) -> DispatchResult<HandlingInfo>
    where
        E: Event,
        F: Fn() -> W + Send + Sync + 'static,
        W: FnMut(E) -> Flow + Send + 'static,
    {
        config.validate()?;
        let event_type = EventType::of::<E>();

        let mut registry = self.write();
        // Checked under the write lock: `shutdown` flips the flag while holding it.
        if self.is_stopped() {
            return Err(DispatchError::stopped());
        }

        let mut set: Vec<Arc<Handling<E>>> = registry
            .set::<E>()
            .map(|set| set.as_ref().clone())
            .unwrap_or_default();

        if set.iter().any(|h| h.name() == &config.name) {
            warn!(
                handling = %config.name,
                event_type = event_type.name,
                "duplicate handling rejected"
            );
            return Err(DispatchError::duplicate_handling(
                event_type.name,
                config.name.as_str(),
            ));
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let handling = Arc::new(Handling::start(config, seq, self.pool_config, factory)?);
        let info = handling.info();

        set.push(handling.clone());
        set.sort_by(|a, b| b.priority().cmp(&a.priority()).then(a.seq().cmp(&b.seq())));
        registry.replace_set(set);
        registry.order.push(handling);

        Ok(info)
    }

    /// Remove a handling: reject new events for it, stop its workers and
    /// discard what is still queued.
    pub fn unsubscribe<E: Event>(&self, name: &str) -> DispatchResult<HandlingInfo> {
        let event_type = EventType::of::<E>();

        let removed = {
            let mut registry = self.write();
            if self.is_stopped() {
                return Err(DispatchError::stopped());
            }
            let mut set: Vec<Arc<Handling<E>>> = registry
                .set::<E>()
                .map(|set| set.as_ref().clone())
                .unwrap_or_default();
            let Some(pos) = set.iter().position(|h| h.name() == name) else {
                return Err(DispatchError::unknown_handling(event_type.name, name));
            };
            let removed = set.remove(pos);
            registry.replace_set(set);
            let id = removed.id();
            registry.order.retain(|h| h.id() != id);
            removed
        };

        removed.close();
        removed.stop();
        removed.discard_pending();
        info!(handling = %name, event_type = event_type.name, "handling unsubscribed");
        Ok(removed.info())
    }

    /// Queue `event` for every handling registered for `E`.
    ///
    /// Handlings whose workers all returned [`Flow::Stop`] are skipped; if
    /// none accepted the event the result is [`Published::NoSubscribers`].
    ///
    /// Blocks while any target queue is full (unless that handling uses a
    /// ring buffer).
    pub fn publish<E: Event>(&self, event: E) -> DispatchResult<Published> {
        if self.is_stopped() {
            return Err(DispatchError::stopped());
        }

        // Snapshot, then release the lock before any push can block.
        let Some(set) = self.read().set::<E>() else {
            debug!(
                event_type = std::any::type_name::<E>(),
                "no handlings registered, event dropped"
            );
            return Ok(Published::NoSubscribers);
        };

        let Some((last, rest)) = set.split_last() else {
            return Ok(Published::NoSubscribers);
        };
        let mut queued = 0;
        for handling in rest {
            queued += usize::from(self.enqueue(handling, event.clone())?);
        }
        queued += usize::from(self.enqueue(last, event)?);

        if queued == 0 {
            return Ok(Published::NoSubscribers);
        }
        Ok(Published::Queued { handlings: queued })
    }

    /// Push into one handling. `Ok(false)` when that handling's queue was
    /// closed without a dispatcher shutdown (its workers all stopped
    /// themselves, or it was unsubscribed mid-publish).
    fn enqueue<E: Event>(&self, handling: &Handling<E>, event: E) -> DispatchResult<bool> {
        match handling.enqueue(event) {
            Ok(()) => Ok(true),
            Err(PushError::Closed(_)) if self.is_stopped() => {
                debug!(handling = %handling.name(), "queue closed by shutdown during publish");
                Err(DispatchError::stopped())
            }
            Err(PushError::Closed(_)) => {
                debug!(handling = %handling.name(), "handling retired, event skipped");
                Ok(false)
            }
            // `enqueue` uses the blocking push, which never reports `Full`.
            Err(PushError::Full(_)) => Ok(false),
        }
    }

    /// Snapshots of the handlings registered for `E`, in delivery order.
    pub fn handlings<E: Event>(&self) -> Vec<HandlingInfo> {
        self.read()
            .set::<E>()
            .map(|set| set.iter().map(|h| h.info()).collect())
            .unwrap_or_default()
    }

    /// Snapshot of one handling.
    pub fn handling<E: Event>(&self, name: &str) -> Option<HandlingInfo> {
        self.read()
            .set::<E>()
            .and_then(|set| set.iter().find(|h| h.name() == name).map(|h| h.info()))
    }

    /// Wait until every handling of `E` has nothing queued or in flight.
    ///
    /// `timeout` applies to each handling in turn.
    pub fn wait_idle<E: Event>(&self, timeout: std::time::Duration) -> bool {
        let Some(set) = self.read().set::<E>() else {
            return true;
        };
        set.iter().all(|h| h.wait_idle(timeout))
    }

    /// Total number of registered handlings across all event types.
    pub fn handling_count(&self) -> usize {
        self.read().order.len()
    }

    /// Stop every handling and reject all further calls.
    ///
    /// Idempotent. Returns only after every worker thread has joined.
    pub fn shutdown(&self) {
        let _serialized = self
            .shutdown_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let order = {
            let mut registry = self.write();
            if self.stopped.swap(true, Ordering::AcqRel) {
                return;
            }
            registry.by_type.clear();
            std::mem::take(&mut registry.order)
        };

        info!(handlings = order.len(), "dispatcher shutting down");

        // Close everything first so no publisher stays blocked on a full
        // queue while earlier handlings are being joined.
        for handling in &order {
            handling.close();
        }

        let mut discarded = 0;
        for handling in &order {
            handling.stop();
            discarded += handling.discard_pending();
            debug!(
                handling = %handling.name(),
                handling_id = %handling.id(),
                event_type = handling.event_type(),
                "handling torn down"
            );
        }

        info!(discarded, "dispatcher stopped");
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
