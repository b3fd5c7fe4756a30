//! One named consumer group for one event type.
//!
//! A handling is a private [`BoundedQueue`] plus a [`WorkerPool`] sized to the
//! handling's `worker_count`. Nothing else ever touches its queue, so an event
//! pushed into it is popped by exactly one of its workers.
//!
//! Handlings are created by the dispatcher at subscribe time and are immutable
//! afterwards: worker count, queue size and priority never change while the
//! handling lives.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use switchyard_core::{
    DispatchResult, HandlingConfig, HandlingId, HandlingName, OverflowPolicy, PoolConfig, Priority,
};
use switchyard_runtime::{BoundedQueue, Flow, PoolStats, PushError, WorkerPool};

use crate::event::{Event, EventType};

/// Point-in-time view of a handling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandlingInfo {
    pub id: HandlingId,
    pub name: HandlingName,
    pub event_type: &'static str,
    pub priority: Priority,
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
    #[serde(rename = "timeout_ms", with = "switchyard_core::config::option_duration_ms")]
    pub timeout: Option<Duration>,
    pub queued: usize,
    /// Events evicted by the ring-buffer policy.
    pub dropped: u64,
    pub stats: PoolStats,
}

pub struct Handling<E> {
    id: HandlingId,
    config: HandlingConfig,
    event_type: EventType,
    /// Registration order, used to break priority ties.
    seq: u64,
    pool: WorkerPool<E>,
}

impl<E> core::fmt::Debug for Handling<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Handling")
            .field("id", &self.id)
            .field("name", &self.config.name)
            .field("event_type", &self.event_type.name)
            .field("priority", &self.config.priority)
            .finish_non_exhaustive()
    }
}

impl<E: Event> Handling<E> {
    /// Build the queue and pool and start the workers.
    pub(crate) fn start<F, W>(
        config: HandlingConfig,
        seq: u64,
        pool_config: PoolConfig,
        factory: F,
    ) -> DispatchResult<Self>
    where
        F: Fn() -> W + Send + Sync + 'static,
        W: FnMut(E) -> Flow + Send + 'static,
    {
        config.validate()?;
        let event_type = EventType::of::<E>();
        let id = HandlingId::new();

        let queue = Arc::new(BoundedQueue::with_policy(
            config.queue_capacity,
            config.overflow,
        ));
        let pool = WorkerPool::configured(config.name.as_str(), queue, pool_config)?;
        pool.add_work(config.worker_count, factory, config.timeout)?;
        pool.run()?;

        info!(
            handling = %config.name,
            handling_id = %id,
            event_type = event_type.name,
            priority = %config.priority,
            workers = config.worker_count,
            queue_capacity = config.queue_capacity,
            "handling started"
        );

        Ok(Self {
            id,
            config,
            event_type,
            seq,
            pool,
        })
    }

    /// Push into this handling's queue, blocking under backpressure.
    pub(crate) fn enqueue(&self, event: E) -> Result<(), PushError<E>> {
        self.pool.handle(event)
    }

    pub fn info(&self) -> HandlingInfo {
        let queue = self.pool.queue();
        HandlingInfo {
            id: self.id,
            name: self.config.name.clone(),
            event_type: self.event_type.name,
            priority: self.config.priority,
            worker_count: self.config.worker_count,
            queue_capacity: self.config.queue_capacity,
            overflow: self.config.overflow,
            timeout: self.config.timeout,
            queued: queue.len(),
            dropped: queue.dropped(),
            stats: self.pool.stats(),
        }
    }

    /// Block until every queued event has been handled (or timed out).
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.pool.wait_idle(timeout)
    }
}

impl<E> Handling<E> {
    pub fn id(&self) -> HandlingId {
        self.id
    }

    pub fn name(&self) -> &HandlingName {
        &self.config.name
    }

    pub fn priority(&self) -> Priority {
        self.config.priority
    }

    pub(crate) fn seq(&self) -> u64 {
        self.seq
    }
}

/// Type-erased shutdown surface, so the dispatcher can stop handlings of every
/// event type in registration order.
pub(crate) trait Lifecycle: Send + Sync {
    fn id(&self) -> HandlingId;
    fn name(&self) -> &HandlingName;
    fn event_type(&self) -> &'static str;
    /// Reject further events and wake publishers blocked on a full queue.
    fn close(&self);
    /// Stop the workers and join them.
    fn stop(&self);
    /// Drop whatever is still queued. Returns how many events were discarded.
    fn discard_pending(&self) -> usize;
}

impl<E: Event> Lifecycle for Handling<E> {
    fn id(&self) -> HandlingId {
        self.id
    }

    fn name(&self) -> &HandlingName {
        &self.config.name
    }

    fn event_type(&self) -> &'static str {
        self.event_type.name
    }

    fn close(&self) {
        self.pool.queue().close();
    }

    fn stop(&self) {
        self.pool.stop();
        info!(handling = %self.config.name, handling_id = %self.id, "handling stopped");
    }

    fn discard_pending(&self) -> usize {
        let discarded = self.pool.queue().drain().len();
        if discarded > 0 {
            warn!(
                handling = %self.config.name,
                event_type = self.event_type.name,
                discarded,
                "discarded undelivered events"
            );
        }
        discarded
    }
}
