//! Fixed set of worker threads draining one bounded queue.
//!
//! A [`WorkerPool`] owns an input [`BoundedQueue`] and any number of worker
//! groups registered with [`add_work`](WorkerPool::add_work). Every thread of
//! every group pops from the same queue, so each item is handled by exactly one
//! worker.
//!
//! Per-worker loop:
//!
//! 1. pop with a bounded wait (`poll_interval`) so a stop request is seen even
//!    when idle;
//! 2. run the worker callback under the group's timeout;
//! 3. [`Flow::Stop`] ends that one thread, the rest keep going;
//! 4. a timeout or panic is logged and counted, and the worker moves on.
//!
//! A worker instance lost to a timeout or panic is rebuilt from the group's
//! factory before the next item, so per-worker state never crosses an
//! abandoned execution.
//!
//! [`stop`](WorkerPool::stop) never drains the queue: items pushed while the
//! pool is stopped wait for the next [`run`](WorkerPool::run).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use switchyard_core::{DispatchError, DispatchResult, OverflowPolicy, PoolConfig};

use crate::deadline::{Execution, Reaper, run_inline, run_with_deadline};
use crate::queue::{BoundedQueue, PopError, PushError};

/// What a worker callback asks for after handling one item.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub enum Flow {
    /// Keep pulling items.
    Continue,
    /// Exit this worker thread.
    Stop,
}

impl From<()> for Flow {
    fn from(_: ()) -> Self {
        Flow::Continue
    }
}

/// A worker callback owned by one worker thread.
pub type BoxedWorker<T> = Box<dyn FnMut(T) -> Flow + Send + 'static>;

/// Builds a fresh worker callback for a thread.
pub type WorkerFactory<T> = Arc<dyn Fn() -> BoxedWorker<T> + Send + Sync + 'static>;

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Items popped from the queue.
    pub processed: u64,
    pub completed: u64,
    pub timeouts: u64,
    pub panics: u64,
    /// Workers that exited because their callback returned `Flow::Stop`.
    pub stop_requests: u64,
    pub in_flight: usize,
    pub workers_alive: usize,
    pub last_processed_at: Option<DateTime<Utc>>,
}

struct WorkerGroup<T> {
    worker_count: usize,
    factory: WorkerFactory<T>,
    timeout: Option<Duration>,
}

impl<T> Clone for WorkerGroup<T> {
    fn clone(&self) -> Self {
        Self {
            worker_count: self.worker_count,
            factory: self.factory.clone(),
            timeout: self.timeout,
        }
    }
}

struct Running {
    stop: Arc<AtomicBool>,
    threads: Vec<thread::JoinHandle<()>>,
}

pub struct WorkerPool<T> {
    name: String,
    config: PoolConfig,
    queue: Arc<BoundedQueue<T>>,
    groups: Mutex<Vec<WorkerGroup<T>>>,
    running: Mutex<Option<Running>>,
    stats: Arc<Mutex<PoolStats>>,
    reaper: Arc<Reaper>,
}

impl<T> core::fmt::Debug for WorkerPool<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("queue_len", &self.queue.len())
            .field("queue_capacity", &self.queue.capacity())
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Pool with its own blocking queue of `queue_capacity` items.
    pub fn new(name: impl Into<String>, queue_capacity: usize) -> Self {
        Self::with_queue(
            name,
            Arc::new(BoundedQueue::with_policy(queue_capacity, OverflowPolicy::Block)),
        )
    }

    /// Pool draining an existing queue.
    pub fn with_queue(name: impl Into<String>, queue: Arc<BoundedQueue<T>>) -> Self {
        Self {
            name: name.into(),
            config: PoolConfig::default(),
            queue,
            groups: Mutex::new(Vec::new()),
            running: Mutex::new(None),
            stats: Arc::new(Mutex::new(PoolStats::default())),
            reaper: Arc::new(Reaper::new()),
        }
    }

    pub fn configured(
        name: impl Into<String>,
        queue: Arc<BoundedQueue<T>>,
        config: PoolConfig,
    ) -> DispatchResult<Self> {
        config.validate()?;
        let mut pool = Self::with_queue(name, queue);
        pool.config = config;
        Ok(pool)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue(&self) -> &Arc<BoundedQueue<T>> {
        &self.queue
    }

    pub fn stats(&self) -> PoolStats {
        lock(&self.stats).clone()
    }

    /// Abandoned (timed-out) executions still running.
    pub fn abandoned(&self) -> usize {
        self.reaper.pending()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.running).is_some()
    }

    /// Register a worker group of `worker_count` threads.
    ///
    /// `factory` builds one worker callback per thread. `timeout` bounds every
    /// invocation; `None` runs callbacks inline without a deadline. A group
    /// added while the pool is running starts immediately.
    pub fn add_work<F, W>(
        &self,
        worker_count: usize,
        factory: F,
        timeout: Option<Duration>,
    ) -> DispatchResult<()>
    where
        F: Fn() -> W + Send + Sync + 'static,
        W: FnMut(T) -> Flow + Send + 'static,
    {
        if worker_count == 0 {
            return Err(DispatchError::invalid_config(format!(
                "pool `{}`: worker_count must be at least 1",
                self.name
            )));
        }
        if timeout == Some(Duration::ZERO) {
            return Err(DispatchError::invalid_config(format!(
                "pool `{}`: timeout must be positive",
                self.name
            )));
        }

        let factory: WorkerFactory<T> = Arc::new(move || Box::new(factory()) as BoxedWorker<T>);
        let group = WorkerGroup {
            worker_count,
            factory,
            timeout,
        };

        // Same lock order as `run`, so a concurrent `run` cannot start this
        // group a second time.
        let mut running = lock(&self.running);
        let group_index = {
            let mut groups = lock(&self.groups);
            groups.push(group.clone());
            groups.len() - 1
        };
        if let Some(running) = running.as_mut() {
            self.spawn_group(group_index, &group, &running.stop, &mut running.threads)?;
        }
        Ok(())
    }

    /// Push an item into the input queue, blocking under backpressure.
    pub fn handle(&self, item: T) -> Result<(), PushError<T>> {
        self.queue.push(item)
    }

    /// Start every registered worker thread. No-op while running.
    pub fn run(&self) -> DispatchResult<()> {
        let mut running = lock(&self.running);
        if running.is_some() {
            return Ok(());
        }

        let stop = Arc::new(AtomicBool::new(false));
        let groups = lock(&self.groups).clone();
        let mut threads = Vec::new();
        for (index, group) in groups.iter().enumerate() {
            if let Err(err) = self.spawn_group(index, group, &stop, &mut threads) {
                stop.store(true, Ordering::Release);
                for t in threads {
                    let _ = t.join();
                }
                return Err(err);
            }
        }

        info!(
            pool = %self.name,
            groups = groups.len(),
            workers = threads.len(),
            "worker pool started"
        );
        *running = Some(Running { stop, threads });
        Ok(())
    }

    /// Signal every worker to exit after its current item and join them.
    ///
    /// No-op when not running. Queued items are left in place.
    pub fn stop(&self) {
        let Some(running) = lock(&self.running).take() else {
            return;
        };

        running.stop.store(true, Ordering::Release);
        for t in running.threads {
            if t.join().is_err() {
                error!(pool = %self.name, "worker thread panicked");
            }
        }
        self.reaper.reap();
        info!(
            pool = %self.name,
            pending = self.queue.len(),
            "worker pool stopped"
        );
    }

    /// Wait until the queue is empty and no item is in flight.
    ///
    /// An item counts as finished once it completed, panicked or timed out.
    /// Returns `false` if `timeout` elapsed first.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.queue.wait_done(timeout)
    }

    /// Spawn the threads of one group into `threads`.
    ///
    /// On a spawn failure the threads started so far stay in `threads`.
    fn spawn_group(
        &self,
        group_index: usize,
        group: &WorkerGroup<T>,
        stop: &Arc<AtomicBool>,
        threads: &mut Vec<thread::JoinHandle<()>>,
    ) -> DispatchResult<()> {
        for worker_index in 0..group.worker_count {
            let label = format!("{}-{}-{}", self.name, group_index, worker_index);
            let ctx = WorkerContext {
                label: label.clone(),
                pool: self.name.clone(),
                queue: self.queue.clone(),
                factory: group.factory.clone(),
                timeout: group.timeout,
                poll_interval: self.config.poll_interval,
                stop: stop.clone(),
                stats: self.stats.clone(),
                reaper: self.reaper.clone(),
            };
            // Counted before the thread exists so a sibling exiting early
            // never sees the pool as empty.
            lock(&self.stats).workers_alive += 1;
            let join = thread::Builder::new()
                .name(label.clone())
                .spawn(move || ctx.run())
                .map_err(|e| {
                    lock(&self.stats).workers_alive -= 1;
                    DispatchError::spawn(label, e)
                })?;
            threads.push(join);
        }
        Ok(())
    }
}

impl<T> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        if let Some(running) = lock(&self.running).take() {
            running.stop.store(true, Ordering::Release);
            for t in running.threads {
                let _ = t.join();
            }
        }
    }
}

fn lock<S>(m: &Mutex<S>) -> MutexGuard<'_, S> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Everything one worker thread owns.
struct WorkerContext<T> {
    label: String,
    pool: String,
    queue: Arc<BoundedQueue<T>>,
    factory: WorkerFactory<T>,
    timeout: Option<Duration>,
    poll_interval: Duration,
    stop: Arc<AtomicBool>,
    stats: Arc<Mutex<PoolStats>>,
    reaper: Arc<Reaper>,
}

impl<T: Send + 'static> WorkerContext<T> {
    fn run(self) {
        debug!(pool = %self.pool, worker = %self.label, "worker started");

        let mut worker: Option<BoxedWorker<T>> = None;
        let mut requested_stop = false;
        while !self.stop.load(Ordering::Acquire) {
            self.reaper.reap();

            let item = match self.queue.try_pop(self.poll_interval) {
                Ok(item) => item,
                Err(PopError::Timeout) => continue,
                Err(PopError::Closed) => break,
            };

            {
                let mut stats = lock(&self.stats);
                stats.processed += 1;
                stats.in_flight += 1;
            }

            let flow = match worker.take().or_else(|| self.build_worker()) {
                Some(current) => {
                    let (kept, flow) = self.execute(current, item);
                    worker = kept;
                    flow
                }
                // No worker to run it; the item is dropped.
                None => Flow::Continue,
            };
            self.queue.task_done();

            {
                let mut stats = lock(&self.stats);
                stats.in_flight = stats.in_flight.saturating_sub(1);
                stats.last_processed_at = Some(Utc::now());
            }

            if flow == Flow::Stop {
                lock(&self.stats).stop_requests += 1;
                info!(pool = %self.pool, worker = %self.label, "worker requested stop");
                requested_stop = true;
                break;
            }
        }

        let alive = {
            let mut stats = lock(&self.stats);
            stats.workers_alive -= 1;
            stats.workers_alive
        };
        if requested_stop && alive == 0 && !self.stop.load(Ordering::Acquire) {
            self.retire_queue();
        }
        debug!(pool = %self.pool, worker = %self.label, "worker exited");
    }

    /// Every worker stopped itself: nothing will ever pop again, so reject
    /// further pushes and drop what is left.
    fn retire_queue(&self) {
        self.queue.close();
        let discarded = self.queue.drain().len();
        warn!(
            pool = %self.pool,
            discarded,
            "all workers stopped themselves, queue closed"
        );
    }

    /// Build a worker from the group factory, isolating factory panics.
    fn build_worker(&self) -> Option<BoxedWorker<T>> {
        match run_inline(|| (self.factory)()) {
            Execution::Completed(worker) => Some(worker),
            Execution::Panicked(message) => {
                lock(&self.stats).panics += 1;
                error!(
                    pool = %self.pool,
                    worker = %self.label,
                    panic = %message,
                    "worker factory panicked, item dropped"
                );
                None
            }
            // `run_inline` neither times out nor spawns.
            Execution::TimedOut(_) | Execution::SpawnFailed(_) => None,
        }
    }

    /// Run one item. Returns the worker if it is still usable, and the flow.
    fn execute(&self, mut worker: BoxedWorker<T>, item: T) -> (Option<BoxedWorker<T>>, Flow) {
        let outcome = match self.timeout {
            None => match run_inline(|| worker(item)) {
                Execution::Completed(flow) => Execution::Completed((worker, flow)),
                Execution::Panicked(message) => Execution::Panicked(message),
                Execution::TimedOut(abandoned) => Execution::TimedOut(abandoned),
                Execution::SpawnFailed(reason) => Execution::SpawnFailed(reason),
            },
            Some(timeout) => run_with_deadline(&self.label, timeout, move || {
                let flow = worker(item);
                (worker, flow)
            }),
        };

        match outcome {
            Execution::Completed((worker, flow)) => {
                lock(&self.stats).completed += 1;
                (Some(worker), flow)
            }
            Execution::Panicked(message) => {
                lock(&self.stats).panics += 1;
                error!(
                    pool = %self.pool,
                    worker = %self.label,
                    panic = %message,
                    "worker callback panicked"
                );
                (None, Flow::Continue)
            }
            Execution::TimedOut(abandoned) => {
                lock(&self.stats).timeouts += 1;
                warn!(
                    pool = %self.pool,
                    worker = %self.label,
                    error_kind = "work_timeout",
                    timeout_ms = self.timeout.map(|t| t.as_millis() as u64),
                    "worker callback exceeded its timeout"
                );
                self.reaper.adopt(abandoned);
                (None, Flow::Continue)
            }
            Execution::SpawnFailed(reason) => {
                error!(
                    pool = %self.pool,
                    worker = %self.label,
                    error = %reason,
                    "failed to spawn execution thread, item dropped"
                );
                (None, Flow::Continue)
            }
        }
    }
}
