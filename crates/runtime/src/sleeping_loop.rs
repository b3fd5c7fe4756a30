//! Periodic execution on a dedicated thread with overrun detection.
//!
//! A [`SleepingLoop`] invokes a work function once per interval, forever, until
//! stopped. Every invocation runs under the loop's timeout (see
//! [`deadline`](crate::deadline)); an overrun is reported as `work_timeout` and
//! the invocation is abandoned, never awaited again.
//!
//! ## Cadence
//!
//! Ticks sit on a fixed grid `start + k * interval`, so execution time never
//! shifts later ticks. Executions are **serialized**:
//!
//! - a tick that is already in the past when the loop gets back to waiting is
//!   skipped (no catch-up bursts);
//! - a tick that arrives while an abandoned invocation is still running is
//!   skipped.
//!
//! Both show up as `skipped_ticks` in [`LoopStats`].
//!
//! ## Lifecycle
//!
//! `Created → Running → Stopped`. [`start`](SleepingLoop::start) returns once
//! the loop thread is running; [`stop`](SleepingLoop::stop) returns once it has
//! joined, so shared state can be torn down right after. Both are idempotent,
//! and a stopped loop can be started again.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use switchyard_core::{DispatchError, DispatchResult, LoopConfig};

use crate::deadline::{Execution, Reaper, run_with_deadline};

/// Work function of a loop.
pub type WorkFn = Arc<dyn Fn() + Send + Sync + 'static>;

/// Callback invoked on every detected overrun.
pub type TimeoutHook = Arc<dyn Fn(&WorkTimeout) + Send + Sync + 'static>;

/// Notification emitted when an invocation overruns its timeout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkTimeout {
    pub loop_name: String,
    pub iteration: u64,
    pub timeout: Duration,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub enum LoopState {
    Created,
    Running,
    Stopped,
}

/// Runtime statistics of a loop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoopStats {
    pub iterations: u64,
    pub completed: u64,
    pub timeouts: u64,
    pub panics: u64,
    pub skipped_ticks: u64,
    pub last_started_at: Option<DateTime<Utc>>,
}

/// Stop flag plus the condvar the interval wait sleeps on.
#[derive(Debug, Default)]
struct Signal {
    stop: Mutex<bool>,
    wake: Condvar,
}

impl Signal {
    fn lock(&self) -> MutexGuard<'_, bool> {
        self.stop.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reset(&self) {
        *self.lock() = false;
    }

    fn request_stop(&self) {
        *self.lock() = true;
        self.wake.notify_all();
    }

    /// Sleep until `deadline`, or until stopped when there is none.
    /// Returns `true` if a stop was requested first.
    fn wait_until(&self, deadline: Option<Instant>) -> bool {
        let mut stop = self.lock();
        loop {
            if *stop {
                return true;
            }
            stop = match deadline {
                None => self.wake.wait(stop).unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    self.wake
                        .wait_timeout(stop, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }
}

#[derive(Debug)]
struct Lifecycle {
    state: LoopState,
    join: Option<thread::JoinHandle<()>>,
}

pub struct SleepingLoop {
    name: String,
    config: LoopConfig,
    work: WorkFn,
    on_timeout: Option<TimeoutHook>,
    signal: Arc<Signal>,
    reaper: Arc<Reaper>,
    stats: Arc<Mutex<LoopStats>>,
    lifecycle: Mutex<Lifecycle>,
}

impl core::fmt::Debug for SleepingLoop {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SleepingLoop")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl SleepingLoop {
    pub fn new<F>(name: impl Into<String>, config: LoopConfig, work: F) -> DispatchResult<Self>
    where
        F: Fn() + Send + Sync + 'static,
    {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            config,
            work: Arc::new(work),
            on_timeout: None,
            signal: Arc::new(Signal::default()),
            reaper: Arc::new(Reaper::new()),
            stats: Arc::new(Mutex::new(LoopStats::default())),
            lifecycle: Mutex::new(Lifecycle {
                state: LoopState::Created,
                join: None,
            }),
        })
    }

    /// Register a callback for `work_timeout` notifications.
    pub fn with_timeout_hook<H>(mut self, hook: H) -> Self
    where
        H: Fn(&WorkTimeout) + Send + Sync + 'static,
    {
        self.on_timeout = Some(Arc::new(hook));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> LoopConfig {
        self.config
    }

    pub fn state(&self) -> LoopState {
        self.lifecycle().state
    }

    pub fn stats(&self) -> LoopStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn the loop thread. No-op while already running.
    pub fn start(&self) -> DispatchResult<()> {
        let mut lifecycle = self.lifecycle();
        if lifecycle.state == LoopState::Running {
            return Ok(());
        }

        self.signal.reset();
        let ctx = LoopContext {
            name: self.name.clone(),
            config: self.config,
            work: self.work.clone(),
            on_timeout: self.on_timeout.clone(),
            signal: self.signal.clone(),
            reaper: self.reaper.clone(),
            stats: self.stats.clone(),
        };

        let (ready_tx, ready_rx) = mpsc::channel::<()>();
        let join = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let _ = ready_tx.send(());
                ctx.run();
            })
            .map_err(|e| DispatchError::spawn(self.name.clone(), e))?;

        // Returns once the loop thread is actually up.
        let _ = ready_rx.recv();

        lifecycle.join = Some(join);
        lifecycle.state = LoopState::Running;
        Ok(())
    }

    /// Stop the loop thread and wait for it to exit. No-op unless running.
    ///
    /// An invocation in progress is waited for up to its timeout.
    pub fn stop(&self) {
        let mut lifecycle = self.lifecycle();
        if lifecycle.state != LoopState::Running {
            return;
        }

        self.signal.request_stop();
        if let Some(join) = lifecycle.join.take() {
            if join.join().is_err() {
                error!(sleeping_loop = %self.name, "loop thread panicked");
            }
        }
        self.reaper.reap();
        lifecycle.state = LoopState::Stopped;
    }
}

impl Drop for SleepingLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Everything the loop thread owns.
struct LoopContext {
    name: String,
    config: LoopConfig,
    work: WorkFn,
    on_timeout: Option<TimeoutHook>,
    signal: Arc<Signal>,
    reaper: Arc<Reaper>,
    stats: Arc<Mutex<LoopStats>>,
}

impl LoopContext {
    fn stats(&self) -> MutexGuard<'_, LoopStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run(self) {
        let interval = self.config.interval;
        info!(
            sleeping_loop = %self.name,
            interval_ms = interval.as_millis() as u64,
            timeout_ms = self.config.timeout.as_millis() as u64,
            "sleeping loop started"
        );

        // `None` once the grid runs past what `Instant` can represent.
        let mut next_tick = Instant::now().checked_add(interval);
        let mut iteration = 0u64;

        loop {
            if self.signal.wait_until(next_tick) {
                break;
            }
            next_tick = next_tick.and_then(|tick| tick.checked_add(interval));

            self.reaper.reap();
            if self.reaper.pending() > 0 {
                self.stats().skipped_ticks += 1;
                debug!(
                    sleeping_loop = %self.name,
                    "previous invocation still running, skipping tick"
                );
                continue;
            }

            iteration += 1;
            self.invoke(iteration);
            next_tick = next_tick.and_then(|tick| self.skip_overdue(tick));
        }

        info!(sleeping_loop = %self.name, iterations = iteration, "sleeping loop stopped");
    }

    fn invoke(&self, iteration: u64) {
        {
            let mut stats = self.stats();
            stats.iterations += 1;
            stats.last_started_at = Some(Utc::now());
        }

        let work = self.work.clone();
        match run_with_deadline(&self.name, self.config.timeout, move || work()) {
            Execution::Completed(()) => {
                self.stats().completed += 1;
            }
            Execution::Panicked(message) => {
                self.stats().panics += 1;
                error!(
                    sleeping_loop = %self.name,
                    iteration,
                    panic = %message,
                    "work function panicked"
                );
            }
            Execution::TimedOut(abandoned) => {
                self.stats().timeouts += 1;
                warn!(
                    sleeping_loop = %self.name,
                    iteration,
                    error_kind = "work_timeout",
                    timeout_ms = self.config.timeout.as_millis() as u64,
                    "work function exceeded its timeout"
                );
                self.reaper.adopt(abandoned);
                if let Some(hook) = &self.on_timeout {
                    hook(&WorkTimeout {
                        loop_name: self.name.clone(),
                        iteration,
                        timeout: self.config.timeout,
                    });
                }
            }
            Execution::SpawnFailed(reason) => {
                error!(
                    sleeping_loop = %self.name,
                    iteration,
                    error = %reason,
                    "failed to spawn execution thread"
                );
            }
        }
    }

    /// Move `next_tick` past any grid points that already elapsed.
    fn skip_overdue(&self, next_tick: Instant) -> Option<Instant> {
        let now = Instant::now();
        if next_tick > now {
            return Some(next_tick);
        }
        let interval = self.config.interval;
        let behind = now - next_tick;
        let missed = u32::try_from(behind.as_nanos() / interval.as_nanos())
            .unwrap_or(u32::MAX)
            .saturating_add(1);
        self.stats().skipped_ticks += u64::from(missed);
        debug!(sleeping_loop = %self.name, missed, "skipping overdue ticks");
        interval
            .checked_mul(missed)
            .and_then(|skip| next_tick.checked_add(skip))
    }
}
