//! Deadline-guarded execution.
//!
//! Native threads cannot be killed safely, so a timeout here is **report-only**:
//! the work runs on a helper thread, the caller waits up to the deadline, and
//! on expiry the caller stops waiting and gets the helper back as an
//! [`Abandoned`] handle. The helper keeps running until the work returns on its
//! own. Abandoned handles are parked in a [`Reaper`], which joins them once they
//! finish so no thread handle leaks.
//!
//! Anything a timed-out work function touches may still be mutated after its
//! deadline; callers protect shared state with their own synchronization.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use switchyard_core::Status;

/// Outcome of one guarded invocation.
#[derive(Debug)]
pub enum Execution<R> {
    /// The work returned before its deadline.
    Completed(R),
    /// The work panicked; the payload message is kept for logging.
    Panicked(String),
    /// The deadline passed first. The helper thread may still be running.
    TimedOut(Abandoned),
    /// The helper thread could not be spawned, so the work never ran.
    SpawnFailed(String),
}

impl<R> Execution<R> {
    pub fn status(&self) -> Status {
        match self {
            Execution::Completed(_) => Status::Ok,
            Execution::Panicked(_) => Status::Panicked,
            Execution::TimedOut(_) => Status::WorkTimeout,
            Execution::SpawnFailed(_) => Status::Stopped,
        }
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, Execution::TimedOut(_))
    }
}

/// A helper thread whose deadline passed while it was still running.
#[derive(Debug)]
pub struct Abandoned {
    label: String,
    started: Instant,
    handle: thread::JoinHandle<()>,
}

impl Abandoned {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    fn join(self) {
        // The helper catches panics itself, so a join error is not expected.
        let _ = self.handle.join();
    }
}

/// Run `work` on the calling thread, catching panics. No deadline.
pub fn run_inline<R, F>(work: F) -> Execution<R>
where
    F: FnOnce() -> R,
{
    match panic::catch_unwind(AssertUnwindSafe(work)) {
        Ok(value) => Execution::Completed(value),
        Err(payload) => Execution::Panicked(panic_message(payload.as_ref())),
    }
}

/// Run `work` on a helper thread and wait at most `timeout` for it.
pub fn run_with_deadline<R, F>(label: &str, timeout: Duration, work: F) -> Execution<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel(1);
    let started = Instant::now();

    let spawned = thread::Builder::new()
        .name(format!("{label}-exec"))
        .spawn(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(work));
            // The receiver is gone when the caller already gave up on us.
            let _ = tx.send(outcome);
        });

    let handle = match spawned {
        Ok(handle) => handle,
        Err(err) => return Execution::SpawnFailed(err.to_string()),
    };

    match rx.recv_timeout(timeout) {
        Ok(Ok(value)) => {
            let _ = handle.join();
            Execution::Completed(value)
        }
        Ok(Err(payload)) => {
            let _ = handle.join();
            Execution::Panicked(panic_message(payload.as_ref()))
        }
        Err(mpsc::RecvTimeoutError::Timeout) => Execution::TimedOut(Abandoned {
            label: label.to_string(),
            started,
            handle,
        }),
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            let _ = handle.join();
            Execution::Panicked("execution thread exited without a result".to_string())
        }
    }
}

/// `run_with_deadline` when a timeout is configured, `run_inline` otherwise.
pub fn run_guarded<R, F>(label: &str, timeout: Option<Duration>, work: F) -> Execution<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    match timeout {
        Some(timeout) => run_with_deadline(label, timeout, work),
        None => run_inline(work),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Owner of abandoned helper threads.
///
/// Joins them once they finish. Whatever is still running when the reaper is
/// dropped is detached and logged.
#[derive(Debug, Default)]
pub struct Reaper {
    pending: Mutex<Vec<Abandoned>>,
    reaped: AtomicU64,
}

impl Reaper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn adopt(&self, abandoned: Abandoned) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(abandoned);
    }

    /// Join every adopted thread that has finished. Returns how many were joined.
    pub fn reap(&self) -> usize {
        let finished: Vec<Abandoned> = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            let (finished, running): (Vec<_>, Vec<_>) =
                pending.drain(..).partition(Abandoned::is_finished);
            *pending = running;
            finished
        };

        let count = finished.len();
        for abandoned in finished {
            debug!(
                execution = %abandoned.label(),
                elapsed_ms = abandoned.elapsed().as_millis() as u64,
                "reaped abandoned execution"
            );
            abandoned.join();
        }
        self.reaped.fetch_add(count as u64, Ordering::Relaxed);
        count
    }

    /// Adopted threads not yet joined.
    pub fn pending(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn reaped(&self) -> u64 {
        self.reaped.load(Ordering::Relaxed)
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.reap();
        let still_running = self.pending();
        if still_running > 0 {
            warn!(
                count = still_running,
                "detaching abandoned executions that are still running"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completes_within_deadline() {
        let outcome = run_with_deadline("quick", Duration::from_millis(500), || 21 * 2);
        assert!(matches!(outcome, Execution::Completed(42)));
        assert_eq!(outcome.status(), Status::Ok);
    }

    #[test]
    fn overrun_is_reported_and_abandoned() {
        let started = Instant::now();
        let outcome = run_with_deadline("slow", Duration::from_millis(20), || {
            thread::sleep(Duration::from_millis(150));
        });
        assert!(started.elapsed() < Duration::from_millis(120));
        assert_eq!(outcome.status(), Status::WorkTimeout);

        let Execution::TimedOut(abandoned) = outcome else {
            panic!("expected a timeout");
        };
        assert!(!abandoned.is_finished());

        let reaper = Reaper::new();
        reaper.adopt(abandoned);
        assert_eq!(reaper.reap(), 0);
        assert_eq!(reaper.pending(), 1);

        thread::sleep(Duration::from_millis(200));
        assert_eq!(reaper.reap(), 1);
        assert_eq!(reaper.pending(), 0);
        assert_eq!(reaper.reaped(), 1);
    }

    #[test]
    fn panic_is_caught_with_message() {
        let outcome: Execution<()> =
            run_with_deadline("boom", Duration::from_millis(500), || panic!("kaboom"));
        assert!(matches!(outcome, Execution::Panicked(ref m) if m == "kaboom"));
        assert_eq!(outcome.status(), Status::Panicked);
        assert!(outcome.status().is_failure());

        let outcome: Execution<()> = run_inline(|| panic!("inline {}", 7));
        assert!(matches!(outcome, Execution::Panicked(ref m) if m == "inline 7"));
    }

    #[test]
    fn guarded_without_timeout_runs_inline() {
        let caller = thread::current().id();
        let outcome = run_guarded("inline", None, move || thread::current().id() == caller);
        assert!(matches!(outcome, Execution::Completed(true)));
    }
}
