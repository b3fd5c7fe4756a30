//! Fixed-capacity, thread-safe FIFO with blocking backpressure.
//!
//! [`BoundedQueue`] is the only queue primitive in the workspace. The variants
//! that tend to show up next to a blocking queue are expressed as configuration
//! of this one type:
//!
//! - **Blocking bounded queue** (default): `push` blocks while full, `pop`
//!   blocks while empty.
//! - **Ring buffer**: [`OverflowPolicy::DropOldest`] evicts the head instead of
//!   blocking the producer.
//! - **Non-blocking queue**: [`BoundedQueue::try_push`] / [`BoundedQueue::try_pop`].
//!
//! ## Completion tracking
//!
//! Every accepted item counts as *unfinished* until a consumer calls
//! [`BoundedQueue::task_done`] for it (or it is evicted or drained).
//! [`BoundedQueue::wait_done`] blocks until that count reaches zero, which is
//! how a pool tells "queue empty" apart from "queue empty and nothing in
//! flight".
//!
//! ## Shutdown
//!
//! [`BoundedQueue::close`] wakes every blocked producer and consumer. After
//! closing, pushes fail with [`PushError::Closed`] (handing the item back) and
//! pops keep returning queued items until the queue is empty.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

use switchyard_core::OverflowPolicy;

/// A rejected push. The item is handed back to the caller.
#[derive(PartialEq, Eq)]
pub enum PushError<T> {
    /// The queue was full and the push was non-blocking.
    Full(T),
    /// The queue was closed.
    Closed(T),
}

impl<T> PushError<T> {
    pub fn into_inner(self) -> T {
        match self {
            PushError::Full(item) | PushError::Closed(item) => item,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, PushError::Closed(_))
    }
}

impl<T> core::fmt::Debug for PushError<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            PushError::Full(_) => f.write_str("Full(..)"),
            PushError::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}

impl<T> core::fmt::Display for PushError<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            PushError::Full(_) => f.write_str("queue is full"),
            PushError::Closed(_) => f.write_str("queue is closed"),
        }
    }
}

impl<T> std::error::Error for PushError<T> {}

/// A pop that returned without an item.
#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
pub enum PopError {
    #[error("timed out waiting for an item")]
    Timeout,
    #[error("queue is closed")]
    Closed,
}

#[derive(Debug)]
struct State<T> {
    items: VecDeque<T>,
    closed: bool,
    dropped: u64,
    unfinished: usize,
}

#[derive(Debug)]
pub struct BoundedQueue<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    all_done: Condvar,
    capacity: usize,
    policy: OverflowPolicy,
}

impl<T> BoundedQueue<T> {
    /// Blocking queue. A capacity of 0 is clamped to 1.
    pub fn new(capacity: usize) -> Self {
        Self::with_policy(capacity, OverflowPolicy::Block)
    }

    pub fn with_policy(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity),
                closed: false,
                dropped: 0,
                unfinished: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            all_done: Condvar::new(),
            capacity,
            policy,
        }
    }

    // No code path panics while holding the lock, so a poisoned guard still
    // protects a consistent `State`.
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert at the tail, blocking while the queue is full.
    ///
    /// Under [`OverflowPolicy::DropOldest`] this never blocks: the head is
    /// evicted instead.
    pub fn push(&self, item: T) -> Result<(), PushError<T>> {
        let mut state = self.lock();
        loop {
            if state.closed {
                return Err(PushError::Closed(item));
            }
            if state.items.len() < self.capacity {
                break;
            }
            match self.policy {
                OverflowPolicy::Block => {
                    state = self
                        .not_full
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                OverflowPolicy::DropOldest => {
                    self.evict_head(&mut state);
                    break;
                }
            }
        }
        state.items.push_back(item);
        state.unfinished += 1;
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Insert at the tail without blocking.
    pub fn try_push(&self, item: T) -> Result<(), PushError<T>> {
        let mut state = self.lock();
        if state.closed {
            return Err(PushError::Closed(item));
        }
        if state.items.len() >= self.capacity {
            match self.policy {
                OverflowPolicy::Block => return Err(PushError::Full(item)),
                OverflowPolicy::DropOldest => self.evict_head(&mut state),
            }
        }
        state.items.push_back(item);
        state.unfinished += 1;
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    fn evict_head(&self, state: &mut State<T>) {
        if state.items.pop_front().is_some() {
            state.dropped += 1;
            state.unfinished = state.unfinished.saturating_sub(1);
            debug!(
                capacity = self.capacity,
                dropped = state.dropped,
                "queue full, evicted oldest item"
            );
        }
    }

    /// Remove from the head, blocking while the queue is empty.
    ///
    /// Returns `None` once the queue is closed and fully drained.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Some(item);
            }
            if state.closed {
                return None;
            }
            state = self
                .not_empty
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`pop`](Self::pop), but gives up after `timeout`.
    ///
    /// A `timeout` too large to represent as a deadline waits without one.
    pub fn try_pop(&self, timeout: Duration) -> Result<T, PopError> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Ok(item);
            }
            if state.closed {
                return Err(PopError::Closed);
            }
            state = match deadline {
                None => self
                    .not_empty
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(PopError::Timeout);
                    }
                    self.not_empty
                        .wait_timeout(state, remaining)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    /// Reject further pushes and wake every blocked thread.
    ///
    /// Returns `false` if the queue was already closed.
    pub fn close(&self) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        state.closed = true;
        drop(state);
        self.not_empty.notify_all();
        self.not_full.notify_all();
        true
    }

    /// Remove and return everything currently queued.
    ///
    /// Drained items no longer count as unfinished.
    pub fn drain(&self) -> Vec<T> {
        let mut state = self.lock();
        let items: Vec<T> = state.items.drain(..).collect();
        state.unfinished = state.unfinished.saturating_sub(items.len());
        let done = state.unfinished == 0;
        drop(state);
        self.not_full.notify_all();
        if done {
            self.all_done.notify_all();
        }
        items
    }

    /// Mark one previously popped item as fully processed.
    pub fn task_done(&self) {
        let mut state = self.lock();
        state.unfinished = state.unfinished.saturating_sub(1);
        let done = state.unfinished == 0;
        drop(state);
        if done {
            self.all_done.notify_all();
        }
    }

    /// Items accepted but not yet marked done (queued plus in flight).
    pub fn unfinished(&self) -> usize {
        self.lock().unfinished
    }

    /// Block until every accepted item has been marked done.
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub fn wait_done(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.lock();
        loop {
            if state.unfinished == 0 {
                return true;
            }
            state = match deadline {
                None => self
                    .all_done
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return false;
                    }
                    self.all_done
                        .wait_timeout(state, remaining)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Items evicted by the ring-buffer policy so far.
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    use super::*;

    #[test]
    fn push_beyond_capacity_blocks_until_pop() {
        let q = Arc::new(BoundedQueue::new(2));
        q.push(1).unwrap();
        q.push(2).unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let producer = {
            let q = q.clone();
            let done = done.clone();
            thread::spawn(move || {
                q.push(3).unwrap();
                done.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert!(!done.load(Ordering::SeqCst), "third push must block");
        assert_eq!(q.len(), 2);

        assert_eq!(q.pop(), Some(1));
        producer.join().unwrap();
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
    }

    #[test]
    fn pop_blocks_until_push() {
        let q = Arc::new(BoundedQueue::new(1));
        let consumer = {
            let q = q.clone();
            thread::spawn(move || q.pop())
        };
        thread::sleep(Duration::from_millis(50));
        q.push("hello").unwrap();
        assert_eq!(consumer.join().unwrap(), Some("hello"));
    }

    #[test]
    fn try_pop_times_out_on_empty_queue() {
        let q: BoundedQueue<u8> = BoundedQueue::new(4);
        let started = Instant::now();
        assert_eq!(q.try_pop(Duration::from_millis(30)), Err(PopError::Timeout));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn try_push_reports_full_and_returns_item() {
        let q = BoundedQueue::new(1);
        q.try_push(1).unwrap();
        let err = q.try_push(2).unwrap_err();
        assert!(!err.is_closed());
        assert_eq!(err.into_inner(), 2);
    }

    #[test]
    fn drop_oldest_evicts_head_instead_of_blocking() {
        let q = BoundedQueue::with_policy(3, OverflowPolicy::DropOldest);
        for i in 0..5 {
            q.push(i).unwrap();
        }
        assert_eq!(q.len(), 3);
        assert_eq!(q.dropped(), 2);
        assert_eq!(q.drain(), vec![2, 3, 4]);
    }

    #[test]
    fn close_unblocks_producer_and_hands_item_back() {
        let q = Arc::new(BoundedQueue::new(1));
        q.push(1).unwrap();
        let producer = {
            let q = q.clone();
            thread::spawn(move || q.push(2))
        };
        thread::sleep(Duration::from_millis(50));
        assert!(q.close());
        assert!(!q.close());

        let err = producer.join().unwrap().unwrap_err();
        assert!(err.is_closed());
        assert_eq!(err.into_inner(), 2);
    }

    #[test]
    fn closed_queue_still_yields_pending_items() {
        let q = BoundedQueue::new(4);
        q.push('a').unwrap();
        q.push('b').unwrap();
        q.close();

        assert_eq!(q.pop(), Some('a'));
        assert_eq!(q.try_pop(Duration::from_millis(1)), Ok('b'));
        assert_eq!(q.pop(), None);
        assert_eq!(q.try_pop(Duration::from_millis(1)), Err(PopError::Closed));
    }

    #[test]
    fn close_wakes_blocked_consumer() {
        let q: Arc<BoundedQueue<u32>> = Arc::new(BoundedQueue::new(1));
        let consumer = {
            let q = q.clone();
            thread::spawn(move || q.pop())
        };
        thread::sleep(Duration::from_millis(50));
        q.close();
        assert_eq!(consumer.join().unwrap(), None);
    }

    #[test]
    fn wait_done_tracks_items_in_flight() {
        let q = Arc::new(BoundedQueue::new(4));
        q.push(1).unwrap();
        q.push(2).unwrap();
        assert_eq!(q.unfinished(), 2);

        assert_eq!(q.pop(), Some(1));
        q.task_done();
        assert_eq!(q.pop(), Some(2));
        // Popped but not done: the queue is empty yet work is outstanding.
        assert!(q.is_empty());
        assert!(!q.wait_done(Duration::from_millis(20)));

        let waiter = {
            let q = q.clone();
            thread::spawn(move || q.wait_done(Duration::from_secs(2)))
        };
        thread::sleep(Duration::from_millis(20));
        q.task_done();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn unrepresentable_timeouts_wait_without_deadline() {
        let q = Arc::new(BoundedQueue::new(2));
        q.push(1).unwrap();
        assert_eq!(q.try_pop(Duration::MAX), Ok(1));

        let consumer = {
            let q = q.clone();
            thread::spawn(move || q.try_pop(Duration::MAX))
        };
        thread::sleep(Duration::from_millis(20));
        q.push(2).unwrap();
        assert_eq!(consumer.join().unwrap(), Ok(2));

        let waiter = {
            let q = q.clone();
            thread::spawn(move || q.wait_done(Duration::MAX))
        };
        thread::sleep(Duration::from_millis(20));
        q.task_done();
        q.task_done();
        assert!(waiter.join().unwrap());
        assert!(q.wait_done(Duration::MAX));
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let q: BoundedQueue<()> = BoundedQueue::new(0);
        assert_eq!(q.capacity(), 1);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 256,
                ..ProptestConfig::default()
            })]

            /// Property: the first `capacity` non-blocking pushes always succeed
            /// and the next one is rejected as full.
            #[test]
            fn capacity_pushes_fit_and_one_more_does_not(capacity in 1usize..64) {
                let q = BoundedQueue::new(capacity);
                for i in 0..capacity {
                    prop_assert!(q.try_push(i).is_ok());
                }
                prop_assert_eq!(q.len(), capacity);
                let rejected = q.try_push(capacity);
                prop_assert!(matches!(rejected, Err(PushError::Full(_))));
                prop_assert_eq!(q.len(), capacity);
            }

            /// Property: interleaved pushes and pops preserve FIFO order and
            /// never exceed capacity.
            #[test]
            fn fifo_order_and_bound_hold(
                capacity in 1usize..16,
                ops in proptest::collection::vec(any::<bool>(), 1..200),
            ) {
                let q = BoundedQueue::new(capacity);
                let mut model = std::collections::VecDeque::new();
                let mut next = 0u32;

                for push in ops {
                    if push {
                        let accepted = q.try_push(next).is_ok();
                        prop_assert_eq!(accepted, model.len() < capacity);
                        if accepted {
                            model.push_back(next);
                        }
                        next += 1;
                    } else {
                        let got = q.try_pop(Duration::ZERO).ok();
                        prop_assert_eq!(got, model.pop_front());
                    }
                    prop_assert!(q.len() <= capacity);
                }
            }

            /// Property: a ring buffer keeps exactly the newest `capacity` items.
            #[test]
            fn ring_buffer_keeps_newest(capacity in 1usize..16, count in 0usize..100) {
                let q = BoundedQueue::with_policy(capacity, OverflowPolicy::DropOldest);
                for i in 0..count {
                    q.push(i).unwrap();
                }
                let kept = q.drain();
                let expected: Vec<usize> = (count.saturating_sub(capacity)..count).collect();
                prop_assert_eq!(kept, expected);
                prop_assert_eq!(q.dropped(), count.saturating_sub(capacity) as u64);
            }
        }
    }
}
