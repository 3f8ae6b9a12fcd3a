//! Timer reactor for the pluvio_file runtime.
//!
//! The timer reactor keeps pending timers sorted by deadline. On each
//! `poll()` it wakes the tasks whose deadline passed. Lock backoff and mutex
//! retries sleep through [`sleep`] and [`sleep_with_cancellation`].
//!
//! # Usage
//!
//! ```ignore
//! let runtime = Runtime::new(64); // registers TimerReactor::current()
//! runtime.block_on(async {
//!     sleep(Duration::from_millis(10)).await;
//! });
//! ```

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use crate::cancel::{with_cancellation, Cancellation};
use crate::error::Result;
use crate::reactor::{Reactor, ReactorStatus};

thread_local! {
    /// Shared instance of the TimerReactor for the current thread
    static TIMER_REACTOR: Rc<TimerReactor> = Rc::new(TimerReactor::new());
}

/// Unique identifier for a timer with its deadline.
///
/// Ordering is by deadline first, so timers sharing a deadline still get
/// distinct keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerHandle {
    deadline: Instant,
    id: u64,
}

impl TimerHandle {
    fn new(deadline: Instant) -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self {
            deadline,
            id: COUNTER.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Largest possible handle at `deadline`, used as a range bound.
    fn max_at(deadline: Instant) -> Self {
        Self {
            deadline,
            id: u64::MAX,
        }
    }
}

/// Reactor that wakes tasks once their deadline passed.
///
/// Timers are checked on each `poll()`, so resolution depends on how often
/// the runtime turns. A timer never fires before its deadline.
///
/// This reactor uses `RefCell` for interior mutability and is meant for the
/// single-threaded runtime only.
#[derive(Default)]
pub struct TimerReactor {
    timers: RefCell<BTreeMap<TimerHandle, Waker>>,
    /// Mirrors `timers.len()` so `status()` does not need a borrow.
    timer_count: Cell<usize>,
}

impl TimerReactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// The thread's shared timer reactor.
    pub fn current() -> Rc<Self> {
        TIMER_REACTOR.with(|r| r.clone())
    }

    /// Register a timer that wakes `waker` at `deadline`.
    #[tracing::instrument(level = "trace", skip(self, waker))]
    pub fn register_timer(&self, deadline: Instant, waker: Waker) -> TimerHandle {
        let handle = TimerHandle::new(deadline);
        self.timers.borrow_mut().insert(handle, waker);
        self.timer_count.set(self.timer_count.get() + 1);
        handle
    }

    /// Replace the waker of a registered timer. Returns false if it already fired.
    pub fn update_waker(&self, handle: TimerHandle, waker: &Waker) -> bool {
        match self.timers.borrow_mut().get_mut(&handle) {
            Some(existing) => {
                if !existing.will_wake(waker) {
                    *existing = waker.clone();
                }
                true
            }
            None => false,
        }
    }

    /// Cancel a timer. Returns true if it was still pending.
    pub fn cancel_timer(&self, handle: TimerHandle) -> bool {
        let removed = self.timers.borrow_mut().remove(&handle).is_some();
        if removed {
            self.timer_count.set(self.timer_count.get() - 1);
        }
        removed
    }

    pub fn timer_count(&self) -> usize {
        self.timer_count.get()
    }

    fn wake_expired_timers(&self, now: Instant) -> usize {
        let expired: Vec<(TimerHandle, Waker)> = {
            let mut timers = self.timers.borrow_mut();
            match timers.first_key_value() {
                Some((first, _)) if first.deadline() <= now => {}
                _ => return 0,
            }
            let keys: Vec<TimerHandle> = timers
                .range(..=TimerHandle::max_at(now))
                .map(|(handle, _)| *handle)
                .collect();
            keys.into_iter()
                .filter_map(|handle| timers.remove(&handle).map(|waker| (handle, waker)))
                .collect()
        };

        self.timer_count
            .set(self.timer_count.get() - expired.len());
        let count = expired.len();
        // Woken outside the borrow: a woken future may register a new timer.
        for (handle, waker) in expired {
            tracing::trace!("TimerReactor: waking timer {:?}", handle);
            waker.wake();
        }
        count
    }
}

impl Reactor for TimerReactor {
    fn poll(&self) {
        let expired_count = self.wake_expired_timers(Instant::now());
        if expired_count > 0 {
            tracing::trace!("TimerReactor: woke {} expired timers", expired_count);
        }
    }

    fn status(&self) -> ReactorStatus {
        if self.timer_count.get() > 0 {
            ReactorStatus::Running
        } else {
            ReactorStatus::Stopped
        }
    }
}

/// A future that resolves once its deadline passed.
pub struct Delay {
    deadline: Instant,
    timer_handle: Option<TimerHandle>,
    reactor: Rc<TimerReactor>,
}

impl Delay {
    pub fn new(duration: Duration) -> Self {
        Self::new_at(Instant::now() + duration)
    }

    pub fn new_at(deadline: Instant) -> Self {
        Self {
            deadline,
            timer_handle: None,
            reactor: TimerReactor::current(),
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

impl Future for Delay {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if Instant::now() >= self.deadline {
            if let Some(handle) = self.timer_handle.take() {
                self.reactor.cancel_timer(handle);
            }
            return Poll::Ready(());
        }

        match self.timer_handle {
            Some(handle) if self.reactor.update_waker(handle, cx.waker()) => {}
            _ => {
                // Either first poll, or the timer fired early relative to our clock read.
                let handle = self
                    .reactor
                    .register_timer(self.deadline, cx.waker().clone());
                self.timer_handle = Some(handle);
            }
        }
        Poll::Pending
    }
}

impl Drop for Delay {
    fn drop(&mut self) {
        if let Some(handle) = self.timer_handle.take() {
            self.reactor.cancel_timer(handle);
        }
    }
}

pub fn sleep(duration: Duration) -> Delay {
    Delay::new(duration)
}

/// Sleep for `duration`, failing with [`FileError::Cancelled`](crate::FileError::Cancelled)
/// as soon as `cancellation` fires.
pub async fn sleep_with_cancellation(
    duration: Duration,
    cancellation: Option<&Cancellation>,
) -> Result<()> {
    with_cancellation(sleep(duration), cancellation).await
}
