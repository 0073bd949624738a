//! Timer reactor.
//!
//! Keeps pending deadlines ordered in a `BTreeMap` and wakes every expired
//! entry when the runtime polls it. [`sleep`] and [`timeout`] are the task
//! facing API; the bridges use them for retry backoff, shutdown acknowledgement
//! polling and per-operation deadlines.

use crate::reactor::{Reactor, ReactorStatus};
use crate::select::{select, Either};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

thread_local! {
    static TIMER_REACTOR: Rc<TimerReactor> = Rc::new(TimerReactor::new());
}

/// Orders timers by deadline, with a per-reactor sequence number to tell
/// apart timers sharing the same deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerHandle {
    deadline: Instant,
    id: u64,
}

impl TimerHandle {
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Largest possible handle at `deadline`, for range queries.
    fn max_at(deadline: Instant) -> Self {
        Self {
            deadline,
            id: u64::MAX,
        }
    }
}

/// Single-threaded timer reactor.
///
/// Timers never fire before their deadline; how late they fire depends on how
/// often the runtime gets around to polling.
#[derive(Default)]
pub struct TimerReactor {
    timers: RefCell<BTreeMap<TimerHandle, Waker>>,
    next_id: Cell<u64>,
}

impl TimerReactor {
    #[tracing::instrument(level = "trace")]
    pub fn new() -> Self {
        Self::default()
    }

    /// The timer reactor of the current thread.
    pub fn current() -> Rc<Self> {
        TIMER_REACTOR.with(|r| r.clone())
    }

    /// Register a timer that will wake `waker` at `deadline`.
    #[tracing::instrument(level = "trace", skip(self, waker))]
    pub fn register_timer(&self, deadline: Instant, waker: Waker) -> TimerHandle {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        let handle = TimerHandle { deadline, id };
        self.timers.borrow_mut().insert(handle, waker);
        handle
    }

    /// Returns true if the timer was still pending.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn cancel_timer(&self, handle: TimerHandle) -> bool {
        self.timers.borrow_mut().remove(&handle).is_some()
    }

    pub fn timer_count(&self) -> usize {
        self.timers.borrow().len()
    }

    fn wake_expired_timers(&self, now: Instant) -> usize {
        // Wakers run after the borrow ends; waking may re-register.
        let expired: Vec<Waker> = {
            let mut timers = self.timers.borrow_mut();
            match timers.first_key_value() {
                Some((first, _)) if first.deadline <= now => {}
                _ => return 0,
            }
            let mut later = timers.split_off(&TimerHandle::max_at(now));
            std::mem::swap(&mut *timers, &mut later);
            later.into_values().collect()
        };

        let count = expired.len();
        for waker in expired {
            waker.wake();
        }
        count
    }
}

impl Reactor for TimerReactor {
    fn poll(&self) {
        let woken = self.wake_expired_timers(Instant::now());
        if woken > 0 {
            tracing::trace!("TimerReactor: woke {} expired timers", woken);
        }
    }

    fn status(&self) -> ReactorStatus {
        if self.timers.borrow().is_empty() {
            ReactorStatus::Stopped
        } else {
            ReactorStatus::Running
        }
    }
}

/// A future that resolves once its deadline has passed.
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

        // Re-register on every poll so the latest waker is the one woken.
        if let Some(handle) = self.timer_handle.take() {
            self.reactor.cancel_timer(handle);
        }
        let handle = self.reactor.register_timer(self.deadline, cx.waker().clone());
        self.timer_handle = Some(handle);

        Poll::Pending
    }
}

impl Drop for Delay {
    fn drop(&mut self) {
        if let Some(handle) = self.timer_handle {
            self.reactor.cancel_timer(handle);
        }
    }
}

/// Suspend the current task for `duration`.
///
/// A zero duration completes on the first poll without yielding; use
/// `futures_lite::future::yield_now` to give other tasks a turn.
pub fn sleep(duration: Duration) -> Delay {
    Delay::new(duration)
}

/// Error returned by [`timeout`] when the deadline passes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("deadline elapsed")]
pub struct Elapsed;

/// Run `future` with a deadline of `duration`.
///
/// On expiry the future is dropped and `Err(Elapsed)` is returned.
pub async fn timeout<F>(duration: Duration, future: F) -> Result<F::Output, Elapsed>
where
    F: Future + Unpin,
{
    match select(future, sleep(duration)).await {
        Either::Left(output) => Ok(output),
        Either::Right(()) => Err(Elapsed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[test]
    fn register_and_cancel() {
        let reactor = TimerReactor::new();
        assert_eq!(reactor.status(), ReactorStatus::Stopped);

        let deadline = Instant::now() + Duration::from_millis(100);
        let handle = reactor.register_timer(deadline, futures::task::noop_waker());
        assert_eq!(reactor.timer_count(), 1);
        assert_eq!(reactor.status(), ReactorStatus::Running);

        assert!(reactor.cancel_timer(handle));
        assert!(!reactor.cancel_timer(handle));
        assert_eq!(reactor.status(), ReactorStatus::Stopped);
    }

    #[test]
    fn only_expired_timers_fire() {
        let reactor = TimerReactor::new();
        let now = Instant::now();
        reactor.register_timer(now - Duration::from_millis(5), futures::task::noop_waker());
        reactor.register_timer(now - Duration::from_millis(5), futures::task::noop_waker());
        reactor.register_timer(now + Duration::from_secs(60), futures::task::noop_waker());

        reactor.poll();
        assert_eq!(reactor.timer_count(), 1);
    }

    #[test]
    fn handles_with_same_deadline_differ() {
        let reactor = TimerReactor::new();
        let at = Instant::now() + Duration::from_secs(1);
        let a = reactor.register_timer(at, futures::task::noop_waker());
        let b = reactor.register_timer(at, futures::task::noop_waker());
        assert_ne!(a, b);
        assert!(a < b);
    }

    #[test]
    fn dropped_delay_cancels_its_timer() {
        let reactor = TimerReactor::current();
        let before = reactor.timer_count();
        let mut delay = sleep(Duration::from_secs(30));
        assert!((&mut delay).now_or_never().is_none());
        assert_eq!(reactor.timer_count(), before + 1);
        drop(delay);
        assert_eq!(reactor.timer_count(), before);
    }

    #[test]
    fn zero_sleep_is_immediately_ready() {
        assert_eq!(sleep(Duration::ZERO).now_or_never(), Some(()));
    }

    #[test]
    fn timeout_reports_elapsed() {
        let runtime = crate::executor::Runtime::new(8);
        let out = runtime.run(async {
            let slow = timeout(
                Duration::from_millis(5),
                Box::pin(futures::future::pending::<()>()),
            )
            .await;
            let fast = timeout(Duration::from_secs(5), Box::pin(async { 3 })).await;
            (slow, fast)
        });
        assert_eq!(out, Ok((Err(Elapsed), Ok(3))));
    }
}
