//! Task-level synchronization primitives.
//!
//! [`Condvar`] parks any number of tasks until the next broadcast. An
//! [`Interrupt`] lets one task kick another out of whatever it is blocked on,
//! which is how the bridges get their reactor fibers to re-examine state.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use slab::Slab;

/// Broadcast-only condition variable for tasks on one runtime.
///
/// A waiter is released by the first [`notify_all`](Condvar::notify_all)
/// issued after it registered; broadcasts nobody is waiting for are lost.
#[derive(Default)]
pub struct Condvar {
    generation: Cell<u64>,
    waiters: RefCell<Slab<Waker>>,
}

impl Condvar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the next broadcast.
    pub fn wait(&self) -> CondWait<'_> {
        CondWait {
            cond: self,
            registration: None,
        }
    }

    /// Wake every task currently waiting.
    pub fn notify_all(&self) {
        self.generation.set(self.generation.get().wrapping_add(1));
        let wakers: Vec<Waker> = self.waiters.borrow_mut().drain().collect();
        if !wakers.is_empty() {
            tracing::trace!(waiters = wakers.len(), "condvar broadcast");
        }
        for waker in wakers {
            waker.wake();
        }
    }

    pub fn waiters(&self) -> usize {
        self.waiters.borrow().len()
    }
}

/// Future returned by [`Condvar::wait`].
pub struct CondWait<'a> {
    cond: &'a Condvar,
    registration: Option<(u64, usize)>,
}

impl Future for CondWait<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let cond = self.cond;
        match self.registration {
            Some((generation, _)) if generation != cond.generation.get() => {
                self.registration = None;
                Poll::Ready(())
            }
            Some((_, key)) => {
                if let Some(waker) = cond.waiters.borrow_mut().get_mut(key) {
                    if !waker.will_wake(cx.waker()) {
                        *waker = cx.waker().clone();
                    }
                }
                Poll::Pending
            }
            None => {
                let key = cond.waiters.borrow_mut().insert(cx.waker().clone());
                self.registration = Some((cond.generation.get(), key));
                Poll::Pending
            }
        }
    }
}

impl Drop for CondWait<'_> {
    fn drop(&mut self) {
        if let Some((generation, key)) = self.registration.take() {
            if generation == self.cond.generation.get() {
                self.cond.waiters.borrow_mut().try_remove(key);
            }
        }
    }
}

/// Returned by [`Interrupt::interruptible`] when the wait was interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("interrupted")]
pub struct Interrupted;

#[derive(Default)]
struct InterruptState {
    pending: Cell<bool>,
    waker: RefCell<Option<Waker>>,
}

/// Interruption channel aimed at one task.
///
/// An interrupt delivered while the target is not blocked stays pending and
/// cuts short its next blocking wait.
#[derive(Clone, Default)]
pub struct Interrupt {
    state: Rc<InterruptState>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interrupt the target's current or next wait.
    pub fn interrupt(&self) {
        self.state.pending.set(true);
        let waker = self.state.waker.borrow_mut().take();
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state.pending.get()
    }

    /// Sleep until interrupted.
    pub fn park(&self) -> Park<'_> {
        Park { interrupt: self }
    }

    /// Run `future` until it completes or the task is interrupted.
    pub fn interruptible<F>(&self, future: F) -> Interruptible<'_, F>
    where
        F: Future + Unpin,
    {
        Interruptible {
            interrupt: self,
            future,
        }
    }

    fn take_pending(&self, cx: &Context<'_>) -> bool {
        if self.state.pending.replace(false) {
            self.state.waker.borrow_mut().take();
            return true;
        }
        *self.state.waker.borrow_mut() = Some(cx.waker().clone());
        false
    }
}

/// Future returned by [`Interrupt::park`].
pub struct Park<'a> {
    interrupt: &'a Interrupt,
}

impl Future for Park<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.interrupt.take_pending(cx) {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

/// Future returned by [`Interrupt::interruptible`].
pub struct Interruptible<'a, F> {
    interrupt: &'a Interrupt,
    future: F,
}

impl<F> Future for Interruptible<'_, F>
where
    F: Future + Unpin,
{
    type Output = Result<F::Output, Interrupted>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.interrupt.take_pending(cx) {
            return Poll::Ready(Err(Interrupted));
        }
        if let Poll::Ready(out) = Pin::new(&mut self.future).poll(cx) {
            self.interrupt.state.waker.borrow_mut().take();
            return Poll::Ready(Ok(out));
        }
        Poll::Pending
    }
}
