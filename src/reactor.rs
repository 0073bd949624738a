//! Reactor interface polled by the [`Runtime`](crate::executor::Runtime).
//!
//! A reactor owns some source of events (timers, descriptor readiness) and
//! wakes the tasks waiting on it. The runtime calls [`Reactor::poll`] once per
//! loop turn for every registered reactor that reports itself as running.

use std::rc::Rc;

/// Current running state of a reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactorStatus {
    Running,
    Stopped,
}

/// Common interface for reactor implementations.
pub trait Reactor {
    /// Poll the reactor for events and wake whoever they belong to.
    fn poll(&self);
    /// Retrieve the current [`ReactorStatus`].
    fn status(&self) -> ReactorStatus;
}

impl<R: Reactor> Reactor for Rc<R> {
    fn poll(&self) {
        self.as_ref().poll();
    }

    fn status(&self) -> ReactorStatus {
        self.as_ref().status()
    }
}
