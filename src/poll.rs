//! Descriptor readiness reactor.
//!
//! Tasks register interest in a raw descriptor with [`wait_ready`] and are
//! woken when `poll(2)` reports it ready. The runtime polls with a zero
//! timeout once per loop turn, so a registration never blocks the thread.

use std::cell::RefCell;
use std::future::Future;
use std::io;
use std::os::fd::RawFd;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use bitflags::bitflags;
use slab::Slab;

use crate::reactor::{Reactor, ReactorStatus};

thread_local! {
    static POLL_REACTOR: Rc<PollReactor> = Rc::new(PollReactor::default());
}

bitflags! {
    /// Readiness a task waits for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Interest: i16 {
        const READABLE = libc::POLLIN;
        const WRITABLE = libc::POLLOUT;
    }
}

bitflags! {
    /// Readiness reported for a descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Ready: u8 {
        const READABLE = 0b0001;
        const WRITABLE = 0b0010;
        const HANGUP = 0b0100;
        const ERROR = 0b1000;
    }
}

impl Ready {
    fn from_revents(revents: i16) -> Self {
        let mut ready = Ready::empty();
        if revents & (libc::POLLIN | libc::POLLPRI) != 0 {
            ready |= Ready::READABLE;
        }
        if revents & libc::POLLOUT != 0 {
            ready |= Ready::WRITABLE;
        }
        if revents & (libc::POLLHUP | libc::POLLRDHUP) != 0 {
            ready |= Ready::HANGUP;
        }
        if revents & libc::POLLERR != 0 {
            ready |= Ready::ERROR;
        }
        ready
    }
}

struct Registration {
    fd: RawFd,
    interest: Interest,
    waker: Waker,
    result: Option<io::Result<Ready>>,
}

/// Per-thread `poll(2)` reactor.
#[derive(Default)]
pub struct PollReactor {
    registrations: RefCell<Slab<Registration>>,
}

impl PollReactor {
    /// The readiness reactor of the current thread.
    pub fn current() -> Rc<Self> {
        POLL_REACTOR.with(|r| r.clone())
    }

    /// Number of registrations still waiting for an event.
    pub fn pending(&self) -> usize {
        self.registrations
            .borrow()
            .iter()
            .filter(|(_, reg)| reg.result.is_none())
            .count()
    }

    fn register(&self, fd: RawFd, interest: Interest, waker: Waker) -> usize {
        self.registrations.borrow_mut().insert(Registration {
            fd,
            interest,
            waker,
            result: None,
        })
    }

    fn deregister(&self, key: usize) {
        self.registrations.borrow_mut().try_remove(key);
    }

    fn poll_registration(&self, key: usize, waker: &Waker) -> Poll<io::Result<Ready>> {
        let mut regs = self.registrations.borrow_mut();
        let Some(reg) = regs.get_mut(key) else {
            return Poll::Ready(Err(io::Error::from_raw_os_error(libc::EBADF)));
        };
        if let Some(result) = reg.result.take() {
            regs.remove(key);
            return Poll::Ready(result);
        }
        if !reg.waker.will_wake(waker) {
            reg.waker = waker.clone();
        }
        Poll::Pending
    }

    #[tracing::instrument(level = "trace", skip(self))]
    fn poll_descriptors(&self) {
        let (keys, mut fds): (Vec<usize>, Vec<libc::pollfd>) = self
            .registrations
            .borrow()
            .iter()
            .filter(|(_, reg)| reg.result.is_none())
            .map(|(key, reg)| {
                (
                    key,
                    libc::pollfd {
                        fd: reg.fd,
                        events: reg.interest.bits() | libc::POLLRDHUP,
                        revents: 0,
                    },
                )
            })
            .unzip();
        if fds.is_empty() {
            return;
        }

        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, 0) };
        let mut to_wake = Vec::new();
        {
            let mut regs = self.registrations.borrow_mut();
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    return;
                }
                tracing::warn!("poll failed: {}", err);
                for key in keys {
                    if let Some(reg) = regs.get_mut(key) {
                        reg.result = Some(Err(io::Error::from(err.kind())));
                        to_wake.push(reg.waker.clone());
                    }
                }
            } else if rc > 0 {
                for (key, pfd) in keys.into_iter().zip(fds.iter()) {
                    if pfd.revents == 0 {
                        continue;
                    }
                    let Some(reg) = regs.get_mut(key) else {
                        continue;
                    };
                    reg.result = Some(if pfd.revents & libc::POLLNVAL != 0 {
                        Err(io::Error::from_raw_os_error(libc::EBADF))
                    } else {
                        Ok(Ready::from_revents(pfd.revents))
                    });
                    to_wake.push(reg.waker.clone());
                }
            }
        }

        for waker in to_wake {
            waker.wake();
        }
    }
}

impl Reactor for PollReactor {
    fn poll(&self) {
        self.poll_descriptors();
    }

    fn status(&self) -> ReactorStatus {
        if self.registrations.borrow().is_empty() {
            ReactorStatus::Stopped
        } else {
            ReactorStatus::Running
        }
    }
}

/// Future returned by [`wait_ready`].
pub struct WaitReady {
    reactor: Rc<PollReactor>,
    fd: RawFd,
    interest: Interest,
    key: Option<usize>,
}

impl Future for WaitReady {
    type Output = io::Result<Ready>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.fd < 0 {
            return Poll::Ready(Err(io::Error::from_raw_os_error(libc::EBADF)));
        }
        match self.key {
            None => {
                let key = self
                    .reactor
                    .register(self.fd, self.interest, cx.waker().clone());
                self.key = Some(key);
                Poll::Pending
            }
            Some(key) => {
                let out = self.reactor.poll_registration(key, cx.waker());
                if out.is_ready() {
                    self.key = None;
                }
                out
            }
        }
    }
}

impl Drop for WaitReady {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.reactor.deregister(key);
        }
    }
}

/// Suspend the current task until `fd` is ready for `interest`.
///
/// Hang-up and error conditions complete the wait as well and are reported in
/// the returned [`Ready`]. An invalid descriptor yields `EBADF`.
pub fn wait_ready(fd: RawFd, interest: Interest) -> WaitReady {
    WaitReady {
        reactor: PollReactor::current(),
        fd,
        interest,
        key: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::EventFd;
    use std::os::fd::AsRawFd;

    fn poll_once(fut: &mut WaitReady) -> Poll<io::Result<Ready>> {
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        Pin::new(fut).poll(&mut cx)
    }

    #[test]
    fn eventfd_becomes_readable() {
        let efd = EventFd::new().unwrap();
        let reactor = PollReactor::current();
        let mut wait = wait_ready(efd.as_raw_fd(), Interest::READABLE);

        assert!(poll_once(&mut wait).is_pending());
        reactor.poll();
        assert!(poll_once(&mut wait).is_pending());

        efd.write(1).unwrap();
        reactor.poll();
        match poll_once(&mut wait) {
            Poll::Ready(Ok(ready)) => assert!(ready.contains(Ready::READABLE)),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(reactor.pending(), 0);
    }

    #[test]
    fn dropped_wait_deregisters() {
        let efd = EventFd::new().unwrap();
        let reactor = PollReactor::current();
        let before = reactor.registrations.borrow().len();
        let mut wait = wait_ready(efd.as_raw_fd(), Interest::READABLE);
        assert!(poll_once(&mut wait).is_pending());
        assert_eq!(reactor.registrations.borrow().len(), before + 1);
        drop(wait);
        assert_eq!(reactor.registrations.borrow().len(), before);
    }

    #[test]
    fn closed_descriptor_reports_ebadf() {
        let reactor = PollReactor::current();
        let mut wait = wait_ready(60_000, Interest::READABLE);
        assert!(poll_once(&mut wait).is_pending());
        reactor.poll();
        match poll_once(&mut wait) {
            Poll::Ready(Err(err)) => assert_eq!(err.raw_os_error(), Some(libc::EBADF)),
            other => panic!("unexpected {:?}", other),
        }

        let mut negative = wait_ready(-1, Interest::WRITABLE);
        assert!(matches!(poll_once(&mut negative), Poll::Ready(Err(_))));
    }
}
