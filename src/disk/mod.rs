//! Blocking-style disk I/O on top of io_uring.
//!
//! A [`DiskBridge`] owns one ring and one eventfd registered as its completion
//! notifier. Tasks call [`DiskBridge::pread`] and friends, which queue the
//! request under a correlation token and suspend. A single reactor fiber
//! waits on the eventfd, drains the completion queue, and wakes exactly the
//! task each token belongs to.
//!
//! At most `queue_depth` requests are outstanding at once. A task that finds
//! the bridge full waits for the next drain and tries again; callers never
//! see that condition as an error.

mod file;
mod op;

pub use file::BridgedFile;
pub use op::{OpKind, Operation};

use std::cell::{Cell, RefCell};
use std::future::poll_fn;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use std::time::Instant;

use futures_lite::future::yield_now;
use io_uring::{opcode, IoUring};
use slab::Slab;

use crate::config::DiskConfig;
use crate::error::BridgeError;
use crate::executor::get_runtime;
use crate::notify::EventFd;
use crate::poll::{wait_ready, Interest};
use crate::sync::{Condvar, Interrupt, Interrupted};
use crate::timer::{sleep, timeout};

/// Lifecycle of a [`DiskBridge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Running,
    /// Shutdown requested; the reactor is draining outstanding requests.
    Stopping,
    Stopped,
}

/// What a correlation token currently stands for.
enum Slot {
    /// Queued; the issuer is (or will be) waiting on it.
    Waiting(Option<Waker>),
    /// The kernel finished; result not yet picked up.
    Completed(i32),
    /// The issuer went away. Buffers are kept until the kernel lets go.
    Abandoned(Operation),
    /// An async-cancel request.
    Cancel,
    /// Given up on at shutdown while the kernel may still hold the buffers.
    Detached,
}

/// `user_data` of the cancel requests pushed at shutdown. They take no token.
const SHUTDOWN_CANCEL: u64 = u64::MAX;

struct DiskShared {
    ring: RefCell<Option<IoUring>>,
    notify: RefCell<Option<EventFd>>,
    slots: RefCell<Slab<Slot>>,
    on_complete: Condvar,
    state: Cell<BridgeState>,
    interrupt: Interrupt,
    config: DiskConfig,
}

/// Handle to a running disk bridge. Clones share the same ring.
#[derive(Clone)]
pub struct DiskBridge {
    shared: Rc<DiskShared>,
}

fn not_running() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "disk bridge is not running")
}

impl DiskBridge {
    /// Start a bridge with the default configuration.
    pub fn new() -> Result<Self, BridgeError> {
        Self::init(DiskConfig::default())
    }

    /// Create the eventfd and ring, then spawn the reactor fiber on the
    /// current thread's runtime.
    #[tracing::instrument(level = "trace")]
    pub fn init(config: DiskConfig) -> Result<Self, BridgeError> {
        let runtime = get_runtime().ok_or(BridgeError::NoRuntime)?;

        let notify = EventFd::new()?;
        let ring = IoUring::builder().build(config.queue_depth)?;
        ring.submitter().register_eventfd(notify.as_raw_fd())?;
        if !ring.params().is_feature_nodrop() {
            tracing::debug!("io_uring lacks IORING_FEAT_NODROP");
        }

        let shared = Rc::new(DiskShared {
            ring: RefCell::new(Some(ring)),
            notify: RefCell::new(Some(notify)),
            slots: RefCell::new(Slab::with_capacity(config.queue_depth as usize)),
            on_complete: Condvar::new(),
            state: Cell::new(BridgeState::Running),
            interrupt: Interrupt::new(),
            config,
        });

        runtime.spawn_with_name(reactor_loop(shared.clone()), "disk-reactor".to_string());
        tracing::info!(
            queue_depth = shared.config.queue_depth,
            "disk bridge started"
        );

        Ok(DiskBridge { shared })
    }

    pub fn state(&self) -> BridgeState {
        self.shared.state.get()
    }

    pub fn is_running(&self) -> bool {
        self.state() == BridgeState::Running
    }

    /// Tokens currently held by requests the kernel has not finished with.
    pub fn in_flight(&self) -> usize {
        self.shared.slots.borrow().len()
    }

    pub fn config(&self) -> &DiskConfig {
        &self.shared.config
    }

    #[tracing::instrument(level = "trace", skip(self, buf))]
    pub async fn pread(&self, fd: RawFd, buf: Vec<u8>, offset: u64) -> io::Result<(usize, Vec<u8>)> {
        let (n, op) = self.submit(Operation::read(fd, buf, offset)).await?;
        Ok((n, op.into_buffer()))
    }

    #[tracing::instrument(level = "trace", skip(self, buf))]
    pub async fn pwrite(&self, fd: RawFd, buf: Vec<u8>, offset: u64) -> io::Result<(usize, Vec<u8>)> {
        let (n, op) = self.submit(Operation::write(fd, buf, offset)).await?;
        Ok((n, op.into_buffer()))
    }

    #[tracing::instrument(level = "trace", skip(self, bufs))]
    pub async fn preadv(
        &self,
        fd: RawFd,
        bufs: Vec<Vec<u8>>,
        offset: u64,
    ) -> io::Result<(usize, Vec<Vec<u8>>)> {
        let (n, op) = self.submit(Operation::read_vectored(fd, bufs, offset)).await?;
        Ok((n, op.into_buffers()))
    }

    #[tracing::instrument(level = "trace", skip(self, bufs))]
    pub async fn pwritev(
        &self,
        fd: RawFd,
        bufs: Vec<Vec<u8>>,
        offset: u64,
    ) -> io::Result<(usize, Vec<Vec<u8>>)> {
        let (n, op) = self.submit(Operation::write_vectored(fd, bufs, offset)).await?;
        Ok((n, op.into_buffers()))
    }

    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn fsync(&self, fd: RawFd) -> io::Result<()> {
        self.submit(Operation::fsync(fd)).await.map(|_| ())
    }

    /// Queue `op` and suspend until the kernel reports its result.
    ///
    /// Invalid descriptors and oversized requests fail before the task is
    /// suspended. On success the byte count is returned with the operation,
    /// whose buffers now hold the data read.
    pub async fn submit(&self, mut op: Operation) -> io::Result<(usize, Operation)> {
        op.validate()?;
        let shared = &*self.shared;

        let token = loop {
            if shared.state.get() != BridgeState::Running {
                return Err(not_running());
            }
            match shared.try_push(&mut op)? {
                Some(token) => break token,
                None => {
                    tracing::trace!("disk queue full, waiting for completions");
                    shared.on_complete.wait().await;
                }
            }
        };

        let guard = InFlight {
            shared,
            token,
            op: Some(op),
        };
        shared.flush().await?;

        let wait = poll_fn(|cx| shared.poll_completion(token, cx));
        let res = match shared.config.deadline {
            None => wait.await,
            Some(deadline) => match timeout(deadline, wait).await {
                Ok(res) => res,
                Err(_) => {
                    tracing::warn!(token, ?deadline, "disk operation deadline elapsed");
                    shared.cancel(token);
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "disk operation deadline elapsed",
                    ));
                }
            },
        };

        let Some(res) = res else {
            // The kernel may still write into these buffers.
            std::mem::forget(guard.finish());
            return Err(io::Error::from_raw_os_error(libc::ECANCELED));
        };
        let op = guard.finish();
        if res < 0 {
            Err(io::Error::from_raw_os_error(-res))
        } else {
            Ok((res as usize, op))
        }
    }

    /// Stop the reactor and release the ring and eventfd.
    ///
    /// Requests still in flight are cancelled and their issuers see the
    /// kernel's result, usually `ECANCELED`. Whatever has not completed after
    /// `shutdown_grace` fails with `ECANCELED` without waiting for the kernel.
    /// Returns once the reactor fiber has exited; does nothing unless the
    /// bridge is running.
    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn shutdown(&self) {
        let shared = &*self.shared;
        if shared.state.get() != BridgeState::Running {
            return;
        }
        tracing::info!(in_flight = self.in_flight(), "disk bridge shutting down");

        shared.state.set(BridgeState::Stopping);
        shared.interrupt.interrupt();
        // Tasks waiting for a free token must learn the bridge is closing.
        shared.on_complete.notify_all();

        while shared.state.get() != BridgeState::Stopped {
            sleep(shared.config.shutdown_poll).await;
        }

        shared.on_complete.notify_all();
        shared.ring.borrow_mut().take();
        shared.notify.borrow_mut().take();
        tracing::info!("disk bridge stopped");
    }
}

impl DiskShared {
    /// Reserve a token and push the entry. `None` means the bridge is full.
    fn try_push(&self, op: &mut Operation) -> io::Result<Option<usize>> {
        let mut slots = self.slots.borrow_mut();
        if slots.len() >= self.config.queue_depth as usize {
            return Ok(None);
        }
        let mut ring = self.ring.borrow_mut();
        let ring = ring.as_mut().ok_or_else(not_running)?;

        let entry = slots.vacant_entry();
        let token = entry.key();
        let sqe = op.prepare().user_data(token as u64);
        // The buffers behind `sqe` stay owned by `op`, which outlives the token.
        if unsafe { ring.submission().push(&sqe) }.is_err() {
            return Ok(None);
        }
        entry.insert(Slot::Waiting(None));
        tracing::trace!(token, kind = ?op.kind(), fd = op.fd(), "queued");
        Ok(Some(token))
    }

    /// Hand queued entries to the kernel.
    async fn flush(&self) -> io::Result<()> {
        loop {
            let res = match self.ring.borrow().as_ref() {
                Some(ring) => ring.submit(),
                None => return Err(not_running()),
            };
            match res {
                Ok(_) => return Ok(()),
                Err(err) if matches!(err.raw_os_error(), Some(libc::EAGAIN) | Some(libc::EBUSY)) => {
                    tracing::trace!("kernel queue busy, waiting for completions");
                    self.on_complete.wait().await;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                    tracing::warn!("submission interrupted, retrying");
                    sleep(self.config.backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// `Ready(None)` means the request was detached at shutdown.
    fn poll_completion(&self, token: usize, cx: &mut Context<'_>) -> Poll<Option<i32>> {
        let mut slots = self.slots.borrow_mut();
        match slots.get_mut(token) {
            Some(Slot::Completed(res)) => {
                let res = *res;
                slots.remove(token);
                Poll::Ready(Some(res))
            }
            Some(Slot::Detached) => {
                slots.remove(token);
                Poll::Ready(None)
            }
            Some(Slot::Waiting(waker)) => {
                if !waker.as_ref().is_some_and(|w| w.will_wake(cx.waker())) {
                    *waker = Some(cx.waker().clone());
                }
                Poll::Pending
            }
            _ => {
                tracing::error!(token, "token lost while waiting");
                Poll::Ready(Some(-libc::EIO))
            }
        }
    }

    /// Best-effort cancellation of `token`. Needs a free token of its own.
    fn cancel(&self, token: usize) {
        let mut slots = self.slots.borrow_mut();
        if slots.len() >= self.config.queue_depth as usize {
            tracing::debug!(token, "no room for a cancel request");
            return;
        }
        let mut ring = self.ring.borrow_mut();
        let Some(ring) = ring.as_mut() else {
            return;
        };
        let entry = slots.vacant_entry();
        let sqe = opcode::AsyncCancel::new(token as u64)
            .build()
            .user_data(entry.key() as u64);
        if unsafe { ring.submission().push(&sqe) }.is_err() {
            return;
        }
        entry.insert(Slot::Cancel);
        if let Err(err) = ring.submit() {
            tracing::warn!(token, "cancel submission failed: {}", err);
        }
    }

    /// Record a completion. Returns the waker of the task it belongs to.
    fn resolve(&self, token: usize, res: i32) -> Option<Waker> {
        let mut slots = self.slots.borrow_mut();
        let Some(slot) = slots.get_mut(token) else {
            tracing::warn!(token, res, "completion for unknown token");
            return None;
        };
        match slot {
            Slot::Waiting(waker) => {
                let waker = waker.take();
                *slot = Slot::Completed(res);
                waker
            }
            Slot::Abandoned(_) => {
                tracing::debug!(token, res, "releasing abandoned operation");
                slots.remove(token);
                None
            }
            Slot::Cancel => {
                tracing::debug!(token, res, "cancel request finished");
                slots.remove(token);
                None
            }
            Slot::Completed(_) => {
                tracing::warn!(token, res, "duplicate completion");
                None
            }
            Slot::Detached => {
                tracing::debug!(token, res, "detached request finished");
                None
            }
        }
    }

    /// Ask the kernel to cancel every request still in flight.
    fn cancel_all(&self) {
        let tokens: Vec<usize> = self
            .slots
            .borrow()
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Waiting(_) | Slot::Abandoned(_)))
            .map(|(token, _)| token)
            .collect();
        if tokens.is_empty() {
            return;
        }
        let mut ring = self.ring.borrow_mut();
        let Some(ring) = ring.as_mut() else {
            return;
        };
        tracing::debug!(count = tokens.len(), "cancelling outstanding requests");

        for token in tokens {
            let sqe = opcode::AsyncCancel::new(token as u64)
                .build()
                .user_data(SHUTDOWN_CANCEL);
            if unsafe { ring.submission().push(&sqe) }.is_ok() {
                continue;
            }
            // Submission queue full: hand it to the kernel and try once more.
            if let Err(err) = ring.submit() {
                tracing::warn!("cancel submission failed: {}", err);
            }
            if unsafe { ring.submission().push(&sqe) }.is_err() {
                tracing::warn!(token, "no room for a cancel request");
            }
        }
        if let Err(err) = ring.submit() {
            tracing::warn!("cancel submission failed: {}", err);
        }
    }

    /// Stop waiting for the kernel. Issuers are woken and fail with
    /// `ECANCELED`; buffers the kernel may still touch are leaked.
    fn detach_all(&self) {
        let mut wakers = Vec::new();
        let mut leaked = 0usize;
        self.slots.borrow_mut().retain(|_, slot| match slot {
            Slot::Waiting(waker) => {
                wakers.extend(waker.take());
                *slot = Slot::Detached;
                true
            }
            Slot::Abandoned(_) => {
                if let Slot::Abandoned(op) = std::mem::replace(slot, Slot::Detached) {
                    std::mem::forget(op);
                    leaked += 1;
                }
                false
            }
            Slot::Cancel => false,
            Slot::Completed(_) | Slot::Detached => true,
        });
        tracing::error!(
            detached = wakers.len(),
            leaked,
            "requests did not finish within the shutdown grace period"
        );
        for waker in wakers {
            waker.wake();
        }
    }

    /// Slots the reactor still has to see through. Results waiting to be
    /// picked up do not count.
    fn outstanding(&self) -> usize {
        self.slots
            .borrow()
            .iter()
            .filter(|(_, slot)| !matches!(slot, Slot::Completed(_) | Slot::Detached))
            .count()
    }

    /// Drain the completion queue, waking each owner.
    async fn reap(&self) {
        let depth = self.config.queue_depth as usize;
        let pending = match self.ring.borrow_mut().as_mut() {
            Some(ring) => ring.completion().len(),
            None => return,
        };
        // Shutdown cancels take no token, so they may double the count.
        let limit = match self.state.get() {
            BridgeState::Running => depth,
            _ => depth * 2,
        };
        if pending > limit {
            tracing::error!(
                fatal = true,
                pending,
                depth,
                "more completions than requests allowed in flight"
            );
        }

        loop {
            let batch: Vec<(u64, i32)> = match self.ring.borrow_mut().as_mut() {
                Some(ring) => ring
                    .completion()
                    .take(depth)
                    .map(|cqe| (cqe.user_data(), cqe.result()))
                    .collect(),
                None => return,
            };
            if batch.is_empty() {
                return;
            }
            for (user_data, res) in batch {
                if user_data == SHUTDOWN_CANCEL {
                    tracing::trace!(res, "shutdown cancel finished");
                    continue;
                }
                if let Some(waker) = self.resolve(user_data as usize, res) {
                    waker.wake();
                    yield_now().await;
                }
            }
        }
    }
}

/// Keeps a token's buffers alive if the issuing task stops waiting early.
struct InFlight<'a> {
    shared: &'a DiskShared,
    token: usize,
    op: Option<Operation>,
}

impl InFlight<'_> {
    fn finish(mut self) -> Operation {
        match self.op.take() {
            Some(op) => op,
            None => unreachable!("in-flight operation finished twice"),
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let Some(op) = self.op.take() else {
            return;
        };
        let mut slots = self.shared.slots.borrow_mut();
        match slots.get_mut(self.token) {
            Some(slot) if matches!(slot, Slot::Waiting(_)) => *slot = Slot::Abandoned(op),
            Some(Slot::Completed(_)) => {
                slots.remove(self.token);
            }
            Some(Slot::Detached) => {
                slots.remove(self.token);
                std::mem::forget(op);
            }
            _ => {}
        }
    }
}

async fn reactor_loop(shared: Rc<DiskShared>) {
    let fd = shared.notify.borrow().as_ref().map(|n| n.as_raw_fd());
    let Some(fd) = fd else {
        shared.state.set(BridgeState::Stopped);
        return;
    };
    tracing::debug!(fd, "disk reactor running");

    let mut drain_until: Option<Instant> = None;
    loop {
        if shared.state.get() == BridgeState::Stopping {
            if shared.outstanding() == 0 {
                break;
            }
            let until = *drain_until.get_or_insert_with(|| {
                shared.cancel_all();
                Instant::now() + shared.config.shutdown_grace
            });
            if Instant::now() >= until {
                shared.detach_all();
                break;
            }
        }

        let wait = shared.interrupt.interruptible(wait_ready(fd, Interest::READABLE));
        let woke = match drain_until {
            None => wait.await,
            Some(until) => match timeout(until.saturating_duration_since(Instant::now()), wait).await {
                Ok(woke) => woke,
                Err(_) => continue,
            },
        };
        match woke {
            Err(Interrupted) => {
                tracing::trace!("disk reactor interrupted");
                continue;
            }
            Ok(Err(err)) => {
                tracing::error!("disk reactor wait failed: {}", err);
                sleep(shared.config.backoff).await;
                continue;
            }
            Ok(Ok(_)) => {}
        }

        let signalled = shared.notify.borrow().as_ref().map(EventFd::read);
        match signalled {
            Some(Ok(count)) => tracing::trace!(count, "completions signalled"),
            Some(Err(err)) if err.kind() == io::ErrorKind::WouldBlock => {
                tracing::trace!("spurious eventfd wakeup");
            }
            Some(Err(err)) => {
                tracing::error!("eventfd read failed: {}", err);
                sleep(shared.config.backoff).await;
                continue;
            }
            None => break,
        }

        shared.reap().await;
        shared.on_complete.notify_all();
    }

    shared.state.set(BridgeState::Stopped);
    shared.on_complete.notify_all();
    tracing::debug!("disk reactor exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{clear_runtime, set_runtime, Runtime};
    use futures::FutureExt;
    use std::time::Duration;

    #[test]
    fn init_without_runtime_fails() {
        clear_runtime();
        assert!(matches!(
            DiskBridge::init(DiskConfig::default()),
            Err(BridgeError::NoRuntime)
        ));
    }

    #[test]
    fn invalid_descriptor_fails_without_suspending() {
        let runtime = Runtime::new(16);
        set_runtime(runtime.clone());
        let out = runtime.run(async {
            let bridge = DiskBridge::new().unwrap();
            let res = bridge.pread(-1, vec![0; 16], 0).now_or_never();
            let in_flight = bridge.in_flight();
            bridge.shutdown().await;
            (res.map(|r| r.map(|(n, _)| n).map_err(|e| e.raw_os_error())), in_flight)
        });
        assert_eq!(out, Ok((Some(Err(Some(libc::EBADF))), 0)));
        clear_runtime();
    }

    #[test]
    fn shutdown_twice_is_harmless() {
        let runtime = Runtime::new(16);
        set_runtime(runtime.clone());
        let out = runtime.run(async {
            let file = tempfile::tempfile().unwrap();
            let bridge = DiskBridge::new().unwrap();
            bridge.shutdown().await;
            bridge.shutdown().await;
            let after = bridge
                .pwrite(file.as_raw_fd(), vec![1], 0)
                .await
                .map(|_| ());
            (bridge.state(), after.map_err(|e| e.kind()))
        });
        assert_eq!(
            out,
            Ok((BridgeState::Stopped, Err(io::ErrorKind::NotConnected)))
        );
        clear_runtime();
    }

    #[test]
    fn shutdown_detaches_requests_that_never_finish() {
        let runtime = Runtime::new(16);
        set_runtime(runtime.clone());
        let out = runtime.run(async {
            let config = DiskConfig::new().shutdown_grace(Duration::from_millis(20));
            let bridge = DiskBridge::init(config).unwrap();
            let shared = bridge.shared.clone();
            // Tokens the kernel never saw, so no cancel request can reach them.
            let waiting = shared.slots.borrow_mut().insert(Slot::Waiting(None));
            let abandoned = shared
                .slots
                .borrow_mut()
                .insert(Slot::Abandoned(Operation::read(0, vec![0; 8], 0)));

            bridge.shutdown().await;
            let detached = matches!(shared.slots.borrow().get(waiting), Some(Slot::Detached));
            let abandoned_released = !shared.slots.borrow().contains(abandoned);
            let waker = futures::task::noop_waker();
            let polled = shared.poll_completion(waiting, &mut Context::from_waker(&waker));
            (bridge.state(), detached, abandoned_released, polled, bridge.in_flight())
        });
        assert_eq!(
            out,
            Ok((BridgeState::Stopped, true, true, Poll::Ready(None), 0))
        );
        clear_runtime();
    }
}
