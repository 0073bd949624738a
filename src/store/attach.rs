//! Drives an [`AsyncClient`] from a reactor fiber and offers blocking-style
//! commands on top of it.
//!
//! [`attach`] installs hooks into the client that record which readiness it
//! wants and kick the connection's reactor fiber. The fiber waits on the
//! client socket and calls back into the client, which in turn completes the
//! per-command callbacks [`Attachment::command`] is waiting on.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use futures::channel::oneshot;
use futures_lite::future::yield_now;

use crate::config::AttachConfig;
use crate::error::{BridgeError, ClientError};
use crate::executor::get_runtime;
use crate::poll::{wait_ready, Interest, Ready};
use crate::store::client::{AsyncClient, DefaultLifecycle, EventHooks, ReplyLifecycle};
use crate::store::resp::{Command, Reply};
use crate::sync::{Interrupt, Interrupted};
use crate::task::JoinHandle;
use crate::timer::sleep;

/// Lifecycle that leaves replies to whoever holds them.
///
/// Installed while attached, so a reply handed to a waiting task is not
/// released underneath it. Replies nobody claimed are simply dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLifecycle;

impl ReplyLifecycle for NoopLifecycle {
    fn release(&self, reply: Reply) {
        tracing::trace!(?reply, "unclaimed reply dropped");
    }
}

#[derive(Debug, Clone)]
struct Identity {
    host: String,
    port: u16,
}

struct AttachState {
    /// Cleared when the client disconnects.
    client: RefCell<Option<Rc<AsyncClient>>>,
    /// Reaches the client after disconnect so detach can restore it.
    origin: Weak<AsyncClient>,
    reading: Cell<bool>,
    writing: Cell<bool>,
    running: Cell<bool>,
    interrupt: Interrupt,
    saved_lifecycle: RefCell<Option<Rc<dyn ReplyLifecycle>>>,
    identity: RefCell<Option<Identity>>,
    last_error: RefCell<Option<ClientError>>,
    config: AttachConfig,
}

impl AttachState {
    fn set_interest(&self, flag: &Cell<bool>, on: bool) {
        if flag.replace(on) != on {
            self.interrupt.interrupt();
        }
    }

    fn interest(&self) -> Interest {
        let mut interest = Interest::empty();
        if self.reading.get() {
            interest |= Interest::READABLE;
        }
        if self.writing.get() {
            interest |= Interest::WRITABLE;
        }
        interest
    }
}

impl EventHooks for AttachState {
    fn add_read(&self) {
        self.set_interest(&self.reading, true);
    }

    fn del_read(&self) {
        self.set_interest(&self.reading, false);
    }

    fn add_write(&self) {
        self.set_interest(&self.writing, true);
    }

    fn del_write(&self) {
        self.set_interest(&self.writing, false);
    }

    fn cleanup(&self) {
        self.reading.set(false);
        self.writing.set(false);
        self.interrupt.interrupt();
    }
}

/// A client attached to its own reactor fiber.
pub struct Attachment {
    state: Rc<AttachState>,
    fiber: Option<JoinHandle<()>>,
}

/// Attach `client` with the default configuration.
pub fn attach(client: &Rc<AsyncClient>) -> Result<Attachment, BridgeError> {
    attach_with_config(client, AttachConfig::default())
}

/// Hook `client` up to a new reactor fiber on the current thread's runtime.
///
/// Fails with [`BridgeError::AlreadyAttached`] if the client already has event
/// hooks installed; the existing attachment is left untouched.
#[tracing::instrument(level = "trace", skip(client))]
pub fn attach_with_config(
    client: &Rc<AsyncClient>,
    config: AttachConfig,
) -> Result<Attachment, BridgeError> {
    if client.has_event_hooks() {
        tracing::warn!(host = client.host(), port = client.port(), "client is already attached");
        return Err(BridgeError::AlreadyAttached);
    }
    let runtime = get_runtime().ok_or(BridgeError::NoRuntime)?;

    let state = Rc::new(AttachState {
        client: RefCell::new(Some(client.clone())),
        origin: Rc::downgrade(client),
        reading: Cell::new(false),
        writing: Cell::new(false),
        running: Cell::new(true),
        interrupt: Interrupt::new(),
        saved_lifecycle: RefCell::new(None),
        identity: RefCell::new(Some(Identity {
            host: client.host().to_string(),
            port: client.port(),
        })),
        last_error: RefCell::new(None),
        config,
    });

    let original = client.set_reply_lifecycle(Rc::new(NoopLifecycle));
    *state.saved_lifecycle.borrow_mut() = Some(original);

    client.set_connect_callback(Some(Rc::new(
        |c: &AsyncClient, res: Result<(), ClientError>| match res {
            Ok(()) => tracing::info!("connected to {}:{}", c.host(), c.port()),
            Err(err) => tracing::error!("connect to {}:{} failed: {}", c.host(), c.port(), err),
        },
    )));

    let weak = Rc::downgrade(&state);
    client.set_disconnect_callback(Some(Rc::new(
        move |c: &AsyncClient, res: Result<(), ClientError>| {
            match &res {
                Ok(()) => tracing::info!("disconnected from {}:{}", c.host(), c.port()),
                Err(err) => {
                    tracing::error!("disconnected from {}:{}: {}", c.host(), c.port(), err)
                }
            }
            if let Some(state) = weak.upgrade() {
                *state.last_error.borrow_mut() = res.err();
                state.client.borrow_mut().take();
                state.interrupt.interrupt();
            }
        },
    )));

    client.set_event_hooks(Some(state.clone() as Rc<dyn EventHooks>));

    let name = format!("store-reactor-{}:{}", client.host(), client.port());
    let fiber = runtime.spawn_with_name(reactor_loop(state.clone()), name);
    tracing::debug!(host = client.host(), port = client.port(), "client attached");

    Ok(Attachment {
        state,
        fiber: Some(fiber),
    })
}

impl Attachment {
    /// The attached client, until it disconnects or is detached.
    pub fn client(&self) -> Option<Rc<AsyncClient>> {
        self.state.client.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        self.state.running.get()
    }

    pub fn host(&self) -> Option<String> {
        self.state.identity.borrow().as_ref().map(|i| i.host.clone())
    }

    pub fn port(&self) -> Option<u16> {
        self.state.identity.borrow().as_ref().map(|i| i.port)
    }

    pub fn last_error(&self) -> Option<ClientError> {
        match self.client() {
            Some(client) => client.last_error(),
            None => self.state.last_error.borrow().clone(),
        }
    }

    /// Send `cmd` and suspend until its reply arrives.
    ///
    /// The caller owns the reply; hand it to [`Attachment::release`] (or
    /// [`release_reply`]) to dispose of it the way the client normally would.
    #[tracing::instrument(level = "trace", skip(self, cmd))]
    pub async fn command(&self, cmd: impl Into<Command>) -> Result<Reply, BridgeError> {
        if !self.state.running.get() {
            return Err(BridgeError::Detached);
        }
        let client = self.client().ok_or(BridgeError::Detached)?;

        let (tx, rx) = oneshot::channel::<Option<Reply>>();
        client.command(
            cmd,
            Some(Box::new(move |_: &AsyncClient, slot: &mut Option<Reply>| {
                // The receiver is gone if the issuing task was dropped.
                let _ = tx.send(slot.take());
            })),
        )?;
        drop(client);

        match rx.await {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) | Err(oneshot::Canceled) => Err(BridgeError::Disconnected),
        }
    }

    /// Release `reply` through the client's original lifecycle.
    pub fn release(&self, reply: Reply) {
        let saved = self.state.saved_lifecycle.borrow().clone();
        match saved {
            Some(lifecycle) => lifecycle.release(reply),
            None => DefaultLifecycle.release(reply),
        }
    }

    /// Remove the hooks, restore the original reply lifecycle, and wait for
    /// the reactor fiber to exit. The client itself stays open.
    pub async fn detach(mut self) {
        self.teardown();
        yield_now().await;
        if let Some(fiber) = self.fiber.take() {
            if let Err(err) = fiber.await {
                tracing::warn!("store reactor ended abnormally: {}", err);
            }
        }
    }

    fn teardown(&self) {
        let state = &self.state;
        if !state.running.replace(false) {
            return;
        }
        let identity = state.identity.borrow_mut().take();
        state.last_error.borrow_mut().take();

        let client = state.client.borrow_mut().take().or_else(|| state.origin.upgrade());
        if let Some(client) = client {
            if let Some(original) = state.saved_lifecycle.borrow().clone() {
                client.set_reply_lifecycle(original);
            }
            client.set_event_hooks(None);
            client.set_connect_callback(None);
            client.set_disconnect_callback(None);
        }
        state.reading.set(false);
        state.writing.set(false);
        state.interrupt.interrupt();

        if let Some(Identity { host, port }) = identity {
            tracing::debug!(host, port, "client detached");
        }
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Release `reply` through `attachment` if there is one, or the way a plain
/// client would otherwise.
pub fn release_reply(attachment: Option<&Attachment>, reply: Reply) {
    match attachment {
        Some(attachment) => attachment.release(reply),
        None => DefaultLifecycle.release(reply),
    }
}

/// Connect, attach and check the connection with a `TIME` round trip.
///
/// On failure the client is freed and detached before the error is returned.
#[tracing::instrument(level = "trace")]
pub async fn connect(host: &str, port: u16) -> Result<Attachment, BridgeError> {
    let client = AsyncClient::connect(host, port)?;
    let attachment = match attach(&client) {
        Ok(attachment) => attachment,
        Err(err) => {
            client.free();
            return Err(err);
        }
    };
    drop(client);

    match attachment.command("TIME").await {
        Ok(reply) => {
            tracing::debug!(?reply, "store connection verified");
            attachment.release(reply);
            Ok(attachment)
        }
        Err(err) => {
            tracing::error!("store probe to {}:{} failed: {}", host, port, err);
            free(attachment).await;
            Err(err)
        }
    }
}

/// Close the client, then detach.
pub async fn free(attachment: Attachment) {
    if let Some(client) = attachment.client() {
        client.free();
    }
    attachment.detach().await;
}

async fn reactor_loop(state: Rc<AttachState>) {
    tracing::debug!("store reactor running");
    while state.running.get() {
        let client = state.client.borrow().clone();
        let target = client.as_ref().and_then(|c| c.fd()).map(|fd| (fd, state.interest()));
        let (fd, interest) = match target {
            Some((fd, interest)) if !interest.is_empty() => (fd, interest),
            _ => {
                drop(client);
                state.interrupt.park().await;
                continue;
            }
        };
        let Some(client) = client else {
            continue;
        };

        let ready = match state.interrupt.interruptible(wait_ready(fd, interest)).await {
            Err(Interrupted) => continue,
            Ok(Err(err)) => {
                tracing::warn!(fd, "store reactor wait failed: {}", err);
                drop(client);
                sleep(state.config.backoff).await;
                continue;
            }
            Ok(Ok(ready)) => ready,
        };

        // Let the client see hang-ups and socket errors through its handlers.
        let failed = ready.intersects(Ready::HANGUP | Ready::ERROR);
        if (failed || ready.contains(Ready::READABLE)) && state.reading.get() {
            client.handle_read();
        }
        if (failed || ready.contains(Ready::WRITABLE))
            && state.writing.get()
            && state.client.borrow().is_some()
        {
            client.handle_write();
        }
    }
    tracing::debug!("store reactor exited");
}
