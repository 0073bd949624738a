//! Callback-driven store client.
//!
//! [`AsyncClient`] never blocks and never waits on its own socket. Whoever
//! drives it installs [`EventHooks`] to learn when the client wants read or
//! write readiness, and calls [`AsyncClient::handle_read`] /
//! [`AsyncClient::handle_write`] when the socket is ready. Replies are matched
//! to commands in FIFO order and delivered to per-command callbacks.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, Read};
use std::net::ToSocketAddrs;
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;

use bytes::{Buf, BytesMut};
use socket2::{Domain, Protocol, Socket, Type};

use crate::error::ClientError;
use crate::store::resp::{Command, Reply, ReplyReader};

/// Readiness hooks a driver installs into the client.
///
/// Installed hooks also mark the client as attached to a driver.
pub trait EventHooks {
    fn add_read(&self);
    fn del_read(&self);
    fn add_write(&self);
    fn del_write(&self);
    /// The connection is going away; stop watching it.
    fn cleanup(&self);
}

/// Decides what happens to replies no callback took ownership of.
pub trait ReplyLifecycle {
    fn release(&self, reply: Reply);
}

/// Drops replies.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultLifecycle;

impl ReplyLifecycle for DefaultLifecycle {
    fn release(&self, reply: Reply) {
        drop(reply);
    }
}

/// Per-command completion callback.
///
/// The reply slot is `None` when the connection went away before the reply
/// arrived. A callback that wants the reply takes it out of the slot;
/// whatever is left goes to the client's [`ReplyLifecycle`].
pub type CommandCallback = Box<dyn FnOnce(&AsyncClient, &mut Option<Reply>)>;

/// Connect or disconnect observer. `Ok` on a clean connect or close.
pub type Observer = Rc<dyn Fn(&AsyncClient, Result<(), ClientError>)>;

struct Inner {
    socket: Option<Socket>,
    connected: bool,
    closing: bool,
    obuf: BytesMut,
    reader: ReplyReader,
    callbacks: VecDeque<Option<CommandCallback>>,
    last_error: Option<ClientError>,
}

pub struct AsyncClient {
    host: String,
    port: u16,
    inner: RefCell<Inner>,
    hooks: RefCell<Option<Rc<dyn EventHooks>>>,
    lifecycle: RefCell<Rc<dyn ReplyLifecycle>>,
    on_connect: RefCell<Option<Observer>>,
    on_disconnect: RefCell<Option<Observer>>,
}

impl AsyncClient {
    /// Start a non-blocking TCP connect to `host:port`.
    ///
    /// The connect finishes on the first write readiness, so the client is
    /// usable only once a driver is attached.
    #[tracing::instrument(level = "trace")]
    pub fn connect(host: &str, port: u16) -> Result<Rc<Self>, ClientError> {
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| ClientError::Io(format!("{}:{} did not resolve", host, port)))?;

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        socket.set_nodelay(true)?;
        let connected = match socket.connect(&addr.into()) {
            Ok(()) => true,
            Err(err)
                if err.raw_os_error() == Some(libc::EINPROGRESS)
                    || err.kind() == io::ErrorKind::WouldBlock =>
            {
                false
            }
            Err(err) => return Err(err.into()),
        };
        tracing::debug!(host, port, connected, "store client connecting");

        Ok(Rc::new(AsyncClient {
            host: host.to_string(),
            port,
            inner: RefCell::new(Inner {
                socket: Some(socket),
                connected,
                closing: false,
                obuf: BytesMut::new(),
                reader: ReplyReader::new(),
                callbacks: VecDeque::new(),
                last_error: None,
            }),
            hooks: RefCell::new(None),
            lifecycle: RefCell::new(Rc::new(DefaultLifecycle)),
            on_connect: RefCell::new(None),
            on_disconnect: RefCell::new(None),
        }))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn fd(&self) -> Option<RawFd> {
        self.inner.borrow().socket.as_ref().map(|s| s.as_raw_fd())
    }

    pub fn is_connected(&self) -> bool {
        self.inner.borrow().connected
    }

    /// `true` while the socket is open, connected or not.
    pub fn is_open(&self) -> bool {
        self.inner.borrow().socket.is_some()
    }

    pub fn last_error(&self) -> Option<ClientError> {
        self.inner.borrow().last_error.clone()
    }

    /// Commands sent or queued whose reply has not arrived yet.
    pub fn pending_commands(&self) -> usize {
        self.inner.borrow().callbacks.len()
    }

    pub fn has_event_hooks(&self) -> bool {
        self.hooks.borrow().is_some()
    }

    /// Install (or remove, with `None`) the driver hooks. Returns the old ones.
    ///
    /// New hooks are immediately told about any readiness the client already
    /// needs.
    pub fn set_event_hooks(&self, hooks: Option<Rc<dyn EventHooks>>) -> Option<Rc<dyn EventHooks>> {
        let previous = self.hooks.replace(hooks.clone());
        if let Some(hooks) = hooks {
            let (open, wants_write, wants_read) = {
                let inner = self.inner.borrow();
                (
                    inner.socket.is_some(),
                    !inner.connected || !inner.obuf.is_empty(),
                    inner.connected && !inner.callbacks.is_empty(),
                )
            };
            if open && wants_write {
                hooks.add_write();
            }
            if open && wants_read {
                hooks.add_read();
            }
        }
        previous
    }

    pub fn reply_lifecycle(&self) -> Rc<dyn ReplyLifecycle> {
        self.lifecycle.borrow().clone()
    }

    /// Swap the reply lifecycle. Returns the previous one.
    pub fn set_reply_lifecycle(&self, lifecycle: Rc<dyn ReplyLifecycle>) -> Rc<dyn ReplyLifecycle> {
        self.lifecycle.replace(lifecycle)
    }

    pub fn set_connect_callback(&self, observer: Option<Observer>) {
        *self.on_connect.borrow_mut() = observer;
    }

    pub fn set_disconnect_callback(&self, observer: Option<Observer>) {
        *self.on_disconnect.borrow_mut() = observer;
    }

    fn hooks(&self) -> Option<Rc<dyn EventHooks>> {
        self.hooks.borrow().clone()
    }

    /// Queue `cmd`. `callback` runs once its reply (or the disconnect) arrives.
    pub fn command(
        &self,
        cmd: impl Into<Command>,
        callback: Option<CommandCallback>,
    ) -> Result<(), ClientError> {
        let cmd = cmd.into();
        {
            let mut inner = self.inner.borrow_mut();
            if inner.socket.is_none() {
                return Err(ClientError::NotConnected);
            }
            if inner.closing {
                return Err(ClientError::Closing);
            }
            if cmd.is_empty() {
                return Err(ClientError::EmptyCommand);
            }
            cmd.encode(&mut inner.obuf);
            inner.callbacks.push_back(callback);
        }
        tracing::trace!(args = cmd.args().len(), "command queued");
        if let Some(hooks) = self.hooks() {
            hooks.add_write();
        }
        Ok(())
    }

    /// Call when the socket is writable: finishes a pending connect, then
    /// flushes queued commands.
    pub fn handle_write(&self) {
        let connecting = {
            let inner = self.inner.borrow();
            inner.socket.is_some() && !inner.connected
        };
        if connecting {
            match self.finish_connect() {
                Ok(true) => {
                    tracing::debug!(host = %self.host, port = self.port, "store client connected");
                    let observer = self.on_connect.borrow().clone();
                    if let Some(observer) = observer {
                        observer(self, Ok(()));
                    }
                }
                Ok(false) => return,
                Err(err) => {
                    let observer = self.on_connect.borrow().clone();
                    if let Some(observer) = observer {
                        observer(self, Err(err.clone()));
                    }
                    self.teardown(Err(err));
                    return;
                }
            }
        }

        loop {
            let res = {
                let mut guard = self.inner.borrow_mut();
                let inner = &mut *guard;
                if inner.obuf.is_empty() {
                    break;
                }
                let Some(socket) = inner.socket.as_ref() else {
                    return;
                };
                let res = socket.send_with_flags(&inner.obuf, libc::MSG_NOSIGNAL);
                if let Ok(n) = res {
                    inner.obuf.advance(n);
                }
                res
            };
            match res {
                Ok(0) => {
                    self.teardown(Err(ClientError::Io("socket accepted no data".into())));
                    return;
                }
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    self.teardown(Err(err.into()));
                    return;
                }
            }
        }

        if let Some(hooks) = self.hooks() {
            hooks.del_write();
            hooks.add_read();
        }
        self.maybe_finish_close();
    }

    /// Call when the socket is readable: reads what is there and dispatches
    /// every complete reply to its callback.
    pub fn handle_read(&self) {
        let mut chunk = [0u8; 16 * 1024];
        let res = {
            let inner = self.inner.borrow();
            match inner.socket.as_ref() {
                Some(mut socket) => socket.read(&mut chunk),
                None => return,
            }
        };
        match res {
            Ok(0) => {
                self.teardown(Err(ClientError::Eof));
                return;
            }
            Ok(n) => self.inner.borrow_mut().reader.feed(&chunk[..n]),
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::Interrupted =>
            {
                return
            }
            Err(err) => {
                self.teardown(Err(err.into()));
                return;
            }
        }

        loop {
            let next = self.inner.borrow_mut().reader.next_reply();
            let reply = match next {
                Ok(Some(reply)) => reply,
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!("store reply parse failed: {}", err);
                    self.teardown(Err(err));
                    return;
                }
            };

            let callback = self.inner.borrow_mut().callbacks.pop_front();
            let mut slot = Some(reply);
            match callback {
                Some(Some(callback)) => callback(self, &mut slot),
                Some(None) => {}
                None => tracing::warn!("reply arrived with no command waiting for it"),
            }
            if let Some(reply) = slot.take() {
                let lifecycle = self.reply_lifecycle();
                lifecycle.release(reply);
            }

            if !self.is_open() {
                return;
            }
        }
        self.maybe_finish_close();
    }

    /// Close once every queued command has been answered.
    pub fn disconnect(&self) {
        self.inner.borrow_mut().closing = true;
        self.maybe_finish_close();
    }

    /// Close now. Callbacks still waiting see an empty reply slot.
    pub fn free(&self) {
        self.teardown(Ok(()));
    }

    fn maybe_finish_close(&self) {
        let done = {
            let inner = self.inner.borrow();
            inner.closing && inner.callbacks.is_empty() && inner.obuf.is_empty()
        };
        if done {
            self.teardown(Ok(()));
        }
    }

    fn finish_connect(&self) -> Result<bool, ClientError> {
        let inner = self.inner.borrow();
        let Some(socket) = inner.socket.as_ref() else {
            return Err(ClientError::NotConnected);
        };
        if let Some(err) = socket.take_error()? {
            return Err(err.into());
        }
        match socket.peer_addr() {
            Ok(_) => {}
            Err(err) if err.raw_os_error() == Some(libc::ENOTCONN) => return Ok(false),
            Err(err) => return Err(err.into()),
        }
        drop(inner);
        self.inner.borrow_mut().connected = true;
        Ok(true)
    }

    fn teardown(&self, reason: Result<(), ClientError>) {
        let (socket, callbacks) = {
            let mut inner = self.inner.borrow_mut();
            let Some(socket) = inner.socket.take() else {
                return;
            };
            inner.connected = false;
            inner.closing = false;
            inner.obuf.clear();
            inner.last_error = reason.as_ref().err().cloned();
            (socket, std::mem::take(&mut inner.callbacks))
        };
        match &reason {
            Ok(()) => tracing::debug!(host = %self.host, port = self.port, "store client closed"),
            Err(err) => {
                tracing::warn!(host = %self.host, port = self.port, "store connection lost: {}", err)
            }
        }

        if let Some(hooks) = self.hooks() {
            hooks.cleanup();
        }
        drop(socket);

        for callback in callbacks.into_iter().flatten() {
            let mut empty = None;
            callback(self, &mut empty);
        }

        let observer = self.on_disconnect.borrow().clone();
        if let Some(observer) = observer {
            observer(self, reason);
        }
    }
}

impl std::fmt::Debug for AsyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncClient")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::io::Write;
    use std::net::TcpListener;

    #[derive(Default)]
    struct Flags {
        read: Cell<bool>,
        write: Cell<bool>,
        cleaned: Cell<bool>,
    }

    impl EventHooks for Flags {
        fn add_read(&self) {
            self.read.set(true);
        }
        fn del_read(&self) {
            self.read.set(false);
        }
        fn add_write(&self) {
            self.write.set(true);
        }
        fn del_write(&self) {
            self.write.set(false);
        }
        fn cleanup(&self) {
            self.cleaned.set(true);
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        panic!("condition not reached");
    }

    #[test]
    fn commands_are_answered_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let client = AsyncClient::connect("127.0.0.1", port).unwrap();
        let (mut peer, _) = listener.accept().unwrap();

        let flags = Rc::new(Flags::default());
        client.set_event_hooks(Some(flags.clone()));
        assert!(client.has_event_hooks());

        let got = Rc::new(RefCell::new(Vec::new()));
        for name in ["first", "second"] {
            let got = got.clone();
            client
                .command(
                    Command::new("ECHO").arg(name),
                    Some(Box::new(move |_: &AsyncClient, slot: &mut Option<Reply>| {
                        got.borrow_mut().push(slot.take())
                    })),
                )
                .unwrap();
        }
        assert!(flags.write.get());

        wait_until(|| {
            client.handle_write();
            client.is_connected() && !flags.write.get()
        });
        assert!(flags.read.get());

        peer.write_all(b"$5\r\nfirst\r\n$6\r\nsec").unwrap();
        wait_until(|| {
            client.handle_read();
            got.borrow().len() == 1
        });
        peer.write_all(b"ond\r\n").unwrap();
        wait_until(|| {
            client.handle_read();
            got.borrow().len() == 2
        });

        let got = got.borrow();
        assert_eq!(got[0].as_ref().and_then(Reply::as_str), Some("first"));
        assert_eq!(got[1].as_ref().and_then(Reply::as_str), Some("second"));
    }

    #[test]
    fn free_flushes_callbacks_with_no_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let client = AsyncClient::connect("127.0.0.1", port).unwrap();

        let seen = Rc::new(Cell::new(0));
        let s = seen.clone();
        client
            .command(
                "PING",
                Some(Box::new(move |_: &AsyncClient, slot: &mut Option<Reply>| {
                    assert!(slot.is_none());
                    s.set(s.get() + 1);
                })),
            )
            .unwrap();

        let disconnected = Rc::new(Cell::new(false));
        let d = disconnected.clone();
        client.set_disconnect_callback(Some(Rc::new(move |_: &AsyncClient, res: Result<(), ClientError>| {
            assert!(res.is_ok());
            d.set(true);
        })));

        client.free();
        assert_eq!(seen.get(), 1);
        assert!(disconnected.get());
        assert!(!client.is_open());
        assert_eq!(client.command("PING", None), Err(ClientError::NotConnected));
    }

    #[test]
    fn empty_command_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let client = AsyncClient::connect("127.0.0.1", port).unwrap();
        assert_eq!(client.command("   ", None), Err(ClientError::EmptyCommand));
        assert_eq!(client.pending_commands(), 0);
    }
}
