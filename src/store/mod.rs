//! Remote store access for cooperative tasks.
//!
//! [`client::AsyncClient`] speaks RESP without ever blocking and reports the
//! readiness it needs through [`client::EventHooks`]. [`attach`] plugs one
//! such client into a reactor fiber so tasks can issue commands and simply
//! await the reply.

pub mod attach;
pub mod client;
pub mod resp;

pub use attach::{
    attach, attach_with_config, connect, free, release_reply, Attachment, NoopLifecycle,
};
pub use client::{AsyncClient, CommandCallback, DefaultLifecycle, EventHooks, ReplyLifecycle};
pub use resp::{Command, Reply, ReplyReader};
