//! Blocking-style disk I/O and remote store commands for cooperative tasks.
//!
//! Tasks run on a small single-threaded [`executor::Runtime`]. Two bridges let
//! them call into strictly asynchronous machinery as if it were blocking:
//!
//! - [`disk::DiskBridge`] queues reads, writes and syncs on io_uring and wakes
//!   the issuing task when its own completion arrives.
//! - [`store::attach`] drives a callback-based RESP client from a reactor
//!   fiber so that [`store::Attachment::command`] can be awaited.
//!
//! ```no_run
//! use pluvio_bridge::disk::DiskBridge;
//! use pluvio_bridge::executor::{run, set_runtime, Runtime};
//! use std::os::fd::AsRawFd;
//!
//! let runtime = Runtime::new(1024);
//! set_runtime(runtime.clone());
//! run(async {
//!     let bridge = DiskBridge::new().unwrap();
//!     let file = std::fs::File::open("/etc/hostname").unwrap();
//!     let (n, buf) = bridge.pread(file.as_raw_fd(), vec![0; 64], 0).await.unwrap();
//!     println!("{}", String::from_utf8_lossy(&buf[..n]));
//!     bridge.shutdown().await;
//! });
//! ```

pub mod config;
pub mod disk;
pub mod error;
pub mod executor;
pub mod notify;
pub mod poll;
pub mod reactor;
pub mod select;
pub mod store;
pub mod sync;
pub mod task;
pub mod timer;

pub use error::{BridgeError, ClientError};
pub use executor::{clear_runtime, get_runtime, run, set_runtime, spawn, spawn_with_name};
