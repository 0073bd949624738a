//! Tunables for the disk and store bridges.
//!
//! Both configs follow the builder style: start from `default()` (or
//! `from_env()`), then chain setters.

use std::time::Duration;

/// Default number of disk operations allowed in flight at once.
pub const DEFAULT_QUEUE_DEPTH: u32 = 64;

/// Environment variable overriding [`DiskConfig::queue_depth`].
pub const ENV_IO_DEPTH: &str = "PLUVIO_BRIDGE_IO_DEPTH";
/// Environment variable setting [`DiskConfig::deadline`] in milliseconds.
pub const ENV_IO_DEADLINE_MS: &str = "PLUVIO_BRIDGE_IO_DEADLINE_MS";
/// Environment variable overriding the retry backoff in milliseconds.
pub const ENV_BACKOFF_MS: &str = "PLUVIO_BRIDGE_BACKOFF_MS";

fn env_u64(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("ignoring {}={:?}: not an integer", name, raw);
            None
        }
    }
}

/// Configuration for [`DiskBridge`](crate::disk::DiskBridge).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskConfig {
    /// Maximum operations in flight; also the kernel queue size.
    pub queue_depth: u32,
    /// Pause before retrying after an interrupted submission or a reactor
    /// wait failure.
    pub backoff: Duration,
    /// Per-operation completion deadline; `None` waits indefinitely.
    pub deadline: Option<Duration>,
    /// Interval at which shutdown checks for the reactor's acknowledgement.
    pub shutdown_poll: Duration,
    /// How long shutdown lets cancelled requests drain before failing the
    /// rest with `ECANCELED`.
    pub shutdown_grace: Duration,
}

impl Default for DiskConfig {
    fn default() -> Self {
        DiskConfig {
            queue_depth: DEFAULT_QUEUE_DEPTH,
            backoff: Duration::from_millis(10),
            deadline: None,
            shutdown_poll: Duration::from_millis(10),
            shutdown_grace: Duration::from_secs(1),
        }
    }
}

impl DiskConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `PLUVIO_BRIDGE_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(depth) = env_u64(ENV_IO_DEPTH) {
            match u32::try_from(depth) {
                Ok(d) if d > 0 => config.queue_depth = d,
                _ => tracing::warn!("ignoring {}={}: out of range", ENV_IO_DEPTH, depth),
            }
        }
        if let Some(ms) = env_u64(ENV_IO_DEADLINE_MS) {
            config.deadline = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(ms) = env_u64(ENV_BACKOFF_MS) {
            config.backoff = Duration::from_millis(ms);
        }
        config
    }

    pub fn queue_depth(mut self, depth: u32) -> Self {
        self.queue_depth = depth.max(1);
        self
    }

    pub fn backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn shutdown_poll(mut self, interval: Duration) -> Self {
        self.shutdown_poll = interval;
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

/// Configuration for a store [`Attachment`](crate::store::Attachment).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachConfig {
    /// Pause before the reactor fiber retries after a failed readiness wait.
    pub backoff: Duration,
}

impl Default for AttachConfig {
    fn default() -> Self {
        AttachConfig {
            backoff: Duration::from_millis(10),
        }
    }
}

impl AttachConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(ms) = env_u64(ENV_BACKOFF_MS) {
            config.backoff = Duration::from_millis(ms);
        }
        config
    }

    pub fn backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = DiskConfig::default();
        assert_eq!(config.queue_depth, 64);
        assert_eq!(config.deadline, None);
        assert_eq!(config.backoff, Duration::from_millis(10));
        assert_eq!(config.shutdown_grace, Duration::from_secs(1));
    }

    #[test]
    fn builder_clamps_zero_depth() {
        let config = DiskConfig::new()
            .queue_depth(0)
            .deadline(Some(Duration::from_secs(6)));
        assert_eq!(config.queue_depth, 1);
        assert_eq!(config.deadline, Some(Duration::from_secs(6)));
    }
}
