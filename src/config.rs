//! Session configuration.
//!
//! Passed explicitly to [`Yamux::new`](crate::Yamux::new) or
//! [`Session::new`](crate::Session::new); every session created from it
//! shares the same limits.

use crate::error::{Error, Result};
use crate::protocol::{DEFAULT_MAX_FRAME_SIZE, DEFAULT_WINDOW_SIZE};
use std::time::Duration;

/// Default maximum number of concurrently open streams per session
pub const DEFAULT_MAX_STREAMS: usize = 1000;

/// Default number of inbound streams waiting for `accept_stream()`
pub const DEFAULT_ACCEPT_BACKLOG: usize = 256;

/// Default largest Data payload emitted per frame (16 KB)
pub const DEFAULT_SPLIT_SEND_SIZE: usize = 16 * 1024;

/// Default interval between keepalive pings
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Default deadline for a ping acknowledgment
pub const DEFAULT_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on flushing the final GoAway when the session closes
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Limits and timers for a multiplexed session
#[derive(Debug, Clone)]
pub struct Config {
    /// Per-stream receive window advertised to the peer, and assumed for
    /// the peer's window until it says otherwise
    pub initial_window: u32,

    /// Maximum concurrently open streams (both directions)
    pub max_streams: usize,

    /// Inbound streams queued for `accept_stream()`; SYNs beyond this are reset
    pub accept_backlog: usize,

    /// Ping interval, `None` disables keepalive
    pub keepalive_interval: Option<Duration>,

    /// How long a ping may stay unanswered before the session is torn down
    pub keepalive_timeout: Duration,

    /// Largest Data payload accepted from the peer
    pub max_frame_size: u32,

    /// Largest Data payload sent in one frame
    pub split_send_size: usize,

    /// Defer SYN until the first outbound frame of a locally opened stream
    pub lazy_open: bool,

    /// How long closing waits for queued frames to reach a peer that has
    /// stopped reading
    pub close_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            initial_window: DEFAULT_WINDOW_SIZE,
            max_streams: DEFAULT_MAX_STREAMS,
            accept_backlog: DEFAULT_ACCEPT_BACKLOG,
            keepalive_interval: Some(DEFAULT_KEEPALIVE_INTERVAL),
            keepalive_timeout: DEFAULT_KEEPALIVE_TIMEOUT,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            split_send_size: DEFAULT_SPLIT_SEND_SIZE,
            lazy_open: true,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }
}

impl Config {
    pub fn with_initial_window(mut self, window: u32) -> Self {
        self.initial_window = window;
        self
    }

    pub fn with_max_streams(mut self, max_streams: usize) -> Self {
        self.max_streams = max_streams;
        self
    }

    pub fn with_accept_backlog(mut self, backlog: usize) -> Self {
        self.accept_backlog = backlog;
        self
    }

    pub fn with_keepalive(mut self, interval: Option<Duration>, timeout: Duration) -> Self {
        self.keepalive_interval = interval;
        self.keepalive_timeout = timeout;
        self
    }

    pub fn with_max_frame_size(mut self, max_frame_size: u32) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn with_split_send_size(mut self, split_send_size: usize) -> Self {
        self.split_send_size = split_send_size;
        self
    }

    pub fn with_lazy_open(mut self, lazy_open: bool) -> Self {
        self.lazy_open = lazy_open;
        self
    }

    pub fn with_close_timeout(mut self, close_timeout: Duration) -> Self {
        self.close_timeout = close_timeout;
        self
    }

    /// Check that the limits are usable
    pub fn validate(&self) -> Result<()> {
        if self.initial_window == 0 {
            return Err(Error::InvalidConfig("initial_window must be non-zero".into()));
        }
        if self.max_streams == 0 {
            return Err(Error::InvalidConfig("max_streams must be non-zero".into()));
        }
        if self.accept_backlog == 0 {
            return Err(Error::InvalidConfig("accept_backlog must be non-zero".into()));
        }
        if self.split_send_size == 0 || self.split_send_size > self.max_frame_size as usize {
            return Err(Error::InvalidConfig(format!(
                "split_send_size {} must be in 1..={}",
                self.split_send_size, self.max_frame_size
            )));
        }
        if matches!(self.keepalive_interval, Some(interval) if interval.is_zero()) {
            return Err(Error::InvalidConfig("keepalive_interval must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.initial_window, 256 * 1024);
        assert!(config.lazy_open);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_setters() {
        let config = Config::default()
            .with_max_streams(4)
            .with_accept_backlog(2)
            .with_keepalive(None, Duration::from_secs(1))
            .with_lazy_open(false)
            .with_close_timeout(Duration::from_millis(250));
        assert_eq!(config.max_streams, 4);
        assert_eq!(config.accept_backlog, 2);
        assert_eq!(config.keepalive_interval, None);
        assert!(!config.lazy_open);
        assert_eq!(config.close_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_validate_rejects_bad_limits() {
        assert!(Config::default().with_initial_window(0).validate().is_err());
        assert!(Config::default().with_max_streams(0).validate().is_err());
        assert!(Config::default().with_accept_backlog(0).validate().is_err());
        assert!(Config::default()
            .with_max_frame_size(1024)
            .with_split_send_size(2048)
            .validate()
            .is_err());
        assert!(Config::default()
            .with_keepalive(Some(Duration::ZERO), Duration::from_secs(1))
            .validate()
            .is_err());
    }
}
