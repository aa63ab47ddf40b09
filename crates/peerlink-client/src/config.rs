use peerlink_common::protocol::error::{PeerlinkError, Result};
use peerlink_common::transport::{DEFAULT_TIMEOUT, MAX_LINE_SIZE};
use std::time::Duration;

use crate::reconnect::ReconnectConfig;

/// Connection configuration.
///
/// # Default Configuration
///
/// - `timeout`: 10 seconds, applied to connect and to every read and write
/// - `reconnect`: see [`ReconnectConfig`] (5 attempts per peer, 50ms backoff doubling up to 5s)
/// - `max_line_size`: 16 MB
///
/// # Example
///
/// ```rust
/// use peerlink_client::ConnectionConfig;
/// use std::time::Duration;
///
/// let config = ConnectionConfig::default()
///     .with_timeout(Duration::from_secs(2))
///     .with_max_retries(3);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Bound on connect, read and write
    pub timeout: Duration,
    /// Retry and failover behaviour
    pub reconnect: ReconnectConfig,
    /// Longest line accepted from a peer
    pub max_line_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            reconnect: ReconnectConfig::default(),
            max_line_size: MAX_LINE_SIZE,
        }
    }
}

impl ConnectionConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.reconnect.max_retries = max_retries;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_max_line_size(mut self, max_line_size: usize) -> Self {
        self.max_line_size = max_line_size;
        self
    }

    /// Rejects settings a connection cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            return Err(PeerlinkError::InvalidConfig("timeout must be greater than zero".into()));
        }
        if self.max_line_size == 0 {
            return Err(PeerlinkError::InvalidConfig("max_line_size must be greater than zero".into()));
        }
        self.reconnect.validate()
    }
}
