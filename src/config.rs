//! Configuration consumed by the coordinator, the correlator and the façade.
//!
//! Values can be built fluently or parsed from JSON:
//!
//! ```
//! use sqlite_share::ShareConfig;
//!
//! let config = ShareConfig::from_json_str(r#"{ "port": 48200, "heartbeat_interval_ms": 250 }"#)
//!     .unwrap();
//! assert_eq!(config.port, 48200);
//! assert_eq!(config.backlog, 128);
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::correlator::MIN_BUSY_TIMEOUT;
use crate::error::{Result, ShareError};
use crate::protocol::{ABSOLUTE_MAX_PAYLOAD_SIZE, DEFAULT_MAX_PAYLOAD_SIZE};

/// Default listen/connect port.
pub const DEFAULT_PORT: u16 = 48100;

/// Default receive buffer size; frames larger than this span several reads.
pub const DEFAULT_RECEIVE_BUFFER_SIZE: usize = 4096;

/// All tunables of a shared connection.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShareConfig {
    /// Database file opened by whichever process becomes the server.
    pub data_source: PathBuf,
    /// Listen/connect host.
    pub address: String,
    /// Listen/connect port.
    pub port: u16,
    /// Accept backlog for the server role.
    pub backlog: u32,
    /// Heartbeat period; 0 disables liveness probing.
    pub heartbeat_interval_ms: u64,
    /// Default per-command timeout; 0 means no limit.
    pub command_timeout_ms: u64,
    /// Silence a waiter tolerates for short requests.
    pub busy_timeout_ms: u64,
    /// How often the server signals "busy" while a request runs.
    pub busy_signal_interval_ms: u64,
    /// Correlator idle-poll slice.
    pub poll_interval_ms: u64,
    /// Fixed size of each socket read.
    pub receive_buffer_size: usize,
    /// Frames declaring a larger payload are rejected.
    pub max_payload_size: u32,
    /// Capacity of the receive and event broadcast streams.
    pub event_capacity: usize,
    /// Automatic reconnect attempts after the server goes away.
    pub reconnect_attempts: u32,
    /// Delay between reconnect attempts.
    pub reconnect_delay_ms: u64,
}

impl Default for ShareConfig {
    fn default() -> Self {
        Self {
            data_source: PathBuf::from("share.db"),
            address: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            backlog: 128,
            heartbeat_interval_ms: 1000,
            command_timeout_ms: 30_000,
            busy_timeout_ms: 5000,
            busy_signal_interval_ms: 400,
            poll_interval_ms: 10,
            receive_buffer_size: DEFAULT_RECEIVE_BUFFER_SIZE,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            event_capacity: 1024,
            reconnect_attempts: 5,
            reconnect_delay_ms: 200,
        }
    }
}

impl ShareConfig {
    /// Create a configuration with defaults for the given database file.
    pub fn new(data_source: impl Into<PathBuf>) -> Self {
        Self {
            data_source: data_source.into(),
            ..Self::default()
        }
    }

    /// Parse and validate a JSON configuration.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: ShareConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.address.is_empty() {
            return Err(ShareError::Config("address must not be empty".into()));
        }
        if self.port == 0 {
            return Err(ShareError::Config("port must not be 0".into()));
        }
        if self.backlog == 0 {
            return Err(ShareError::Config("backlog must be at least 1".into()));
        }
        if self.receive_buffer_size == 0 {
            return Err(ShareError::Config(
                "receive_buffer_size must be at least 1".into(),
            ));
        }
        if self.max_payload_size == 0 || self.max_payload_size > ABSOLUTE_MAX_PAYLOAD_SIZE {
            return Err(ShareError::Config(format!(
                "max_payload_size must be between 1 and {}",
                ABSOLUTE_MAX_PAYLOAD_SIZE
            )));
        }
        if self.event_capacity == 0 {
            return Err(ShareError::Config("event_capacity must be at least 1".into()));
        }
        if self.busy_signal_interval() == Duration::ZERO
            || self.busy_signal_interval() >= MIN_BUSY_TIMEOUT
        {
            return Err(ShareError::Config(format!(
                "busy_signal_interval_ms must be between 1 and {}",
                MIN_BUSY_TIMEOUT.as_millis() - 1
            )));
        }
        if self.busy_timeout() < MIN_BUSY_TIMEOUT {
            return Err(ShareError::Config(format!(
                "busy_timeout_ms must be at least {}",
                MIN_BUSY_TIMEOUT.as_millis()
            )));
        }
        Ok(())
    }

    /// `address:port` as text.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Set the listen/connect host.
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    /// Set the listen/connect port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the heartbeat period.
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval_ms = duration_ms(interval);
        self
    }

    /// Set the default command timeout.
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout_ms = duration_ms(timeout);
        self
    }

    /// Set the busy timeout for short requests.
    pub fn busy_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.busy_timeout_ms = timeout_ms;
        self
    }

    /// Set the receive buffer size.
    pub fn receive_buffer_size(mut self, size: usize) -> Self {
        self.receive_buffer_size = size;
        self
    }

    /// Set the number of reconnect attempts.
    pub fn reconnect_attempts(mut self, attempts: u32) -> Self {
        self.reconnect_attempts = attempts;
        self
    }

    /// Heartbeat period; `None` when disabled.
    pub fn heartbeat(&self) -> Option<Duration> {
        (self.heartbeat_interval_ms > 0).then(|| Duration::from_millis(self.heartbeat_interval_ms))
    }

    /// Default command timeout (zero means no limit).
    pub fn default_command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Busy timeout for short requests.
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// Server busy-signal cadence.
    pub fn busy_signal_interval(&self) -> Duration {
        Duration::from_millis(self.busy_signal_interval_ms)
    }

    /// Correlator poll slice.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Delay between reconnect attempts.
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
