//! Sync configuration.
//!
//! All fields have defaults; a JSON document only needs the keys it wants to
//! override. Durations are written in milliseconds.

use std::path::Path;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::command::limits;
use crate::error::{Result, SyncError};

/// Configuration for connections and the upstream retry loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Size of each outbound buffer handed to the transport.
    pub buffer_size: usize,
    /// Queued blocks per connection below which delivery is strictly FIFO.
    pub queue_fifo_threshold: usize,
    /// Largest ON_BLOCK payload accepted before the frame is malformed.
    pub max_block_len: u32,
    /// Time allowed for a transport connect.
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
    pub retry: RetryConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            buffer_size: 16 * 1024,
            queue_fifo_threshold: 16,
            max_block_len: limits::DEFAULT_MAX_BLOCK_LEN,
            connect_timeout: Duration::from_secs(10),
            retry: RetryConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Parse from JSON and validate.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.buffer_size < limits::MIN_BUFFER_SIZE {
            return Err(SyncError::Config(format!(
                "buffer_size {} is below the minimum of {}",
                self.buffer_size,
                limits::MIN_BUFFER_SIZE
            )));
        }
        if self.retry.min_delay.is_zero() && self.retry.jitter.is_zero() {
            return Err(SyncError::Config("retry window must not be empty".into()));
        }
        Ok(())
    }
}

/// Bounded randomized backoff between connection attempts.
///
/// Each wait is `min_delay + uniform(0, jitter)`: never shorter than
/// `min_delay`, never longer than `min_delay + jitter`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    #[serde(with = "millis")]
    pub min_delay: Duration,
    #[serde(with = "millis")]
    pub jitter: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(500),
            jitter: Duration::from_millis(1500),
        }
    }
}

impl RetryConfig {
    /// Draw the next wait.
    pub fn backoff(&self) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let extra = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.min_delay + Duration::from_millis(extra)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
