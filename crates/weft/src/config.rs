//! Workspace configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use weft_sync::SyncConfig;

use crate::error::{Result, WeftError};

/// Which time source stamps local writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockMode {
    /// Wall time in 8 ms units, never going backwards.
    #[default]
    System,
    /// A counter starting at zero. Deterministic, for tests.
    Logical,
}

/// Configuration for a [`Workspace`](crate::Workspace).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub sync: SyncConfig,
    pub clock: ClockMode,
    /// How long [`Workspace::open`](crate::Workspace::open) waits for a
    /// resource to come up to date, in milliseconds.
    #[serde(with = "millis")]
    pub open_timeout: Duration,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            sync: SyncConfig::default(),
            clock: ClockMode::System,
            open_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkspaceConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| WeftError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| WeftError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<()> {
        self.sync.validate()?;
        if self.open_timeout.is_zero() {
            return Err(WeftError::Config("open_timeout must be positive".into()));
        }
        Ok(())
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
