use crate::{Error, Result};
use serde::Deserialize;
use std::env;
use std::time::Duration;

/// Default time a suspended session survives before its ephemeral nodes are dropped
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    pub connect_string: String,
    pub session_timeout_ms: u64,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            connect_string: "inmemory".to_string(),
            session_timeout_ms: DEFAULT_SESSION_TIMEOUT.as_millis() as u64,
        }
    }
}

impl CoordinationConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Reads `LEASEHOLD_CONNECT` and `LEASEHOLD_SESSION_TIMEOUT_MS`, keeping
    /// defaults for whatever is unset.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(connect) = env::var("LEASEHOLD_CONNECT") {
            config.connect_string = connect;
        }

        if let Ok(timeout) = env::var("LEASEHOLD_SESSION_TIMEOUT_MS") {
            config.session_timeout_ms = timeout.parse().map_err(|e| {
                Error::Other(anyhow::anyhow!(
                    "Invalid LEASEHOLD_SESSION_TIMEOUT_MS {timeout:?}: {e}"
                ))
            })?;
        }

        Ok(config)
    }
}
