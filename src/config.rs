use crate::{Error, Result};
use serde::Deserialize;
use std::env;
use std::time::Duration;

/// How long `LeaseManager::stop` waits for in-flight releases
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

/// Workers draining lease re-checks and releases
pub const DEFAULT_WORKERS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LeaseManagerConfig {
    /// Application name; lease nodes live under its namespace
    pub app_name: String,
    pub shutdown_grace_ms: u64,
    pub workers: usize,
}

impl Default for LeaseManagerConfig {
    fn default() -> Self {
        Self {
            app_name: "leasehold".to_string(),
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE.as_millis() as u64,
            workers: DEFAULT_WORKERS,
        }
    }
}

impl LeaseManagerConfig {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            ..Self::default()
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace_ms = grace.as_millis() as u64;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Reads `LEASEHOLD_APP_NAME`, `LEASEHOLD_SHUTDOWN_GRACE_MS` and
    /// `LEASEHOLD_WORKERS` on top of the defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(app_name) = env::var("LEASEHOLD_APP_NAME") {
            config.app_name = app_name;
        }
        if let Ok(grace) = env::var("LEASEHOLD_SHUTDOWN_GRACE_MS") {
            config.shutdown_grace_ms = parse_var("LEASEHOLD_SHUTDOWN_GRACE_MS", &grace)?;
        }
        if let Ok(workers) = env::var("LEASEHOLD_WORKERS") {
            config.workers = parse_var("LEASEHOLD_WORKERS", &workers)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.app_name.trim_matches('/').is_empty() {
            return Err(Error::Config("app_name must not be empty".to_string()));
        }
        if self.workers == 0 {
            return Err(Error::Config("workers must be at least 1".to_string()));
        }
        Ok(())
    }
}

fn parse_var<T>(name: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| Error::Config(format!("invalid {name} {value:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LeaseManagerConfig::default();
        assert_eq!(config.shutdown_grace(), Duration::from_secs(15));
        assert_eq!(config.workers, DEFAULT_WORKERS);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(LeaseManagerConfig::new("").validate().is_err());
        assert!(LeaseManagerConfig::new("/").validate().is_err());
        assert!(LeaseManagerConfig::new("app")
            .with_workers(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_parse_var_reports_name() {
        let err = parse_var::<u64>("LEASEHOLD_WORKERS", "many").unwrap_err();
        assert!(err.to_string().contains("LEASEHOLD_WORKERS"));
    }
}
