//! Runtime tunables for the execution core.
//!
//! Defaults suit an interactive desktop client; every knob can be
//! overridden through a `QUERYDESK_*` environment variable.

use std::time::Duration;

use crate::error::{DeskError, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// Statement timeout applied to the driver execute call and to every
    /// row fetch.
    pub query_timeout: Duration,

    /// Rows between the first two ROWS_AVAILABLE notifications; doubles
    /// after each emission.
    pub start_batch_size: u64,

    /// Ceiling for the notification batch size.
    pub max_batch_size: u64,

    /// Rows per page exposed by a `PagedView`.
    pub page_size: usize,

    /// Period between connection validity cycles.
    pub check_period: Duration,

    /// Per-connection validity probe timeout.
    pub probe_timeout: Duration,

    /// Concurrent probes per validity cycle.
    pub probe_workers: usize,

    /// Grace period applied twice while stopping the executor.
    pub shutdown_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            query_timeout: Duration::from_secs(30),
            start_batch_size: 100,
            max_batch_size: 5000,
            page_size: 1000,
            check_period: Duration::from_secs(300),
            probe_timeout: Duration::from_secs(10),
            probe_workers: 2,
            shutdown_grace: Duration::from_millis(400),
        }
    }
}

impl Config {
    /// Build a config from the environment, falling back to the defaults
    /// for anything unset.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            query_timeout: Duration::from_secs(env_u64(
                "QUERYDESK_QUERY_TIMEOUT_SECS",
                defaults.query_timeout.as_secs(),
            )?),
            start_batch_size: env_u64("QUERYDESK_START_BATCH_SIZE", defaults.start_batch_size)?,
            max_batch_size: env_u64("QUERYDESK_MAX_BATCH_SIZE", defaults.max_batch_size)?,
            page_size: env_u64("QUERYDESK_PAGE_SIZE", defaults.page_size as u64)? as usize,
            check_period: Duration::from_secs(env_u64(
                "QUERYDESK_CHECK_PERIOD_SECS",
                defaults.check_period.as_secs(),
            )?),
            probe_timeout: Duration::from_secs(env_u64(
                "QUERYDESK_PROBE_TIMEOUT_SECS",
                defaults.probe_timeout.as_secs(),
            )?),
            probe_workers: env_u64("QUERYDESK_PROBE_WORKERS", defaults.probe_workers as u64)?
                as usize,
            shutdown_grace: defaults.shutdown_grace,
        })
    }
}

fn env_u64(name: &str, default: u64) -> Result<u64> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<u64>()
            .map_err(|_| DeskError::Config(format!("{} is not a number: {}", name, raw))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.query_timeout, Duration::from_secs(30));
        assert_eq!(config.start_batch_size, 100);
        assert_eq!(config.max_batch_size, 5000);
        assert_eq!(config.page_size, 1000);
        assert_eq!(config.probe_workers, 2);
    }

    // single test so parallel test threads never race on process env
    #[test]
    fn test_env_override_and_garbage() {
        std::env::set_var("QUERYDESK_PAGE_SIZE", "250");
        let config = Config::from_env().unwrap();
        assert_eq!(config.page_size, 250);

        std::env::set_var("QUERYDESK_PAGE_SIZE", "plenty");
        assert!(Config::from_env().is_err());
        std::env::remove_var("QUERYDESK_PAGE_SIZE");
    }
}
