//! Session manager options. All durations are microseconds.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::{Error, Result};

pub const DEFAULT_LEASE_TIME_US: i64 = 5_000_000;
pub const DEFAULT_TOLERANCE_TIME_US: i64 = 500_000;
pub const DEFAULT_INTERVAL_TIME_US: i64 = 1_000_000;

/// Connection parameters for the durable record store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreOptions {
    pub user: String,
    pub password: String,
    /// Host, optionally with port.
    pub url: String,
    pub db_name: String,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            password: String::new(),
            url: "localhost".to_string(),
            db_name: "mds_session".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    pub lease_time_us: i64,
    pub tolerance_time_us: i64,
    /// Reaper scan interval.
    pub interval_time_us: i64,
    pub store: StoreOptions,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            lease_time_us: DEFAULT_LEASE_TIME_US,
            tolerance_time_us: DEFAULT_TOLERANCE_TIME_US,
            interval_time_us: DEFAULT_INTERVAL_TIME_US,
            store: StoreOptions::default(),
        }
    }
}

impl SessionOptions {
    /// Defaults overridden by any `SESSION_*` environment variables present.
    pub fn from_env() -> Result<Self> {
        let mut options = Self::default();

        if let Some(v) = env_i64("SESSION_LEASE_TIME_US")? {
            options.lease_time_us = v;
        }
        if let Some(v) = env_i64("SESSION_TOLERANCE_TIME_US")? {
            options.tolerance_time_us = v;
        }
        if let Some(v) = env_i64("SESSION_INTERVAL_TIME_US")? {
            options.interval_time_us = v;
        }
        if let Ok(v) = env::var("SESSION_DB_USER") {
            options.store.user = v;
        }
        if let Ok(v) = env::var("SESSION_DB_PASSWORD") {
            options.store.password = v;
        }
        if let Ok(v) = env::var("SESSION_DB_URL") {
            options.store.url = v;
        }
        if let Ok(v) = env::var("SESSION_DB_NAME") {
            options.store.db_name = v;
        }

        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        if self.lease_time_us <= 0 {
            return Err(Error::Config(format!(
                "lease_time_us must be positive, got {}",
                self.lease_time_us
            )));
        }
        if self.tolerance_time_us < 0 {
            return Err(Error::Config(format!(
                "tolerance_time_us must not be negative, got {}",
                self.tolerance_time_us
            )));
        }
        if self.interval_time_us <= 0 {
            return Err(Error::Config(format!(
                "interval_time_us must be positive, got {}",
                self.interval_time_us
            )));
        }
        if self.store.db_name.is_empty()
            || !self
                .store
                .db_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(Error::Config(format!(
                "db_name must be a non-empty identifier, got {:?}",
                self.store.db_name
            )));
        }
        Ok(())
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_micros(self.interval_time_us.unsigned_abs())
    }
}

fn env_i64(key: &str) -> Result<Option<i64>> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|e| Error::Config(format!("{key}={raw:?}: {e}"))),
        Err(_) => Ok(None),
    }
}
