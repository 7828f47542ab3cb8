//! Configuration loading and representation.
//!
//! Everything is read from environment variables; only `DATABASE_URL` is
//! required.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::retry::{BackoffStrategy, RetryPolicy};

pub const DATABASE_URL: &str = "DATABASE_URL";
pub const POOL_MIN_CONNECTIONS: &str = "TENANT_POOL_MIN_CONNECTIONS";
pub const POOL_MAX_CONNECTIONS: &str = "TENANT_POOL_MAX_CONNECTIONS";
pub const POOL_ACQUIRE_TIMEOUT_MS: &str = "TENANT_POOL_ACQUIRE_TIMEOUT_MS";
pub const POOL_IDLE_TIMEOUT_SECS: &str = "TENANT_POOL_IDLE_TIMEOUT_SECS";
pub const RETRY_MAX_ATTEMPTS: &str = "TENANT_RETRY_MAX_ATTEMPTS";
pub const RETRY_BASE_DELAY_MS: &str = "TENANT_RETRY_BASE_DELAY_MS";
pub const RETRY_MAX_DELAY_MS: &str = "TENANT_RETRY_MAX_DELAY_MS";
pub const CLEANUP_AGE_SECS: &str = "TENANT_CLEANUP_AGE_SECS";
pub const CLEANUP_INTERVAL_SECS: &str = "TENANT_CLEANUP_INTERVAL_SECS";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Connection pool bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub min_connections: u32,
    pub max_connections: u32,
    /// How long a caller waits for a free connection before failing.
    pub acquire_timeout: Duration,
    pub idle_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Some(Duration::from_secs(600)),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_connections < 1 {
            return Err(ConfigError::Invalid {
                key: POOL_MIN_CONNECTIONS,
                value: self.min_connections.to_string(),
                reason: "must be at least 1".into(),
            });
        }
        if self.max_connections < self.min_connections {
            return Err(ConfigError::Invalid {
                key: POOL_MAX_CONNECTIONS,
                value: self.max_connections.to_string(),
                reason: format!("must be >= min connections ({})", self.min_connections),
            });
        }
        Ok(())
    }
}

/// Stale-tenant sweep settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupConfig {
    /// Namespaces idle for longer than this are dropped.
    pub age_threshold: Duration,
    /// Time between sweeps.
    pub interval: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            age_threshold: Duration::from_secs(24 * 60 * 60),
            interval: Duration::from_secs(60 * 60),
        }
    }
}

/// Full tenant store configuration.
#[derive(Clone)]
pub struct StoreConfig {
    pub database_url: String,
    pub pool: PoolConfig,
    pub retry: RetryPolicy,
    pub cleanup: CleanupConfig,
}

impl core::fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StoreConfig")
            .field("database_url", &redact_url(&self.database_url))
            .field("pool", &self.pool)
            .field("retry", &self.retry)
            .field("cleanup", &self.cleanup)
            .finish()
    }
}

impl StoreConfig {
    /// Configuration with defaults for everything but the URL.
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            pool: PoolConfig::default(),
            retry: RetryPolicy::default(),
            cleanup: CleanupConfig::default(),
        }
    }

    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup(DATABASE_URL)
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing(DATABASE_URL))?;

        let defaults = Self::new(String::new());

        let pool = PoolConfig {
            min_connections: parse_or(&lookup, POOL_MIN_CONNECTIONS, defaults.pool.min_connections)?,
            max_connections: parse_or(&lookup, POOL_MAX_CONNECTIONS, defaults.pool.max_connections)?,
            acquire_timeout: millis_or(&lookup, POOL_ACQUIRE_TIMEOUT_MS, defaults.pool.acquire_timeout)?,
            idle_timeout: match lookup(POOL_IDLE_TIMEOUT_SECS) {
                // 0 disables idle reaping
                Some(raw) => match parse::<u64>(POOL_IDLE_TIMEOUT_SECS, &raw)? {
                    0 => None,
                    secs => Some(Duration::from_secs(secs)),
                },
                None => defaults.pool.idle_timeout,
            },
        };
        pool.validate()?;

        let retry = RetryPolicy {
            max_attempts: parse_or(&lookup, RETRY_MAX_ATTEMPTS, defaults.retry.max_attempts)?,
            base_delay: millis_or(&lookup, RETRY_BASE_DELAY_MS, defaults.retry.base_delay)?,
            max_delay: millis_or(&lookup, RETRY_MAX_DELAY_MS, defaults.retry.max_delay)?,
            strategy: BackoffStrategy::Exponential,
            jitter: defaults.retry.jitter,
        };
        if retry.base_delay > retry.max_delay {
            return Err(ConfigError::Invalid {
                key: RETRY_BASE_DELAY_MS,
                value: retry.base_delay.as_millis().to_string(),
                reason: format!("must not exceed {RETRY_MAX_DELAY_MS}"),
            });
        }

        let cleanup = CleanupConfig {
            age_threshold: secs_or(&lookup, CLEANUP_AGE_SECS, defaults.cleanup.age_threshold)?,
            interval: secs_or(&lookup, CLEANUP_INTERVAL_SECS, defaults.cleanup.interval)?,
        };
        if cleanup.interval.is_zero() {
            return Err(ConfigError::Invalid {
                key: CLEANUP_INTERVAL_SECS,
                value: "0".into(),
                reason: "must be positive".into(),
            });
        }

        Ok(Self {
            database_url,
            pool,
            retry,
            cleanup,
        })
    }
}

fn parse<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: core::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
        key,
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

fn parse_or<T, F>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: core::fmt::Display,
{
    match lookup(key) {
        Some(raw) => parse(key, &raw),
        None => Ok(default),
    }
}

fn millis_or<F>(lookup: &F, key: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let ms = parse_or(lookup, key, default.as_millis() as u64)?;
    Ok(Duration::from_millis(ms))
}

fn secs_or<F>(lookup: &F, key: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let secs = parse_or(lookup, key, default.as_secs())?;
    Ok(Duration::from_secs(secs))
}

/// Hide the password component of a connection URL.
pub fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let Some((userinfo, host)) = rest.rsplit_once('@') else {
        return url.to_string();
    };
    match userinfo.split_once(':') {
        Some((user, _password)) => format!("{scheme}://{user}:***@{host}"),
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_only_url_is_set() {
        let config = StoreConfig::from_lookup(lookup(&[(DATABASE_URL, "postgres://localhost/app")]))
            .unwrap();

        assert_eq!(config.pool, PoolConfig::default());
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.cleanup, CleanupConfig::default());
    }

    #[test]
    fn missing_url_is_an_error() {
        assert_eq!(
            StoreConfig::from_lookup(lookup(&[])).unwrap_err(),
            ConfigError::Missing(DATABASE_URL)
        );
    }

    #[test]
    fn overrides_are_parsed() {
        let config = StoreConfig::from_lookup(lookup(&[
            (DATABASE_URL, "postgres://localhost/app"),
            (POOL_MIN_CONNECTIONS, "2"),
            (POOL_MAX_CONNECTIONS, "20"),
            (POOL_ACQUIRE_TIMEOUT_MS, "250"),
            (POOL_IDLE_TIMEOUT_SECS, "0"),
            (RETRY_MAX_ATTEMPTS, "5"),
            (CLEANUP_AGE_SECS, "3600"),
        ]))
        .unwrap();

        assert_eq!(config.pool.min_connections, 2);
        assert_eq!(config.pool.max_connections, 20);
        assert_eq!(config.pool.acquire_timeout, Duration::from_millis(250));
        assert_eq!(config.pool.idle_timeout, None);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.cleanup.age_threshold, Duration::from_secs(3600));
    }

    #[test]
    fn invalid_bounds_are_rejected() {
        let err = StoreConfig::from_lookup(lookup(&[
            (DATABASE_URL, "postgres://localhost/app"),
            (POOL_MIN_CONNECTIONS, "0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: POOL_MIN_CONNECTIONS, .. }));

        let err = StoreConfig::from_lookup(lookup(&[
            (DATABASE_URL, "postgres://localhost/app"),
            (POOL_MIN_CONNECTIONS, "5"),
            (POOL_MAX_CONNECTIONS, "2"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: POOL_MAX_CONNECTIONS, .. }));

        let err = StoreConfig::from_lookup(lookup(&[
            (DATABASE_URL, "postgres://localhost/app"),
            (RETRY_MAX_ATTEMPTS, "many"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: RETRY_MAX_ATTEMPTS, .. }));
    }

    #[test]
    fn debug_output_hides_password() {
        let config = StoreConfig::new("postgres://app:s3cret@db:5432/mail");
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("s3cret"));
        assert!(rendered.contains("postgres://app:***@db:5432/mail"));
        assert_eq!(redact_url("postgres://db/mail"), "postgres://db/mail");
    }
}
