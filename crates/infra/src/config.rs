//! Engine configuration from environment variables.
//!
//! | Variable | Default |
//! |---|---|
//! | `OUTREACH_BIND_ADDR` | `0.0.0.0:8080` |
//! | `DATABASE_URL` | unset (in-memory stores) |
//! | `OUTREACH_DB_MAX_CONNECTIONS` | `10` |
//! | `OUTREACH_WORKERS` | `4` |
//! | `OUTREACH_POLL_INTERVAL_MS` | `1000` |
//! | `OUTREACH_MAX_IDLE_BACKOFF_MS` | `30000` |
//! | `OUTREACH_IDLE_JITTER` | `0.2` |
//! | `OUTREACH_SEND_PAUSE_MS` | `1000` |
//! | `OUTREACH_SEND_TIMEOUT_SECS` | four fifths of the lease timeout |
//! | `OUTREACH_LEASE_TIMEOUT_SECS` | `300` |
//! | `OUTREACH_REAP_INTERVAL_SECS` | `60` |
//! | `OUTREACH_MONITOR_INTERVAL_SECS` | `30` |
//! | `OUTREACH_MAX_RETRIES` | `3` |
//! | `OUTREACH_RETRY_BASE_DELAY_SECS` | `60` |
//! | `OUTREACH_RETRY_MAX_DELAY_SECS` | `3600` |
//! | `OUTREACH_RETRY_JITTER` | `0.1` |
//! | `OUTREACH_DEFAULT_DAILY_LIMIT` | `200` |
//! | `OUTREACH_DEFAULT_PRIORITY` | `0` |
//! | `OUTREACH_TRACKING_BASE_URL` | unset (no open pixel) |
//! | `OUTREACH_OPERATOR_TOKEN` | unset (operator routes open) |
//! | `OUTREACH_LOG_FORMAT` | `json` (read by `outreach_observability::init`) |

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use outreach_campaigns::{DEFAULT_DAILY_LIMIT, MAX_DAILY_LIMIT};

use crate::dispatcher::DispatcherConfig;
use crate::maintenance::MaintenanceConfig;
use crate::queue::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &'static str, value: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub bind_addr: SocketAddr,
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub dispatcher: DispatcherConfig,
    pub maintenance: MaintenanceConfig,
    /// Upper bound on one transport call. Always below the lease timeout.
    pub send_timeout: Duration,
    pub retry: RetryPolicy,
    pub default_daily_limit: u32,
    pub default_priority: i32,
    pub tracking_base_url: Option<String>,
    pub operator_token: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            database_url: None,
            db_max_connections: 10,
            dispatcher: DispatcherConfig::default(),
            maintenance: MaintenanceConfig::default(),
            send_timeout: default_send_timeout(MaintenanceConfig::default().lease_timeout),
            retry: RetryPolicy::default(),
            default_daily_limit: DEFAULT_DAILY_LIMIT,
            default_priority: 0,
            tracking_base_url: None,
            operator_token: None,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let d = Self::default();

        let dispatcher = DispatcherConfig::default()
            .with_workers(parse_or(&get, "OUTREACH_WORKERS", d.dispatcher.workers)?)
            .with_poll_interval(millis_or(&get, "OUTREACH_POLL_INTERVAL_MS", d.dispatcher.poll_interval)?)
            .with_max_idle_backoff(millis_or(
                &get,
                "OUTREACH_MAX_IDLE_BACKOFF_MS",
                d.dispatcher.max_idle_backoff,
            )?)
            .with_idle_jitter(fraction_or(&get, "OUTREACH_IDLE_JITTER", d.dispatcher.idle_jitter)?)
            .with_send_pause(millis_or(&get, "OUTREACH_SEND_PAUSE_MS", d.dispatcher.send_pause)?);

        let maintenance = MaintenanceConfig {
            lease_timeout: secs_or(&get, "OUTREACH_LEASE_TIMEOUT_SECS", d.maintenance.lease_timeout)?,
            reap_interval: secs_or(&get, "OUTREACH_REAP_INTERVAL_SECS", d.maintenance.reap_interval)?,
            monitor_interval: secs_or(
                &get,
                "OUTREACH_MONITOR_INTERVAL_SECS",
                d.maintenance.monitor_interval,
            )?,
        };

        let send_timeout = match get("OUTREACH_SEND_TIMEOUT_SECS") {
            Some(_) => secs_or(&get, "OUTREACH_SEND_TIMEOUT_SECS", Duration::ZERO)?,
            None => default_send_timeout(maintenance.lease_timeout),
        };
        if send_timeout.is_zero() || send_timeout >= maintenance.lease_timeout {
            return Err(ConfigError::invalid(
                "OUTREACH_SEND_TIMEOUT_SECS",
                &send_timeout.as_secs().to_string(),
                "must be positive and below the lease timeout",
            ));
        }

        let retry = RetryPolicy {
            max_retries: parse_or(&get, "OUTREACH_MAX_RETRIES", d.retry.max_retries)?,
            base_delay: secs_or(&get, "OUTREACH_RETRY_BASE_DELAY_SECS", d.retry.base_delay)?,
            max_delay: secs_or(&get, "OUTREACH_RETRY_MAX_DELAY_SECS", d.retry.max_delay)?,
            jitter: fraction_or(&get, "OUTREACH_RETRY_JITTER", d.retry.jitter)?,
        };
        if retry.max_delay < retry.base_delay {
            return Err(ConfigError::invalid(
                "OUTREACH_RETRY_MAX_DELAY_SECS",
                &retry.max_delay.as_secs().to_string(),
                "must not be below the base delay",
            ));
        }

        let default_daily_limit: u32 =
            parse_or(&get, "OUTREACH_DEFAULT_DAILY_LIMIT", d.default_daily_limit)?;
        if !(1..=MAX_DAILY_LIMIT).contains(&default_daily_limit) {
            return Err(ConfigError::invalid(
                "OUTREACH_DEFAULT_DAILY_LIMIT",
                &default_daily_limit.to_string(),
                format!("must be between 1 and {MAX_DAILY_LIMIT}"),
            ));
        }

        Ok(Self {
            bind_addr: parse_or(&get, "OUTREACH_BIND_ADDR", d.bind_addr)?,
            database_url: get("DATABASE_URL"),
            db_max_connections: parse_or(&get, "OUTREACH_DB_MAX_CONNECTIONS", d.db_max_connections)?,
            dispatcher,
            maintenance,
            send_timeout,
            retry,
            default_daily_limit,
            default_priority: parse_or(&get, "OUTREACH_DEFAULT_PRIORITY", d.default_priority)?,
            tracking_base_url: get("OUTREACH_TRACKING_BASE_URL"),
            operator_token: get("OUTREACH_OPERATOR_TOKEN"),
        })
    }
}

fn default_send_timeout(lease_timeout: Duration) -> Duration {
    lease_timeout * 4 / 5
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(raw) => raw
            .parse()
            .map_err(|e: T::Err| ConfigError::invalid(key, &raw, e.to_string())),
        None => Ok(default),
    }
}

fn secs_or(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    parse_or(get, key, default.as_secs()).map(Duration::from_secs)
}

fn millis_or(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    parse_or(get, key, default.as_millis() as u64).map(Duration::from_millis)
}

fn fraction_or(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: f64,
) -> Result<f64, ConfigError> {
    let value: f64 = parse_or(get, key, default)?;
    if !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::invalid(key, &value.to_string(), "must be between 0 and 1"));
    }
    Ok(value)
}
