//! Task queue configuration.

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{QueueError, QueueResult};

/// Configuration for the task queue system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Broker connection configuration.
    pub connection: ConnectionConfig,

    /// Consumer server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Scheduler configuration.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl QueueConfig {
    /// Create a configuration with server and scheduler defaults.
    pub fn new(connection: ConnectionConfig) -> Self {
        Self {
            connection,
            server: ServerConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

/// Broker connection configuration.
///
/// Immutable once built; shared read-only by the server, scheduler and
/// client. The dial and io timeouts are fixed defaults tuned so a single
/// slow broker operation cannot stall indefinitely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Broker address as `host:port` (port defaults to 6379 when omitted).
    pub address: String,

    /// Optional username.
    #[serde(default)]
    pub username: Option<String>,

    /// Optional password.
    #[serde(default)]
    pub password: Option<String>,

    /// Logical database index.
    #[serde(default)]
    pub db: i64,

    /// Key prefix for all queue-related keys.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Connection establishment timeout in seconds.
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,

    /// Read/write timeout for a single broker round-trip in seconds.
    #[serde(default = "default_io_timeout")]
    pub io_timeout_secs: u64,

    /// Connection pool size.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

impl ConnectionConfig {
    /// Create a connection configuration, validating the address.
    pub fn new(
        address: impl Into<String>,
        username: Option<String>,
        password: Option<String>,
        db: i64,
    ) -> QueueResult<Self> {
        let address = address.into();
        if address.trim().is_empty() {
            return Err(QueueError::Configuration(
                "broker address is empty".to_string(),
            ));
        }

        Ok(Self {
            address,
            username,
            password,
            db,
            key_prefix: default_key_prefix(),
            dial_timeout_secs: default_dial_timeout(),
            io_timeout_secs: default_io_timeout(),
            pool_size: default_pool_size(),
        })
    }

    /// Returns the dial timeout as a Duration.
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    /// Returns the io timeout as a Duration.
    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }

    /// Build the Redis connection descriptor for this configuration.
    pub fn connection_info(&self) -> QueueResult<redis::ConnectionInfo> {
        let (host, port) = match self.address.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    QueueError::Configuration(format!(
                        "invalid port in broker address '{}'",
                        self.address
                    ))
                })?;
                (host.to_string(), port)
            }
            None => (self.address.clone(), 6379),
        };

        Ok(redis::ConnectionInfo {
            addr: redis::ConnectionAddr::Tcp(host, port),
            redis: redis::RedisConnectionInfo {
                db: self.db,
                username: self.username.clone(),
                password: self.password.clone(),
                ..Default::default()
            },
        })
    }
}

/// A named queue and its dispatch weight.
///
/// Weights determine a probabilistic dispatch share, not strict priority.
/// A queue with weight 0 is never serviced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueWeight {
    /// Queue name.
    pub name: String,

    /// Relative dispatch weight.
    pub weight: u32,
}

impl QueueWeight {
    /// Create a named queue weight.
    pub fn new(name: impl Into<String>, weight: u32) -> Self {
        Self {
            name: name.into(),
            weight,
        }
    }
}

/// Consumer server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Number of concurrent task executions.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Queues to service, with their dispatch weights.
    #[serde(default = "default_queues")]
    pub queues: Vec<QueueWeight>,

    /// Polling interval in milliseconds when all queues are empty.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Shutdown drain timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Health-check heartbeat interval in seconds.
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,

    /// Delayed task scan interval in seconds.
    #[serde(default = "default_delayed_check_interval")]
    pub delayed_task_check_interval_secs: u64,

    /// Task execution timeout in seconds (0 = unbounded).
    #[serde(default)]
    pub task_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            queues: default_queues(),
            poll_interval_ms: default_poll_interval(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            health_check_interval_secs: default_health_check_interval(),
            delayed_task_check_interval_secs: default_delayed_check_interval(),
            task_timeout_secs: 0,
        }
    }
}

impl ServerConfig {
    /// Returns the poll interval as a Duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Returns the shutdown timeout as a Duration.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Returns the heartbeat interval as a Duration.
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    /// Returns the delayed task scan interval as a Duration.
    pub fn delayed_task_check_interval(&self) -> Duration {
        Duration::from_secs(self.delayed_task_check_interval_secs)
    }

    /// Returns the task execution timeout, or None when unbounded.
    pub fn task_timeout(&self) -> Option<Duration> {
        (self.task_timeout_secs > 0).then(|| Duration::from_secs(self.task_timeout_secs))
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// IANA timezone name governing cron evaluation.
    ///
    /// When unset, the `TZ` environment variable is consulted; when that is
    /// also absent, UTC is used.
    #[serde(default)]
    pub timezone: Option<String>,

    /// Tick resolution in milliseconds.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timezone: None,
            tick_interval_ms: default_tick_interval(),
        }
    }
}

impl SchedulerConfig {
    /// Returns the tick interval as a Duration.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Resolve the timezone governing cron evaluation.
    ///
    /// An invalid name is a configuration bug, not a runtime condition to
    /// recover from, and fails facade construction.
    pub fn resolve_timezone(&self) -> QueueResult<Tz> {
        let name = match &self.timezone {
            Some(name) => Some(name.clone()),
            None => std::env::var("TZ").ok().filter(|v| !v.is_empty()),
        };

        match name {
            Some(name) => name
                .parse::<Tz>()
                .map_err(|_| QueueError::Configuration(format!("invalid timezone: '{name}'"))),
            None => Ok(Tz::UTC),
        }
    }
}

fn default_key_prefix() -> String {
    "ferroq".to_string()
}

fn default_dial_timeout() -> u64 {
    5
}

fn default_io_timeout() -> u64 {
    3
}

fn default_pool_size() -> usize {
    // Connections are cheap for this broker protocol; round-trips dominate.
    10 * std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1)
}

fn default_concurrency() -> usize {
    10
}

fn default_queues() -> Vec<QueueWeight> {
    vec![
        QueueWeight::new("critical", 6),
        QueueWeight::new("default", 3),
        QueueWeight::new("low", 1),
    ]
}

fn default_poll_interval() -> u64 {
    100
}

fn default_shutdown_timeout() -> u64 {
    10
}

fn default_health_check_interval() -> u64 {
    10
}

fn default_delayed_check_interval() -> u64 {
    5
}

fn default_tick_interval() -> u64 {
    1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_address_rejected() {
        let err = ConnectionConfig::new("", None, None, 0).unwrap_err();
        assert!(matches!(err, QueueError::Configuration(_)));

        let err = ConnectionConfig::new("   ", None, None, 0).unwrap_err();
        assert!(matches!(err, QueueError::Configuration(_)));
    }

    #[test]
    fn test_connection_defaults() {
        let config = ConnectionConfig::new("localhost:6379", None, None, 2).unwrap();
        assert_eq!(config.dial_timeout(), Duration::from_secs(5));
        assert_eq!(config.io_timeout(), Duration::from_secs(3));
        assert_eq!(config.db, 2);
        assert_eq!(config.key_prefix, "ferroq");
    }

    #[test]
    fn test_pool_size_scales_with_parallelism() {
        let config = ConnectionConfig::new("localhost:6379", None, None, 0).unwrap();
        let parallelism = std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(1);
        assert_eq!(config.pool_size, 10 * parallelism);
    }

    #[test]
    fn test_connection_info_parses_port() {
        let config = ConnectionConfig::new("redis.internal:6380", None, None, 1).unwrap();
        let info = config.connection_info().unwrap();
        assert_eq!(
            info.addr,
            redis::ConnectionAddr::Tcp("redis.internal".to_string(), 6380)
        );
        assert_eq!(info.redis.db, 1);
    }

    #[test]
    fn test_connection_info_default_port() {
        let config = ConnectionConfig::new("localhost", None, None, 0).unwrap();
        let info = config.connection_info().unwrap();
        assert_eq!(
            info.addr,
            redis::ConnectionAddr::Tcp("localhost".to_string(), 6379)
        );
    }

    #[test]
    fn test_connection_info_bad_port() {
        let config = ConnectionConfig::new("localhost:not-a-port", None, None, 0).unwrap();
        assert!(config.connection_info().is_err());
    }

    #[test]
    fn test_default_queue_weights() {
        let config = ServerConfig::default();
        assert_eq!(config.concurrency, 10);
        assert_eq!(
            config.queues,
            vec![
                QueueWeight::new("critical", 6),
                QueueWeight::new("default", 3),
                QueueWeight::new("low", 1),
            ]
        );
    }

    #[test]
    fn test_server_intervals() {
        let config = ServerConfig::default();
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(10));
        assert_eq!(config.health_check_interval(), Duration::from_secs(10));
        assert_eq!(config.delayed_task_check_interval(), Duration::from_secs(5));
        assert_eq!(config.task_timeout(), None);
    }

    #[test]
    fn test_resolve_explicit_timezone() {
        let config = SchedulerConfig {
            timezone: Some("Asia/Tokyo".to_string()),
            ..Default::default()
        };
        assert_eq!(config.resolve_timezone().unwrap(), Tz::Asia__Tokyo);
    }

    #[test]
    fn test_resolve_invalid_timezone() {
        let config = SchedulerConfig {
            timezone: Some("Invalid/Zone".to_string()),
            ..Default::default()
        };
        let err = config.resolve_timezone().unwrap_err();
        assert!(matches!(err, QueueError::Configuration(_)));
    }

    #[test]
    fn test_resolve_timezone_env_fallback() {
        // Other tests use explicit timezones, so touching TZ here is safe.
        std::env::remove_var("TZ");
        let config = SchedulerConfig::default();
        assert_eq!(config.resolve_timezone().unwrap(), Tz::UTC);

        std::env::set_var("TZ", "Europe/Berlin");
        assert_eq!(config.resolve_timezone().unwrap(), Tz::Europe__Berlin);

        std::env::set_var("TZ", "Not/AZone");
        assert!(config.resolve_timezone().is_err());
        std::env::remove_var("TZ");
    }
}
