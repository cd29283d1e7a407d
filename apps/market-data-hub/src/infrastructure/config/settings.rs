//! Hub Configuration Settings
//!
//! Configuration types for the market data hub, loaded from environment
//! variables. Every value has a default; values that would make the hub
//! unable to deliver anything (zero capacities, partitions or depth) are
//! rejected.

use std::time::Duration;

use crate::application::services::RouterConfig;

/// Server port settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// WebSocket server port.
    pub socket_port: u16,
    /// Event ingest HTTP port.
    pub ingest_port: u16,
    /// Health check HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            socket_port: 8080,
            ingest_port: 8081,
            health_port: 8082,
        }
    }
}

/// Per-connection delivery settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// Frames a connection may have queued before it is dropped.
    pub outbound_queue_capacity: usize,
    /// Longest a single socket write may take before the connection is dropped.
    pub send_timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            outbound_queue_capacity: 256,
            send_timeout: Duration::from_millis(5_000),
        }
    }
}

/// Event router settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterSettings {
    /// Capacity of each partition's event queue.
    pub event_queue_capacity: usize,
    /// Number of router partitions.
    pub partitions: usize,
    /// How often open candles are checked for a finished bucket.
    pub candle_tick_interval: Duration,
    /// Price levels per side in lite order book payloads.
    pub lite_book_depth: usize,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            event_queue_capacity: 4_096,
            partitions: 4,
            candle_tick_interval: Duration::from_millis(1_000),
            lite_book_depth: 20,
        }
    }
}

impl RouterSettings {
    /// Router configuration for these settings.
    #[must_use]
    pub const fn router_config(&self) -> RouterConfig {
        RouterConfig {
            partitions: self.partitions,
            queue_capacity: self.event_queue_capacity,
            candle_tick_interval: self.candle_tick_interval,
            lite_depth: self.lite_book_depth,
        }
    }
}

/// Complete hub configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubConfig {
    /// Server port settings.
    pub server: ServerSettings,
    /// Connection delivery settings.
    pub connection: ConnectionSettings,
    /// Event router settings.
    pub router: RouterSettings,
}

impl HubConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a value is out of range.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// Unset or unparseable keys fall back to their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a value is out of range.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = EnvReader { lookup };
        let server_defaults = ServerSettings::default();
        let connection_defaults = ConnectionSettings::default();
        let router_defaults = RouterSettings::default();

        let server = ServerSettings {
            socket_port: env.parse("MARKET_HUB_SOCKET_PORT", server_defaults.socket_port),
            ingest_port: env.parse("MARKET_HUB_INGEST_PORT", server_defaults.ingest_port),
            health_port: env.parse("MARKET_HUB_HEALTH_PORT", server_defaults.health_port),
        };

        let connection = ConnectionSettings {
            outbound_queue_capacity: env.positive(
                "MARKET_HUB_OUTBOUND_QUEUE_CAPACITY",
                connection_defaults.outbound_queue_capacity,
            )?,
            send_timeout: env.millis(
                "MARKET_HUB_SEND_TIMEOUT_MS",
                connection_defaults.send_timeout,
            )?,
        };

        let router = RouterSettings {
            event_queue_capacity: env.positive(
                "MARKET_HUB_EVENT_QUEUE_CAPACITY",
                router_defaults.event_queue_capacity,
            )?,
            partitions: env.positive("MARKET_HUB_ROUTER_PARTITIONS", router_defaults.partitions)?,
            candle_tick_interval: env.millis(
                "MARKET_HUB_CANDLE_TICK_INTERVAL_MS",
                router_defaults.candle_tick_interval,
            )?,
            lite_book_depth: env.positive(
                "MARKET_HUB_LITE_BOOK_DEPTH",
                router_defaults.lite_book_depth,
            )?,
        };

        Ok(Self {
            server,
            connection,
            router,
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable has a value the hub cannot run with.
    #[error("environment variable {key} has invalid value {value:?}: {reason}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Offending value.
        value: String,
        /// What is wrong with it.
        reason: &'static str,
    },
}

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        (self.lookup)(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn positive(&self, key: &str, default: usize) -> Result<usize, ConfigError> {
        let value = self.parse(key, default);
        if value == 0 {
            return Err(ConfigError::InvalidValue {
                key: key.to_string(),
                value: value.to_string(),
                reason: "must be greater than zero",
            });
        }
        Ok(value)
    }

    fn millis(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        let millis = self.parse(key, u64::try_from(default.as_millis()).unwrap_or(u64::MAX));
        if millis == 0 {
            return Err(ConfigError::InvalidValue {
                key: key.to_string(),
                value: millis.to_string(),
                reason: "must be greater than zero",
            });
        }
        Ok(Duration::from_millis(millis))
    }
}
