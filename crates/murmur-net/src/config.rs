//! Gateway configuration loaded from environment variables.
//!
//! Every setting has a default so a client can start against a local
//! broker with zero configuration.

use std::time::Duration;

use murmur_shared::constants::{
    DEFAULT_BROKERS, DEFAULT_CHUNK_SIZE, DEFAULT_CLIENT_ID, DEFAULT_CONNECTION_TIMEOUT_MS,
    DEFAULT_PRESENCE_REFRESH_SECS, DEFAULT_REQUEST_TIMEOUT_MS, DEFAULT_ROUTER_SWEEP_SECS,
    DEFAULT_TRANSFER_TTL_SECS,
};

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Kafka bootstrap servers.
    /// Env: `KAFKA_BROKER`
    /// Default: `localhost:9092`
    pub brokers: String,

    /// Client id reported to the broker.
    /// Env: `KAFKA_CLIENT_ID`
    /// Default: `murmur-chat`
    pub client_id: String,

    /// Bound on establishing the producer, consumer and admin connections.
    /// Env: `CONNECTION_TIMEOUT_MS`
    /// Default: 3000 ms
    pub connection_timeout: Duration,

    /// Broker-level request timeout (publish, admin queries).
    /// Env: `REQUEST_TIMEOUT_MS`
    /// Default: 30000 ms
    pub request_timeout: Duration,

    /// Raw file bytes per fragment; larger files are chunked.
    /// Env: `CHUNK_SIZE_BYTES`
    /// Default: 768000 (750 KiB)
    pub chunk_size: usize,

    /// Idle lifetime of a partially received transfer.
    /// Env: `TRANSFER_TTL_SECS`
    /// Default: 300 s
    pub transfer_ttl: Duration,

    /// Interval of the background presence refresh; zero disables it.
    /// Env: `PRESENCE_REFRESH_SECS`
    /// Default: 30 s
    pub presence_refresh_interval: Duration,

    /// Interval of router housekeeping (expired transfer eviction).
    /// Env: `ROUTER_SWEEP_SECS`
    /// Default: 30 s
    pub router_sweep_interval: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            brokers: DEFAULT_BROKERS.to_string(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            connection_timeout: Duration::from_millis(DEFAULT_CONNECTION_TIMEOUT_MS),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            chunk_size: DEFAULT_CHUNK_SIZE,
            transfer_ttl: Duration::from_secs(DEFAULT_TRANSFER_TTL_SECS),
            presence_refresh_interval: Duration::from_secs(DEFAULT_PRESENCE_REFRESH_SECS),
            router_sweep_interval: Duration::from_secs(DEFAULT_ROUTER_SWEEP_SECS),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(brokers) = lookup("KAFKA_BROKER") {
            if !brokers.trim().is_empty() {
                config.brokers = brokers;
            }
        }

        if let Some(client_id) = lookup("KAFKA_CLIENT_ID") {
            if !client_id.trim().is_empty() {
                config.client_id = client_id;
            }
        }

        if let Some(ms) = parse_number(&lookup, "CONNECTION_TIMEOUT_MS") {
            config.connection_timeout = Duration::from_millis(ms);
        }

        if let Some(ms) = parse_number(&lookup, "REQUEST_TIMEOUT_MS") {
            config.request_timeout = Duration::from_millis(ms);
        }

        if let Some(bytes) = parse_number(&lookup, "CHUNK_SIZE_BYTES") {
            if bytes == 0 {
                tracing::warn!("CHUNK_SIZE_BYTES must be positive, using default");
            } else {
                config.chunk_size = bytes as usize;
            }
        }

        if let Some(secs) = parse_number(&lookup, "TRANSFER_TTL_SECS") {
            config.transfer_ttl = Duration::from_secs(secs);
        }

        if let Some(secs) = parse_number(&lookup, "PRESENCE_REFRESH_SECS") {
            config.presence_refresh_interval = Duration::from_secs(secs);
        }

        if let Some(secs) = parse_number(&lookup, "ROUTER_SWEEP_SECS") {
            if secs == 0 {
                tracing::warn!("ROUTER_SWEEP_SECS must be positive, using default");
            } else {
                config.router_sweep_interval = Duration::from_secs(secs);
            }
        }

        config
    }
}

fn parse_number(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u64> {
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(n) => Some(n),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Invalid numeric setting, using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();
        assert_eq!(config.brokers, "localhost:9092");
        assert_eq!(config.chunk_size, 750 * 1024);
        assert_eq!(config.connection_timeout, Duration::from_millis(3000));
    }

    #[test]
    fn test_overrides() {
        let config = GatewayConfig::from_lookup(lookup_from(&[
            ("KAFKA_BROKER", "kafka-1:9092,kafka-2:9092"),
            ("CHUNK_SIZE_BYTES", "3000"),
            ("PRESENCE_REFRESH_SECS", "0"),
        ]));
        assert_eq!(config.brokers, "kafka-1:9092,kafka-2:9092");
        assert_eq!(config.chunk_size, 3000);
        assert!(config.presence_refresh_interval.is_zero());
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = GatewayConfig::from_lookup(lookup_from(&[
            ("CHUNK_SIZE_BYTES", "lots"),
            ("ROUTER_SWEEP_SECS", "0"),
            ("CONNECTION_TIMEOUT_MS", "-5"),
        ]));
        let defaults = GatewayConfig::default();
        assert_eq!(config.chunk_size, defaults.chunk_size);
        assert_eq!(config.router_sweep_interval, defaults.router_sweep_interval);
        assert_eq!(config.connection_timeout, defaults.connection_timeout);
    }
}
