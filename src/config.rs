use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database_url: Option<String>,
    pub aws_region: String,
    #[serde(default = "default_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_batch_size")]
    pub relay_batch_size: u32,
    #[serde(default = "default_interval")]
    pub relay_interval_ms: u64,
    #[serde(default = "default_interval")]
    pub gc_interval_ms: u64,
    #[serde(default = "default_gc_ttl")]
    pub gc_ttl_ms: u64,
    #[serde(default = "default_health_port")]
    pub health_port: u16,
    pub sentry_dsn: Option<String>,
}

fn default_max_connections() -> u32 {
    5
}

fn default_batch_size() -> u32 {
    10
}

fn default_interval() -> u64 {
    1000 // 1 second
}

fn default_gc_ttl() -> u64 {
    24 * 60 * 60 * 1000 // 1 day
}

fn default_health_port() -> u16 {
    8080
}

impl Config {
    pub fn load() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();

        let config = envy::from_env::<Config>()?;

        // The relay binary cannot start without a database
        if config.database_url.is_none() {
            return Err(envy::Error::MissingValue("DATABASE_URL"));
        }

        Ok(config)
    }

    /// Returns the database URL.
    ///
    /// # Panics
    /// Panics if the database_url is not set. This should only be
    /// called after `load()` which validates it.
    pub fn database_url(&self) -> &str {
        self.database_url
            .as_deref()
            .expect("DATABASE_URL is not set")
    }

    pub fn outbox_config(&self) -> Result<OutboxConfig, ConfigError> {
        let config = OutboxConfig {
            relay: RelayConfig {
                batch_size: self.relay_batch_size,
                interval: Duration::from_millis(self.relay_interval_ms),
            },
            collector: CollectorConfig {
                interval: Duration::from_millis(self.gc_interval_ms),
                retention: Duration::from_millis(self.gc_ttl_ms),
            },
        };
        config.validate()?;
        Ok(config)
    }
}

/// Message relay settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayConfig {
    /// Maximum events fetched per cycle.
    pub batch_size: u32,
    pub interval: Duration,
}

impl RelayConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::NotPositive("relay batch size"));
        }
        if self.interval.is_zero() {
            return Err(ConfigError::NotPositive("relay interval"));
        }
        Ok(())
    }
}

/// Garbage collector settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectorConfig {
    pub interval: Duration,
    /// How long processed events are kept after `sent_at`.
    pub retention: Duration,
}

impl CollectorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval.is_zero() {
            return Err(ConfigError::NotPositive("garbage collector interval"));
        }
        if self.retention.is_zero() {
            return Err(ConfigError::NotPositive("garbage collector ttl"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboxConfig {
    pub relay: RelayConfig,
    pub collector: CollectorConfig,
}

impl OutboxConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.relay.validate()?;
        self.collector.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn applies_defaults() {
        let config: Config = envy::from_iter(vars(&[
            ("DATABASE_URL", "postgres://localhost/outbox"),
            ("AWS_REGION", "eu-west-1"),
        ]))
        .unwrap();

        assert_eq!(config.database_url(), "postgres://localhost/outbox");
        assert_eq!(config.db_max_connections, 5);
        assert_eq!(config.relay_batch_size, 10);
        assert_eq!(config.health_port, 8080);
        assert_eq!(config.sentry_dsn, None);

        let outbox = config.outbox_config().unwrap();
        assert_eq!(outbox.relay.interval, Duration::from_secs(1));
        assert_eq!(outbox.collector.interval, Duration::from_secs(1));
        assert_eq!(outbox.collector.retention, Duration::from_secs(86_400));
    }

    #[test]
    fn reads_overrides() {
        let config: Config = envy::from_iter(vars(&[
            ("AWS_REGION", "eu-west-1"),
            ("RELAY_BATCH_SIZE", "50"),
            ("RELAY_INTERVAL_MS", "250"),
            ("GC_INTERVAL_MS", "60000"),
            ("GC_TTL_MS", "1000"),
        ]))
        .unwrap();

        let outbox = config.outbox_config().unwrap();
        assert_eq!(outbox.relay.batch_size, 50);
        assert_eq!(outbox.relay.interval, Duration::from_millis(250));
        assert_eq!(outbox.collector.interval, Duration::from_secs(60));
        assert_eq!(outbox.collector.retention, Duration::from_secs(1));
    }

    #[test]
    fn rejects_zero_settings() {
        for (key, expected) in [
            ("RELAY_BATCH_SIZE", "relay batch size"),
            ("RELAY_INTERVAL_MS", "relay interval"),
            ("GC_INTERVAL_MS", "garbage collector interval"),
            ("GC_TTL_MS", "garbage collector ttl"),
        ] {
            let config: Config =
                envy::from_iter(vars(&[("AWS_REGION", "eu-west-1"), (key, "0")])).unwrap();
            assert_eq!(
                config.outbox_config(),
                Err(ConfigError::NotPositive(expected)),
                "{key}"
            );
        }
    }

    #[test]
    fn rejects_negative_values() {
        let result: Result<Config, _> =
            envy::from_iter(vars(&[("AWS_REGION", "eu-west-1"), ("GC_TTL_MS", "-5")]));
        assert!(result.is_err());
    }
}
