//! Environment-driven configuration
//!
//! Every setting has a default so a local broker and database work out of the
//! box. Values are read from the process environment after `dotenv` has loaded
//! any `.env` file; malformed values fail startup instead of being ignored.

use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::worker::DecodeFailurePolicy;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}")]
    Invalid { key: &'static str, value: String },

    #[error("{0} must not be empty")]
    Missing(&'static str),
}

/// Broker (NATS JetStream) settings
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub url: String,
    pub queue: String,
    /// Durable consumer name; derived from the queue when unset
    pub consumer_name: Option<String>,
    /// How long the broker waits for an ack before redelivering
    pub ack_wait: Duration,
}

/// Document store settings
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub url: String,
    /// Replaces the database name in `url` when set
    pub db_name: Option<String>,
    pub collection: String,
    pub max_connections: u32,
    pub min_idle: u32,
    pub connection_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_lifetime_secs: u64,
}

impl StoreConfig {
    /// Connection URL with `db_name` applied.
    pub fn connection_url(&self) -> String {
        let Some(db_name) = self.db_name.as_deref() else {
            return self.url.clone();
        };

        let (base, query) = match self.url.split_once('?') {
            Some((base, query)) => (base, Some(query)),
            None => (self.url.as_str(), None),
        };

        // Keep scheme and authority, replace whatever path follows
        let authority_start = base.find("://").map(|i| i + 3).unwrap_or(0);
        let path_start = base[authority_start..]
            .find('/')
            .map(|i| authority_start + i)
            .unwrap_or(base.len());

        let mut url = format!("{}/{}", &base[..path_start], db_name);
        if let Some(query) = query {
            url.push('?');
            url.push_str(query);
        }
        url
    }
}

/// Relay worker settings
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub decode_failure: DecodeFailurePolicy,
    /// Nak delay after a failed store insert
    pub redelivery_delay: Duration,
    /// Pause before re-subscribing when the delivery stream fails
    pub reconnect_delay: Duration,
    /// Attach text analysis to documents carrying a `text` field
    pub analyze_text: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            decode_failure: DecodeFailurePolicy::DeadLetter { max_attempts: 3 },
            redelivery_delay: Duration::from_millis(1000),
            reconnect_delay: Duration::from_secs(1),
            analyze_text: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub broker: BrokerConfig,
    pub store: StoreConfig,
    pub worker: WorkerConfig,
    pub port: u16,
}

impl RelayConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let queue = env.string("QUEUE_NAME", "mongo_queue")?;

        let broker = BrokerConfig {
            url: env.string("NATS_URL", "nats://localhost:4222")?,
            queue,
            consumer_name: env.optional("NATS_CONSUMER"),
            ack_wait: Duration::from_secs(env.parse("ACK_WAIT_SECS", 30)?),
        };

        let store = StoreConfig {
            url: env.string("DATABASE_URL", "postgres://localhost/docrelay")?,
            db_name: env.optional("DB_NAME"),
            collection: env.string("COLLECTION", "test_collection")?,
            max_connections: env.parse("DB_MAX_CONNECTIONS", 15)?,
            min_idle: env.parse("DB_MIN_IDLE", 1)?,
            connection_timeout_secs: env.parse("DB_CONNECTION_TIMEOUT_SECS", 30)?,
            idle_timeout_secs: 600,
            max_lifetime_secs: 1800,
        };

        let max_attempts = env.parse("DEAD_LETTER_MAX_ATTEMPTS", 3u64)?;
        if max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "DEAD_LETTER_MAX_ATTEMPTS",
                value: "0".to_string(),
            });
        }

        let decode_failure = match env.optional("DECODE_FAILURE_POLICY").as_deref() {
            None | Some("dead-letter") => DecodeFailurePolicy::DeadLetter { max_attempts },
            Some("drop") => DecodeFailurePolicy::Drop,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "DECODE_FAILURE_POLICY",
                    value: other.to_string(),
                })
            }
        };

        let worker = WorkerConfig {
            decode_failure,
            redelivery_delay: Duration::from_millis(env.parse("REDELIVERY_DELAY_MS", 1000)?),
            reconnect_delay: Duration::from_millis(env.parse("RECONNECT_DELAY_MS", 1000)?),
            analyze_text: env.parse("ANALYZE_TEXT", true)?,
        };

        Ok(Self {
            broker,
            store,
            worker,
            port: env.parse("PORT", 8080)?,
        })
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &'static str, default: &str) -> Result<String, ConfigError> {
        match (self.lookup)(key) {
            Some(v) if v.trim().is_empty() => Err(ConfigError::Missing(key)),
            Some(v) => Ok(v.trim().to_string()),
            None => Ok(default.to_string()),
        }
    }

    fn parse<T: FromStr>(&self, key: &'static str, default: T) -> Result<T, ConfigError> {
        match self.optional(key) {
            Some(v) => v
                .parse()
                .map_err(|_| ConfigError::Invalid { key, value: v }),
            None => Ok(default),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<RelayConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RelayConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();

        assert_eq!(config.broker.url, "nats://localhost:4222");
        assert_eq!(config.broker.queue, "mongo_queue");
        assert_eq!(config.broker.consumer_name, None);
        assert_eq!(config.store.collection, "test_collection");
        assert_eq!(config.store.max_connections, 15);
        assert_eq!(config.port, 8080);
        assert!(config.worker.analyze_text);
        assert_eq!(
            config.worker.decode_failure,
            DecodeFailurePolicy::DeadLetter { max_attempts: 3 }
        );
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("NATS_URL", "nats://broker:4222"),
            ("QUEUE_NAME", "task_queue"),
            ("DECODE_FAILURE_POLICY", "drop"),
            ("REDELIVERY_DELAY_MS", "250"),
            ("ANALYZE_TEXT", "false"),
            ("PORT", "9000"),
        ])
        .unwrap();

        assert_eq!(config.broker.url, "nats://broker:4222");
        assert_eq!(config.broker.queue, "task_queue");
        assert_eq!(config.worker.decode_failure, DecodeFailurePolicy::Drop);
        assert_eq!(config.worker.redelivery_delay, Duration::from_millis(250));
        assert!(!config.worker.analyze_text);
        assert_eq!(config.port, 9000);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert_eq!(
            load(&[("PORT", "eighty")]).unwrap_err(),
            ConfigError::Invalid { key: "PORT", value: "eighty".to_string() }
        );
        assert!(load(&[("DECODE_FAILURE_POLICY", "retry")]).is_err());
        assert!(load(&[("DEAD_LETTER_MAX_ATTEMPTS", "0")]).is_err());
        assert_eq!(load(&[("QUEUE_NAME", "  ")]).unwrap_err(), ConfigError::Missing("QUEUE_NAME"));
    }

    #[test]
    fn test_connection_url_applies_db_name() {
        let mut store = load(&[("DATABASE_URL", "postgres://user:pw@db:5432/other?sslmode=disable")])
            .unwrap()
            .store;
        assert_eq!(store.connection_url(), "postgres://user:pw@db:5432/other?sslmode=disable");

        store.db_name = Some("relay".to_string());
        assert_eq!(store.connection_url(), "postgres://user:pw@db:5432/relay?sslmode=disable");

        store.url = "postgres://localhost".to_string();
        assert_eq!(store.connection_url(), "postgres://localhost/relay");
    }
}
