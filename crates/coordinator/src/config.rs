//! Outbox configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use broker::RetryPolicy;
use outbox_store::{DEFAULT_TOPIC, OutboxStoreError, PostgresOutboxStore, TopicRouter};
use sqlx::postgres::PgPoolOptions;

use crate::error::{OutboxError, Result};
use crate::reconciler::DEFAULT_CONFIRMATION_SUFFIX;

/// Backoff shape between delivery attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryBackoff {
    None,
    #[default]
    Fixed,
    Exponential,
}

impl FromStr for RetryBackoff {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(RetryBackoff::None),
            "fixed" => Ok(RetryBackoff::Fixed),
            "exponential" => Ok(RetryBackoff::Exponential),
            other => Err(format!("unknown retry backoff '{other}'")),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

/// Outbox configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `OUTBOX_BROKER_URL` (default: `"localhost:9092"`)
/// - `OUTBOX_DEFAULT_TOPIC` (default: `"default-topic"`)
/// - `OUTBOX_RETRY_BACKOFF` (`fixed`, `exponential` or `none`; default: `fixed`)
/// - `OUTBOX_RETRY_ATTEMPTS` (default: `3`)
/// - `OUTBOX_RETRY_DELAY_MS` (default: `5000`)
/// - `OUTBOX_RETRY_MAX_DELAY_MS` (default: `60000`)
/// - `OUTBOX_CONFIRMATION_SUFFIX` (default: `".outbox"`)
/// - `DATABASE_URL` (optional)
/// - `OUTBOX_DB_MAX_CONNECTIONS` (default: `5`)
/// - `RUST_LOG` (default: `"info"`)
/// - `OUTBOX_LOG_FORMAT` (`pretty` or `json`; default: `pretty`)
///
/// Unparseable values fall back to their defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxConfig {
    /// Bootstrap address for the host's [`broker::MessageBroker`] client.
    /// Read by the host when it builds its broker; the in-memory broker
    /// ignores it.
    pub broker_url: String,
    pub default_topic: String,
    pub retry_backoff: RetryBackoff,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    pub retry_max_delay: Duration,
    pub confirmation_suffix: String,
    /// PostgreSQL connection string used by [`Self::connect_store`].
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl OutboxConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Loads configuration through `lookup`, falling back to defaults.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        Self {
            broker_url: lookup("OUTBOX_BROKER_URL").unwrap_or(defaults.broker_url),
            default_topic: lookup("OUTBOX_DEFAULT_TOPIC").unwrap_or(defaults.default_topic),
            retry_backoff: parse_var(&lookup, "OUTBOX_RETRY_BACKOFF")
                .unwrap_or(defaults.retry_backoff),
            retry_attempts: parse_var(&lookup, "OUTBOX_RETRY_ATTEMPTS")
                .unwrap_or(defaults.retry_attempts),
            retry_delay: parse_var(&lookup, "OUTBOX_RETRY_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_delay),
            retry_max_delay: parse_var(&lookup, "OUTBOX_RETRY_MAX_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_max_delay),
            confirmation_suffix: lookup("OUTBOX_CONFIRMATION_SUFFIX")
                .unwrap_or(defaults.confirmation_suffix),
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
            database_max_connections: parse_var(&lookup, "OUTBOX_DB_MAX_CONNECTIONS")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.database_max_connections),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: parse_var(&lookup, "OUTBOX_LOG_FORMAT").unwrap_or(defaults.log_format),
        }
    }

    /// Builds the retry policy described by the `OUTBOX_RETRY_*` settings.
    pub fn retry_policy(&self) -> RetryPolicy {
        match self.retry_backoff {
            RetryBackoff::None => RetryPolicy::None,
            RetryBackoff::Fixed => RetryPolicy::fixed(self.retry_attempts, self.retry_delay),
            RetryBackoff::Exponential => RetryPolicy::exponential(
                self.retry_attempts,
                self.retry_delay,
                self.retry_max_delay,
            ),
        }
    }

    /// Returns a router sending unrouted events to the default topic.
    pub fn topic_router(&self) -> TopicRouter {
        TopicRouter::new(self.default_topic.clone())
    }

    /// Connects to `database_url`, runs the outbox migrations, and returns a
    /// store routing with [`Self::topic_router`].
    ///
    /// Returns `None` when no database is configured.
    pub async fn connect_store(&self) -> Result<Option<PostgresOutboxStore>> {
        let Some(url) = self.database_url.as_deref() else {
            return Ok(None);
        };

        let pool = PgPoolOptions::new()
            .max_connections(self.database_max_connections)
            .connect(url)
            .await
            .map_err(|e| OutboxError::Persistence(OutboxStoreError::Database(e)))?;

        let store = PostgresOutboxStore::with_router(pool, self.topic_router());
        store
            .run_migrations()
            .await
            .map_err(OutboxError::Persistence)?;

        tracing::info!(
            max_connections = self.database_max_connections,
            "Connected outbox store"
        );
        Ok(Some(store))
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    lookup(name).and_then(|v| v.trim().parse().ok())
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            broker_url: "localhost:9092".to_string(),
            default_topic: DEFAULT_TOPIC.to_string(),
            retry_backoff: RetryBackoff::Fixed,
            retry_attempts: 3,
            retry_delay: Duration::from_millis(5000),
            retry_max_delay: Duration::from_millis(60_000),
            confirmation_suffix: DEFAULT_CONFIRMATION_SUFFIX.to_string(),
            database_url: None,
            database_max_connections: 5,
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(vars: &[(&str, &str)]) -> OutboxConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        OutboxConfig::from_vars(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_default_values() {
        let config = config_from(&[]);
        assert_eq!(config, OutboxConfig::default());
        assert_eq!(config.broker_url, "localhost:9092");
        assert_eq!(config.default_topic, "default-topic");
        assert_eq!(config.confirmation_suffix, ".outbox");
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert!(config.database_url.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("OUTBOX_BROKER_URL", "kafka-1:9092,kafka-2:9092"),
            ("OUTBOX_DEFAULT_TOPIC", "events"),
            ("OUTBOX_RETRY_BACKOFF", "Exponential"),
            ("OUTBOX_RETRY_ATTEMPTS", "5"),
            ("OUTBOX_RETRY_DELAY_MS", "250"),
            ("OUTBOX_RETRY_MAX_DELAY_MS", "2000"),
            ("OUTBOX_CONFIRMATION_SUFFIX", "-confirmed"),
            ("DATABASE_URL", "postgres://localhost/app"),
            ("OUTBOX_DB_MAX_CONNECTIONS", "20"),
            ("RUST_LOG", "outbox=debug"),
            ("OUTBOX_LOG_FORMAT", "json"),
        ]);

        assert_eq!(config.broker_url, "kafka-1:9092,kafka-2:9092");
        assert_eq!(config.default_topic, "events");
        assert_eq!(
            config.retry_policy(),
            RetryPolicy::exponential(5, Duration::from_millis(250), Duration::from_secs(2))
        );
        assert_eq!(config.confirmation_suffix, "-confirmed");
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/app"));
        assert_eq!(config.database_max_connections, 20);
        assert_eq!(config.log_level, "outbox=debug");
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = config_from(&[
            ("OUTBOX_RETRY_BACKOFF", "sometimes"),
            ("OUTBOX_RETRY_ATTEMPTS", "many"),
            ("OUTBOX_RETRY_DELAY_MS", "-1"),
            ("OUTBOX_LOG_FORMAT", "xml"),
            ("DATABASE_URL", ""),
            ("OUTBOX_DB_MAX_CONNECTIONS", "0"),
        ]);

        assert_eq!(config, OutboxConfig::default());
    }

    #[test]
    fn test_no_retry() {
        let config = config_from(&[("OUTBOX_RETRY_BACKOFF", "none")]);
        assert_eq!(config.retry_policy(), RetryPolicy::None);
    }

    #[test]
    fn test_topic_router_uses_default_topic() {
        let config = config_from(&[("OUTBOX_DEFAULT_TOPIC", "events")]);
        assert_eq!(config.topic_router().default_topic(), "events");
    }

    #[tokio::test]
    async fn test_connect_store_without_database() {
        let store = OutboxConfig::default().connect_store().await.unwrap();
        assert!(store.is_none());
    }

    #[tokio::test]
    async fn test_connect_store_reports_bad_url() {
        let config = config_from(&[("DATABASE_URL", "not-a-postgres-url")]);
        let err = config.connect_store().await.unwrap_err();
        assert!(matches!(err, OutboxError::Persistence(_)));
    }
}
