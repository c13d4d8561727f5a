use std::{fmt, str::FromStr, time::Duration};

use anyhow::{Context, Result};
use sqlx::postgres::PgConnectOptions;

use crate::{db::models::DeviceSeed, topic::DeviceTopic};

// ---------------------------------------------------------------------------
// SubscribeMode
// ---------------------------------------------------------------------------

/// How the consumer subscribes to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeMode {
    /// One `plant-monitoring/#` filter; the registry decides which messages count.
    Wildcard,
    /// One filter per active device topic in the registry snapshot.
    Registry,
}

impl FromStr for SubscribeMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "wildcard" => Ok(Self::Wildcard),
            "registry" => Ok(Self::Registry),
            other => Err(anyhow::anyhow!("unknown subscribe mode: {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(anyhow::anyhow!("unknown log format: {other:?}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Secret
// ---------------------------------------------------------------------------

/// A string that never shows up in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Secret {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

// ---------------------------------------------------------------------------
// DatabaseConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum DatabaseTarget {
    /// Full connection string from `DATABASE_URL`.
    Url(Secret),
    Parts {
        host: String,
        port: u16,
        user: String,
        password: Secret,
        database: String,
    },
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub target: DatabaseTarget,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    /// Server-side `statement_timeout` applied to every pooled connection.
    pub statement_timeout: Duration,
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self> {
        let target = match std::env::var("DATABASE_URL") {
            Ok(url) if !url.is_empty() => DatabaseTarget::Url(Secret(url)),
            _ => DatabaseTarget::Parts {
                host: required("POSTGRES_DB_HOST")?,
                port: optional("POSTGRES_PORT", "5432")
                    .parse()
                    .context("POSTGRES_PORT must be a valid port number")?,
                user: required("POSTGRES_SUPER_USER")?,
                password: Secret(required("POSTGRES_SUPER_PASSWORD")?),
                database: required("POSTGRES_DB")?,
            },
        };

        Ok(Self {
            target,
            max_connections: optional("DB_MAX_CONNECTIONS", "5")
                .parse()
                .context("DB_MAX_CONNECTIONS must be a positive integer")?,
            acquire_timeout: Duration::from_secs(
                optional("DB_ACQUIRE_TIMEOUT_SECS", "5")
                    .parse()
                    .context("DB_ACQUIRE_TIMEOUT_SECS must be a positive integer")?,
            ),
            statement_timeout: Duration::from_millis(
                optional("DB_STATEMENT_TIMEOUT_MS", "2000")
                    .parse()
                    .context("DB_STATEMENT_TIMEOUT_MS must be a positive integer")?,
            ),
        })
    }

    /// Connection options for the pool, including the statement timeout.
    pub fn connect_options(&self) -> Result<PgConnectOptions> {
        let options = match &self.target {
            DatabaseTarget::Url(url) => url
                .expose()
                .parse::<PgConnectOptions>()
                .context("DATABASE_URL is not a valid postgres connection string")?,
            DatabaseTarget::Parts {
                host,
                port,
                user,
                password,
                database,
            } => PgConnectOptions::new()
                .host(host)
                .port(*port)
                .username(user)
                .password(password.expose())
                .database(database),
        };

        let timeout_ms = self.statement_timeout.as_millis().to_string();
        Ok(options.options([("statement_timeout", timeout_ms.as_str())]))
    }
}

// ---------------------------------------------------------------------------
// MqttConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Secret,
    /// Must stay stable across restarts so the broker keeps the durable session.
    pub client_id: String,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub subscribe_mode: SubscribeMode,
}

impl MqttConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            host: required("MQTT_BROKER_HOST")?,
            port: optional("MQTT_PORT", "1883")
                .parse()
                .context("MQTT_PORT must be a valid port number")?,
            username: required("MQTT_USERNAME")?,
            password: Secret(required("MQTT_PASSWORD")?),
            client_id: optional("MQTT_CLIENT_ID", "plant-telemetry-moisture"),
            keep_alive: Duration::from_secs(
                optional("MQTT_KEEP_ALIVE_SECS", "60")
                    .parse()
                    .context("MQTT_KEEP_ALIVE_SECS must be a positive integer")?,
            ),
            connect_timeout: Duration::from_secs(
                optional("MQTT_CONNECT_TIMEOUT_SECS", "10")
                    .parse()
                    .context("MQTT_CONNECT_TIMEOUT_SECS must be a positive integer")?,
            ),
            subscribe_mode: optional("MQTT_SUBSCRIBE_MODE", "wildcard")
                .parse()
                .context("MQTT_SUBSCRIBE_MODE must be 'wildcard' or 'registry'")?,
        })
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Settings for the long-running consumer process.
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub mqtt: MqttConfig,
    /// Devices reconciled into the store at startup.
    /// Format: `"id:name:location/topic-name,..."`.
    pub device_seeds: Vec<DeviceSeed>,
    pub dashboard_enabled: bool,
    pub server_host: String,
    pub server_port: u16,
    pub log_format: LogFormat,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database: DatabaseConfig::from_env()?,
            mqtt: MqttConfig::from_env()?,
            device_seeds: parse_device_seeds(&optional("DEVICE_SEEDS", ""))?,
            dashboard_enabled: optional("DASHBOARD_ENABLED", "true")
                .parse()
                .context("DASHBOARD_ENABLED must be 'true' or 'false'")?,
            server_host: optional("SERVER_HOST", "0.0.0.0"),
            server_port: optional("SERVER_PORT", "8080")
                .parse()
                .context("SERVER_PORT must be a valid port number")?,
            log_format: log_format_from_env()?,
        })
    }
}

pub fn log_format_from_env() -> Result<LogFormat> {
    optional("LOG_FORMAT", "text")
        .parse()
        .context("LOG_FORMAT must be 'text' or 'json'")
}

/// Seeds from `DEVICE_SEEDS`, used by the CLI `seed` command.
pub fn device_seeds_from_env() -> Result<Vec<DeviceSeed>> {
    parse_device_seeds(&optional("DEVICE_SEEDS", ""))
}

/// Parse `"1:scarlet-star-1:living-room/scarlet-star-1,..."` into device seeds.
///
/// The third field holds the `<location>/<name>` part of the topic; prefix and
/// suffix are fixed. Any malformed entry fails the whole list.
fn parse_device_seeds(raw: &str) -> Result<Vec<DeviceSeed>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let mut fields = entry.splitn(3, ':');
            let (Some(id), Some(name), Some(topic)) = (fields.next(), fields.next(), fields.next())
            else {
                anyhow::bail!(
                    "DEVICE_SEEDS entry must be 'id:name:location/topic-name', got: {entry:?}"
                );
            };
            let id = id
                .trim()
                .parse::<i32>()
                .with_context(|| format!("invalid device id in DEVICE_SEEDS entry {entry:?}"))?;
            let (location, topic_name) = topic.trim().split_once('/').with_context(|| {
                format!("DEVICE_SEEDS topic must be 'location/topic-name', got: {entry:?}")
            })?;
            let name = name.trim();
            if name.is_empty() {
                anyhow::bail!("DEVICE_SEEDS entry has an empty device name: {entry:?}");
            }
            let topic = DeviceTopic::new(location, topic_name)
                .with_context(|| format!("invalid topic in DEVICE_SEEDS entry {entry:?}"))?;
            Ok(DeviceSeed {
                id,
                name: name.to_owned(),
                topic: topic.to_string(),
            })
        })
        .collect()
}

fn required(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("missing required env var: {key}"))
}

fn optional(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_device_seeds_empty() {
        assert!(parse_device_seeds("").unwrap().is_empty());
        assert!(parse_device_seeds(" , ").unwrap().is_empty());
    }

    #[test]
    fn parse_device_seeds_builds_full_topics() {
        let seeds =
            parse_device_seeds("1:scarlet-star-1:living-room/scarlet-star-1,2:basil:kitchen/basil")
                .unwrap();
        assert_eq!(seeds.len(), 2);
        assert_eq!(seeds[0].id, 1);
        assert_eq!(seeds[0].name, "scarlet-star-1");
        assert_eq!(
            seeds[0].topic,
            "plant-monitoring/living-room/scarlet-star-1/telemetry"
        );
        assert_eq!(seeds[1].topic, "plant-monitoring/kitchen/basil/telemetry");
    }

    #[test]
    fn parse_device_seeds_missing_field_errors() {
        let err = parse_device_seeds("1:basil").unwrap_err();
        assert!(err.to_string().contains("id:name:location/topic-name"));
    }

    #[test]
    fn parse_device_seeds_bad_id_errors() {
        let err = parse_device_seeds("one:basil:kitchen/basil").unwrap_err();
        assert!(err.to_string().contains("invalid device id"));
    }

    #[test]
    fn parse_device_seeds_empty_name_errors() {
        for raw in ["1::kitchen/basil", "1: :kitchen/basil"] {
            let err = parse_device_seeds(raw).unwrap_err();
            assert!(err.to_string().contains("empty device name"), "{raw:?} gave {err}");
        }
    }

    #[test]
    fn parse_device_seeds_bad_topic_errors() {
        let err = parse_device_seeds("1:basil:kitchen").unwrap_err();
        assert!(err.to_string().contains("location/topic-name"));

        let err = parse_device_seeds("1:basil:kitchen/shelf/basil").unwrap_err();
        assert!(err.to_string().contains("invalid topic"));
    }

    #[test]
    fn subscribe_mode_from_str() {
        assert_eq!("wildcard".parse::<SubscribeMode>().unwrap(), SubscribeMode::Wildcard);
        assert_eq!("registry".parse::<SubscribeMode>().unwrap(), SubscribeMode::Registry);
        assert!("all".parse::<SubscribeMode>().is_err());
    }

    #[test]
    fn secret_is_redacted_in_debug() {
        let s = Secret("hunter2".to_owned());
        assert_eq!(format!("{s:?}"), "Secret(***)");
        assert_eq!(s.expose(), "hunter2");
    }
}
