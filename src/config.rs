use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use sqlx::postgres::{PgConnectOptions, PgSslMode};
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

const DEFAULT_PROFILE: &str = "dev";
const DEFAULT_CONFIG_PATH: &str = "config/config.json";
const DEFAULT_BROKER: &str = "tcp://localhost:1883";
const DEFAULT_MQTT_PORT: u16 = 1883;
const APPLICATION_NAME: &str = "inverter-mapper";

/// File keys and the environment variables that carry them outside `dev`.
const KEYS: &[(&str, &str)] = &[
    ("MQTTBroker", "MQTT_BROKER"),
    ("MQTTTopic", "MQTT_TOPIC"),
    ("MQTTClientID", "MQTT_CLIENT_ID"),
    ("MQTTUsername", "MQTT_USERNAME"),
    ("MQTTPassword", "MQTT_PASSWORD"),
    ("MQTTKeepAliveSecs", "MQTT_KEEPALIVE_SECS"),
    ("MQTTRetryIntervalSecs", "MQTT_RETRY_INTERVAL_SECS"),
    ("MQTTConnectTimeoutSecs", "MQTT_CONNECT_TIMEOUT_SECS"),
    ("MQTTDisconnectGraceMs", "MQTT_DISCONNECT_GRACE_MS"),
    ("DBHost", "DB_HOST"),
    ("DBPort", "DB_PORT"),
    ("DBUser", "DB_USER"),
    ("DBPassword", "DB_PASSWORD"),
    ("DBName", "DB_NAME"),
    ("DBPoolSize", "DB_POOL_SIZE"),
    ("MaxInflight", "MAPPER_MAX_INFLIGHT"),
    ("AllowedOrigins", "ALLOWED_ORIGINS"),
];

fn config_path() -> PathBuf {
    if let Ok(path) = env::var("MAPPER_CONFIG_PATH") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    PathBuf::from(DEFAULT_CONFIG_PATH)
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
enum SettingValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    List(Vec<SettingValue>),
    Table(HashMap<String, SettingValue>),
}

/// Untyped key/value settings as read from the config file or environment.
/// Validation happens once, in [`Config::from_settings`].
#[derive(Debug, Clone, Default)]
pub struct RawSettings {
    values: HashMap<String, SettingValue>,
}

impl RawSettings {
    /// Collects the known keys through `lookup`; unset or blank variables are
    /// treated as absent.
    pub fn from_env<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let values = KEYS
            .iter()
            .filter_map(|(key, var)| {
                lookup(var)
                    .filter(|value| !value.trim().is_empty())
                    .map(|value| (key.to_string(), SettingValue::Text(value)))
            })
            .collect();
        Self { values }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::warn!(
                path = %path.display(),
                "config file not found; using defaults"
            );
            return Ok(Self::default());
        }
        let mut bytes = std::fs::read(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let values: HashMap<String, SettingValue> = simd_json::from_slice(&mut bytes)
            .map_err(|err| anyhow!("failed to parse config file {}: {err}", path.display()))?;
        Ok(Self { values })
    }

    fn get(&self, key: &str) -> Option<&SettingValue> {
        match self.values.get(key) {
            None | Some(SettingValue::Null) => None,
            Some(value) => Some(value),
        }
    }

    fn text(&self, key: &str) -> Result<Option<String>> {
        match self.get(key) {
            None => Ok(None),
            Some(SettingValue::Text(value)) => {
                let trimmed = value.trim();
                Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
            }
            Some(other) => bail!("{key} must be a string (got {other:?})"),
        }
    }

    fn unsigned(&self, key: &str) -> Result<Option<u64>> {
        match self.get(key) {
            None => Ok(None),
            Some(SettingValue::Integer(value)) => u64::try_from(*value)
                .map(Some)
                .map_err(|_| anyhow!("{key} must not be negative (got {value})")),
            Some(SettingValue::Float(value))
                if value.fract() == 0.0 && *value >= 0.0 && *value <= u64::MAX as f64 =>
            {
                Ok(Some(*value as u64))
            }
            Some(SettingValue::Text(value)) => value
                .trim()
                .parse::<u64>()
                .map(Some)
                .with_context(|| format!("{key} must be a whole number (got `{value}`)")),
            Some(other) => bail!("{key} must be a whole number (got {other:?})"),
        }
    }

    fn positive<T: TryFrom<u64>>(&self, key: &str, default: T) -> Result<T> {
        match self.unsigned(key)? {
            None => Ok(default),
            Some(0) => bail!("{key} must be greater than zero"),
            Some(value) => {
                T::try_from(value).map_err(|_| anyhow!("{key} is out of range (got {value})"))
            }
        }
    }

    fn list(&self, key: &str) -> Result<Vec<String>> {
        let entries = match self.get(key) {
            None => Vec::new(),
            Some(SettingValue::Text(value)) => value.split(',').map(str::to_string).collect(),
            Some(SettingValue::List(items)) => items
                .iter()
                .map(|item| match item {
                    SettingValue::Text(value) => Ok(value.clone()),
                    other => Err(anyhow!("{key} entries must be strings (got {other:?})")),
                })
                .collect::<Result<Vec<_>>>()?,
            Some(other) => bail!("{key} must be a string or a list of strings (got {other:?})"),
        };
        Ok(entries
            .into_iter()
            .map(|entry| entry.trim().to_string())
            .filter(|entry| !entry.is_empty())
            .collect())
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub profile: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_topic: String,
    pub mqtt_client_id: String,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_keepalive_secs: u16,
    pub mqtt_retry_interval_secs: u64,
    pub mqtt_connect_timeout_secs: u64,
    pub mqtt_disconnect_grace_ms: u64,
    pub db_host: String,
    pub db_port: u16,
    pub db_user: String,
    pub db_password: Option<String>,
    pub db_name: String,
    pub db_pool_size: u32,
    pub max_inflight: usize,
    pub allowed_origins: Vec<String>,
}

impl Config {
    /// Reads `config/config.json` (or `MAPPER_CONFIG_PATH`) under the `dev`
    /// profile and the environment under any other `PROFILE`.
    pub fn load() -> Result<Self> {
        let profile = env::var("PROFILE")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_PROFILE.to_string());

        let settings = if profile == DEFAULT_PROFILE {
            let path = config_path();
            tracing::info!(path = %path.display(), "loading config file");
            RawSettings::from_file(&path)?
        } else {
            tracing::info!(profile = %profile, "loading config from environment");
            RawSettings::from_env(|key| env::var(key).ok())
        };

        Self::from_settings(profile, &settings)
    }

    pub fn from_settings(profile: impl Into<String>, settings: &RawSettings) -> Result<Self> {
        let broker = settings
            .text("MQTTBroker")?
            .unwrap_or_else(|| DEFAULT_BROKER.to_string());
        let (mqtt_host, mqtt_port) = parse_broker(&broker)?;

        let db_user = settings
            .text("DBUser")?
            .context("DBUser is required to connect to Postgres")?;
        let db_name = settings
            .text("DBName")?
            .context("DBName is required to connect to Postgres")?;

        Ok(Self {
            profile: profile.into(),
            mqtt_host,
            mqtt_port,
            mqtt_topic: settings
                .text("MQTTTopic")?
                .unwrap_or_else(|| "iot/data".to_string()),
            mqtt_client_id: settings
                .text("MQTTClientID")?
                .unwrap_or_else(|| "edge-node-mapper".to_string()),
            mqtt_username: settings.text("MQTTUsername")?,
            mqtt_password: settings.text("MQTTPassword")?,
            mqtt_keepalive_secs: settings.positive("MQTTKeepAliveSecs", 60)?,
            mqtt_retry_interval_secs: settings.positive("MQTTRetryIntervalSecs", 5)?,
            mqtt_connect_timeout_secs: settings.positive("MQTTConnectTimeoutSecs", 10)?,
            mqtt_disconnect_grace_ms: settings.positive("MQTTDisconnectGraceMs", 250)?,
            db_host: settings
                .text("DBHost")?
                .unwrap_or_else(|| "localhost".to_string()),
            db_port: settings.positive("DBPort", 5432)?,
            db_user,
            db_password: settings.text("DBPassword")?,
            db_name,
            db_pool_size: settings.positive("DBPoolSize", 5)?,
            max_inflight: settings.positive("MaxInflight", 16)?,
            allowed_origins: settings.list("AllowedOrigins")?,
        })
    }

    pub fn postgres_options(&self) -> PgConnectOptions {
        let options = PgConnectOptions::new()
            .host(&self.db_host)
            .port(self.db_port)
            .username(&self.db_user)
            .database(&self.db_name)
            .ssl_mode(PgSslMode::Disable)
            .application_name(APPLICATION_NAME)
            // Readings carry no zone; keep `timestamptz` columns from shifting them.
            .options([("timezone", "UTC")]);
        match &self.db_password {
            Some(password) => options.password(password),
            None => options,
        }
    }

    /// Connection string safe for logs.
    pub fn redacted_dsn(&self) -> String {
        format!(
            "postgres://{}:***@{}:{}/{}",
            self.db_user, self.db_host, self.db_port, self.db_name
        )
    }

    pub fn broker_address(&self) -> String {
        format!("{}:{}", self.mqtt_host, self.mqtt_port)
    }

    pub fn mqtt_keepalive(&self) -> Duration {
        Duration::from_secs(u64::from(self.mqtt_keepalive_secs))
    }

    pub fn mqtt_retry_interval(&self) -> Duration {
        Duration::from_secs(self.mqtt_retry_interval_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.mqtt_connect_timeout_secs)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.mqtt_disconnect_grace_ms)
    }
}

/// Splits a broker address into host and port. Accepts `tcp://`, `mqtt://`
/// or a bare `host[:port]`.
fn parse_broker(raw: &str) -> Result<(String, u16)> {
    let candidate = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("tcp://{raw}")
    };
    let url = Url::parse(&candidate)
        .with_context(|| format!("MQTTBroker `{raw}` is not a valid broker address"))?;
    match url.scheme() {
        "tcp" | "mqtt" => {}
        other => bail!("MQTTBroker scheme `{other}` is not supported; use tcp:// or mqtt://"),
    }
    let host = url
        .host_str()
        .map(|host| host.trim_start_matches('[').trim_end_matches(']'))
        .filter(|host| !host.is_empty())
        .with_context(|| format!("MQTTBroker `{raw}` has no host"))?;
    let port = url.port().unwrap_or(DEFAULT_MQTT_PORT);
    Ok((host.to_string(), port))
}
