use std::collections::HashMap;
use std::time::Duration;

use url::Url;

use crate::errors::ConfigError;

pub const CONFIG_URL: &str = "url";
pub const CONFIG_OPERATION_TIMEOUT: &str = "operationTimeout";
pub const CONFIG_CONNECTION_TIMEOUT: &str = "connectionTimeout";
pub const CONFIG_TOPIC: &str = "topic";
pub const CONFIG_SUBSCRIPTION_NAME: &str = "subscriptionName";
pub const CONFIG_SUBSCRIPTION_TYPE: &str = "subscriptionType";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const MAX_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Environment variable holding a YAML parameter mapping for the runner.
pub const PARAMS_ENV: &str = "SOURCE_PARAMS";

/// Raw parameters as handed over by the host.
pub type RawParams = HashMap<String, String>;

/// How consumers attached to the same subscription share delivery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SubscriptionMode {
    #[default]
    Exclusive,
    Shared,
    Failover,
    KeyShared,
}

impl SubscriptionMode {
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.to_lowercase().as_str() {
            "exclusive" => Ok(SubscriptionMode::Exclusive),
            "shared" => Ok(SubscriptionMode::Shared),
            "failover" => Ok(SubscriptionMode::Failover),
            "keyshared" => Ok(SubscriptionMode::KeyShared),
            _ => Err(ConfigError::UnsupportedSubscriptionType {
                value: value.to_string(),
            }),
        }
    }
}

/// Validated connection settings. Only obtainable through [`ConnectionConfig::parse`].
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    urls: Vec<Url>,
    operation_timeout: Duration,
    connection_timeout: Duration,
    topic: String,
    subscription_name: String,
    subscription_mode: SubscriptionMode,
}

impl ConnectionConfig {
    pub fn parse(raw: &RawParams) -> Result<Self, ConfigError> {
        let urls = parse_urls(required(raw, CONFIG_URL)?)?;
        let topic = required(raw, CONFIG_TOPIC)?.to_string();
        let subscription_name = required(raw, CONFIG_SUBSCRIPTION_NAME)?.to_string();

        let subscription_mode = match optional(raw, CONFIG_SUBSCRIPTION_TYPE) {
            Some(value) => SubscriptionMode::parse(value)?,
            None => SubscriptionMode::default(),
        };

        Ok(Self {
            urls,
            operation_timeout: timeout(raw, CONFIG_OPERATION_TIMEOUT)?,
            connection_timeout: timeout(raw, CONFIG_CONNECTION_TIMEOUT)?,
            topic,
            subscription_name,
            subscription_mode,
        })
    }

    pub fn urls(&self) -> &[Url] {
        &self.urls
    }

    pub fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }

    pub fn connection_timeout(&self) -> Duration {
        self.connection_timeout
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn subscription_name(&self) -> &str {
        &self.subscription_name
    }

    pub fn subscription_mode(&self) -> SubscriptionMode {
        self.subscription_mode
    }
}

/// Fills in defaults for every optional parameter the host left out.
pub fn with_defaults(raw: &RawParams) -> RawParams {
    let mut params = raw.clone();
    for (key, value) in [
        (CONFIG_OPERATION_TIMEOUT, "30s"),
        (CONFIG_CONNECTION_TIMEOUT, "30s"),
        (CONFIG_SUBSCRIPTION_TYPE, "exclusive"),
    ] {
        params
            .entry(key.to_string())
            .or_insert_with(|| value.to_string());
    }
    params
}

pub fn load_params(path: Option<&str>) -> Result<RawParams, ConfigError> {
    match path {
        Some(path) => params_from_file(path),
        None => params_from_env(),
    }
}

pub fn params_from_file(path: &str) -> Result<RawParams, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::LoadFailed {
        origin: path.to_string(),
        reason: e.to_string(),
    })?;
    params_from_yaml(path, &content)
}

pub fn params_from_env() -> Result<RawParams, ConfigError> {
    let content = std::env::var(PARAMS_ENV).map_err(|_| ConfigError::LoadFailed {
        origin: PARAMS_ENV.to_string(),
        reason: "environment variable not set".to_string(),
    })?;
    params_from_yaml(PARAMS_ENV, &content)
}

fn params_from_yaml(origin: &str, content: &str) -> Result<RawParams, ConfigError> {
    serde_yaml::from_str(content).map_err(|e| ConfigError::LoadFailed {
        origin: origin.to_string(),
        reason: e.to_string(),
    })
}

fn optional<'a>(raw: &'a RawParams, key: &str) -> Option<&'a str> {
    raw.get(key).map(|v| v.trim()).filter(|v| !v.is_empty())
}

fn required<'a>(raw: &'a RawParams, field: &'static str) -> Result<&'a str, ConfigError> {
    optional(raw, field).ok_or(ConfigError::MissingField { field })
}

fn parse_urls(value: &str) -> Result<Vec<Url>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .map(|u| {
            Url::parse(u).map_err(|e| ConfigError::InvalidUrl {
                url: u.to_string(),
                reason: e.to_string(),
            })
        })
        .collect()
}

fn timeout(raw: &RawParams, field: &'static str) -> Result<Duration, ConfigError> {
    match optional(raw, field) {
        Some(value) => parse_timeout(field, value),
        None => Ok(DEFAULT_TIMEOUT),
    }
}

/// Parses a human-readable duration such as `500ms`, `30s` or `1m 30s`.
/// Zero means "use the default"; values beyond [`MAX_TIMEOUT`] are rejected.
fn parse_timeout(field: &'static str, value: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidDuration {
        field,
        value: value.to_string(),
    };

    match humantime::parse_duration(value).map_err(|_| invalid())? {
        Duration::ZERO => Ok(DEFAULT_TIMEOUT),
        timeout if timeout > MAX_TIMEOUT => Err(invalid()),
        timeout => Ok(timeout),
    }
}
