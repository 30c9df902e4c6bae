use crate::error::Result;
use config::builder::DefaultState;
use config::ConfigBuilder;
use serde::{Deserialize, Deserializer};
use std::time::Duration;
use validator::{Validate, ValidationError};

const DEFAULT_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct Settings {
    #[serde(default)]
    #[validate]
    pub idempotency: IdempotencySettings,
    #[serde(default)]
    #[validate]
    pub redis: RedisSettings,
    #[serde(default)]
    #[validate]
    pub kafka: KafkaSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct IdempotencySettings {
    /// Master switch; when off, guarded listeners pass messages straight through.
    pub enabled: bool,
    #[validate]
    pub listener: ListenerSettings,
}

impl Default for IdempotencySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            listener: ListenerSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct ListenerSettings {
    /// Turning this off forces re-consumption; markers are still written.
    pub check_enabled: bool,
    pub persistence_enabled: bool,
    /// Default marker lifetime. Should match the retention of the consumed topics.
    #[serde(deserialize_with = "deserialize_duration")]
    #[validate(custom = "validate_ttl")]
    pub ttl: Duration,
    pub key_prefix: String,
    /// Downgrade admission-phase errors to warnings and admit the message.
    pub suppress_errors: bool,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            check_enabled: true,
            persistence_enabled: true,
            ttl: DEFAULT_TTL,
            key_prefix: String::new(),
            suppress_errors: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct RedisSettings {
    #[validate(length(min = 1))]
    pub url: String,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct KafkaSettings {
    #[validate(length(min = 1))]
    pub brokers: Vec<String>,
    pub topics: Vec<String>,
    /// Consumer group of the host client; part of every marker key.
    #[validate(length(min = 1))]
    pub group_id: String,
    pub fetch_max_wait_ms: i32,
    pub max_poll_records: usize,
}

impl Default for KafkaSettings {
    fn default() -> Self {
        Self {
            brokers: vec!["localhost:9092".to_string()],
            topics: Vec::new(),
            group_id: "listener-idempotency".to_string(),
            fetch_max_wait_ms: 500,
            max_poll_records: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    /// `pretty`, `compact` or `json`.
    pub format: String,
    pub include_target: bool,
    /// Adds source file and line to every event.
    pub include_location: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            include_target: true,
            include_location: false,
        }
    }
}

impl Settings {
    /// Loads `config/default`, `config/local` and `APP__*` environment overrides, in that order.
    pub fn new() -> Result<Self> {
        dotenvy::dotenv().ok();

        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("kafka.brokers")
                    .with_list_parse_key("kafka.topics")
                    .try_parsing(true),
            );

        Self::from_builder(builder)
    }

    pub fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self> {
        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }
}

fn validate_ttl(ttl: &Duration) -> std::result::Result<(), ValidationError> {
    if ttl.as_secs() < 1 {
        return Err(ValidationError::new("ttl_too_short"));
    }
    Ok(())
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DurationRepr {
    Seconds(u64),
    Literal(String),
}

/// Accepts integer seconds or a literal such as `60s`, `7d` or `1h 30m`.
fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    match DurationRepr::deserialize(deserializer)? {
        DurationRepr::Seconds(secs) => Ok(Duration::from_secs(secs)),
        DurationRepr::Literal(literal) => parse_duration(&literal).ok_or_else(|| {
            serde::de::Error::custom(format!("invalid duration literal '{}'", literal))
        }),
    }
}

pub fn parse_duration(literal: &str) -> Option<Duration> {
    let literal = literal.trim();
    if literal.is_empty() {
        return None;
    }
    if literal.bytes().all(|b| b.is_ascii_digit()) {
        return literal.parse().ok().map(Duration::from_secs);
    }

    let bytes = literal.as_bytes();
    let mut total_ms = 0u64;
    let mut idx = 0usize;
    while idx < bytes.len() {
        while idx < bytes.len() && bytes[idx].is_ascii_whitespace() {
            idx += 1;
        }
        if idx >= bytes.len() {
            break;
        }
        let start = idx;
        while idx < bytes.len() && bytes[idx].is_ascii_digit() {
            idx += 1;
        }
        if start == idx {
            return None;
        }
        let value: u64 = literal[start..idx].parse().ok()?;
        let unit_start = idx;
        while idx < bytes.len() && bytes[idx].is_ascii_alphabetic() {
            idx += 1;
        }
        let factor = match literal[unit_start..idx].to_ascii_lowercase().as_str() {
            "ms" => 1,
            "s" => 1_000,
            "m" => 60_000,
            "h" => 3_600_000,
            "d" => 86_400_000,
            "w" => 604_800_000,
            _ => return None,
        };
        total_ms = total_ms.saturating_add(value.saturating_mul(factor));
    }
    Some(Duration::from_millis(total_ms))
}
