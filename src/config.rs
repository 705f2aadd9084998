use dotenvy::dotenv;
use std::env;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_TELEMETRY_TOPIC: &str = "motas/telemetria";
pub const DEFAULT_ALERT_TOPIC: &str = "motas/alerta";
pub const DEFAULT_TABLE: &str = "Motas";

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_host: String,
    pub listen_port: u16,
    pub max_packet_size: usize,

    pub database_path: String,
    pub telemetry_table: String,
    pub store_busy_timeout_ms: u64,
    pub ensure_schema: bool,

    pub telemetry_topic: String,
    pub alert_topic: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable {0} is missing or invalid.")]
    MissingOrInvalid(String),
    #[error("Parsing error: {0}")]
    ParsingError(String),
}

impl Config {
    /// Validate timeout values and other critical configurations.
    fn validate(&self) -> Result<(), ConfigError> {
        const MIN_TIMEOUT: u64 = 100;
        const MAX_TIMEOUT: u64 = 1_000_000;
        const MIN_PACKET: usize = 1024;
        const MAX_PACKET: usize = 16 * 1024 * 1024;

        if !(MIN_TIMEOUT..=MAX_TIMEOUT).contains(&self.store_busy_timeout_ms) {
            return Err(ConfigError::ParsingError(format!(
                "STORE_BUSY_TIMEOUT_MS must be between {} and {} ms",
                MIN_TIMEOUT, MAX_TIMEOUT
            )));
        }

        if !(MIN_PACKET..=MAX_PACKET).contains(&self.max_packet_size) {
            return Err(ConfigError::ParsingError(format!(
                "MAX_PACKET_SIZE must be between {} and {} bytes",
                MIN_PACKET, MAX_PACKET
            )));
        }

        if !is_plain_identifier(&self.telemetry_table) {
            return Err(ConfigError::ParsingError(format!(
                "TELEMETRY_TABLE '{}' is not a plain SQL identifier",
                self.telemetry_table
            )));
        }

        for (name, topic) in [
            ("TELEMETRY_TOPIC", &self.telemetry_topic),
            ("ALERT_TOPIC", &self.alert_topic),
        ] {
            if topic.is_empty() || topic.contains(['+', '#']) {
                return Err(ConfigError::ParsingError(format!(
                    "{} must be a non-empty topic without wildcards",
                    name
                )));
            }
        }

        if self.telemetry_topic == self.alert_topic {
            return Err(ConfigError::ParsingError(
                "TELEMETRY_TOPIC and ALERT_TOPIC must differ".to_string(),
            ));
        }

        Ok(())
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok(); // Load environment variables from .env file
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = Self {
            listen_host: lookup("LISTEN_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            listen_port: lookup("LISTEN_PORT")
                .unwrap_or_else(|| "1883".to_string())
                .parse::<u16>()
                .map_err(|_| ConfigError::ParsingError("LISTEN_PORT must be a valid number".to_string()))?,
            max_packet_size: lookup("MAX_PACKET_SIZE")
                .unwrap_or_else(|| "65536".to_string())
                .parse::<usize>()
                .map_err(|_| ConfigError::ParsingError("MAX_PACKET_SIZE must be a valid number".to_string()))?,

            // Store
            database_path: lookup("DATABASE_PATH")
                .filter(|path| !path.trim().is_empty())
                .ok_or_else(|| ConfigError::MissingOrInvalid("DATABASE_PATH".to_string()))?,
            telemetry_table: lookup("TELEMETRY_TABLE").unwrap_or_else(|| DEFAULT_TABLE.to_string()),
            store_busy_timeout_ms: lookup("STORE_BUSY_TIMEOUT_MS")
                .unwrap_or_else(|| "5000".to_string())
                .parse::<u64>()
                .map_err(|_| ConfigError::ParsingError("STORE_BUSY_TIMEOUT_MS must be a valid number".to_string()))?,
            ensure_schema: match lookup("ENSURE_SCHEMA") {
                None => true,
                Some(value) => parse_bool(&value)
                    .ok_or_else(|| ConfigError::ParsingError("ENSURE_SCHEMA must be true or false".to_string()))?,
            },

            // Topics
            telemetry_topic: lookup("TELEMETRY_TOPIC").unwrap_or_else(|| DEFAULT_TELEMETRY_TOPIC.to_string()),
            alert_topic: lookup("ALERT_TOPIC").unwrap_or_else(|| DEFAULT_ALERT_TOPIC.to_string()),
        };

        config.validate()?;

        Ok(config)
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.listen_host, self.listen_port)
    }

    pub fn store_busy_timeout(&self) -> Duration {
        Duration::from_millis(self.store_busy_timeout_ms)
    }
}

/// Configuration for the MQTT ingest listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub address: String,
    pub max_packet_size: usize,
}

impl From<&Config> for ListenerConfig {
    fn from(config: &Config) -> Self {
        Self {
            address: config.listen_address(),
            max_packet_size: config.max_packet_size,
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub(crate) fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
