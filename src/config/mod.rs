//! # Configuration Management Module
//!
//! All runtime settings for the relay live in a single TOML file, loaded with
//! [`Config::load`] and checked with [`Config::validate`] before anything else
//! starts. Invalid settings are fatal at startup; nothing downstream re-checks them.
//!
//! ## Configuration Structure
//!
//! - [`DiscordConfig`] - sink credentials (bot token and channel id)
//! - [`ConnectionConfig`] - which transports to run
//! - [`RadioConfig`] - HTTP-reachable radios polled each cycle
//! - [`HttpConfig`] - poll cadence, timeouts, client recycling
//! - [`SerialConfig`] - serial device, health monitoring and reconnect policy
//! - [`FilterConfig`] - which message categories are forwarded
//! - [`DisplayConfig`] - message rendering options
//! - [`StorageConfig`] - de-duplication database location and retention
//! - [`LoggingConfig`] - log level and optional log file
//!
//! ## Configuration File Format
//!
//! ```toml
//! [discord]
//! token = ""          # or DISCORD_BOT_TOKEN
//! channel_id = ""     # or DISCORD_CHANNEL_ID
//!
//! [connection]
//! method = "http"     # http | serial | both
//!
//! [[radios]]
//! name = "Radio"
//! host = "meshtastic.local"
//! port = 80
//!
//! [serial]
//! port = "/dev/ttyUSB0"
//! baud_rate = 115200
//! ```
//!
//! ## Environment Integration
//!
//! Secrets may be supplied through `DISCORD_BOT_TOKEN` and `DISCORD_CHANNEL_ID`,
//! which override the file values.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;

use crate::relay::classifier::Category;

/// Startup configuration problems. Any of these stops the process.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("DISCORD_BOT_TOKEN is required (discord.token)")]
    MissingToken,
    #[error("DISCORD_CHANNEL_ID is required (discord.channel_id)")]
    MissingChannelId,
    #[error("DISCORD_CHANNEL_ID must be a valid integer, got '{0}'")]
    InvalidChannelId(String),
    #[error("no radios configured for HTTP polling")]
    NoRadios,
    #[error("radio #{0} has an empty name or host")]
    IncompleteRadio(usize),
    #[error("duplicate radio name '{0}'")]
    DuplicateRadio(String),
    #[error("serial.port is required when the serial transport is enabled")]
    MissingSerialPort,
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DiscordConfig {
    #[serde(default)]
    pub token: String,
    /// Kept as text so a malformed id is reported instead of failing TOML parsing.
    #[serde(default)]
    pub channel_id: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMethod {
    #[default]
    Http,
    Serial,
    Both,
}

impl ConnectionMethod {
    pub fn uses_http(self) -> bool {
        matches!(self, ConnectionMethod::Http | ConnectionMethod::Both)
    }

    pub fn uses_serial(self) -> bool {
        matches!(self, ConnectionMethod::Serial | ConnectionMethod::Both)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConnectionConfig {
    #[serde(default)]
    pub method: ConnectionMethod,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RadioConfig {
    /// Source name used as part of the de-duplication key.
    pub name: String,
    pub host: String,
    #[serde(default = "default_radio_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

fn default_radio_port() -> u16 {
    80
}

impl RadioConfig {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Label used before the radio has reported its own node number.
    pub fn fallback_label(&self) -> String {
        let name = self
            .display_name
            .as_deref()
            .filter(|d| !d.trim().is_empty())
            .unwrap_or(&self.name);
        format!("{} ({})", name, self.host)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Seconds between poll cycles.
    pub poll_interval_secs: u64,
    /// Per-request timeout.
    pub request_timeout_secs: u64,
    /// Poll `/api/v1/nodeinfo` every N cycles (first cycle always polls it).
    pub nodeinfo_every_cycles: u32,
    /// Rebuild the connection pool after this many seconds.
    pub client_recycle_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 2,
            request_timeout_secs: 10,
            nodeinfo_every_cycles: 30,
            client_recycle_secs: 3600,
        }
    }
}

impl HttpConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn client_recycle(&self) -> Duration {
        Duration::from_secs(self.client_recycle_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Source name for serial-sourced packets.
    #[serde(default = "default_serial_name")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub port: String,
    pub baud_rate: u32,
    /// Read timeout for a single blocking read (ms).
    pub read_timeout_ms: u64,
    /// No decoded packet for this long means the link is considered stalled.
    pub connection_timeout_secs: u64,
    pub health_check_secs: u64,
    pub reconnect_delay_secs: u64,
    /// Consecutive failed connects before the reconnect delay starts doubling.
    pub max_reconnect_attempts: u32,
    /// Capacity of the decoded-packet queue between reader and router.
    pub queue_capacity: usize,
}

fn default_serial_name() -> String {
    "serial".to_string()
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            name: default_serial_name(),
            display_name: None,
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115200,
            read_timeout_ms: 250,
            connection_timeout_secs: 300,
            health_check_secs: 30,
            reconnect_delay_secs: 30,
            max_reconnect_attempts: 5,
            queue_capacity: 256,
        }
    }
}

/// Per-category forwarding switches. Keys match [`Category::filter_key`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FilterConfig {
    pub text_messages: bool,
    pub position_updates: bool,
    pub node_info: bool,
    pub telemetry: bool,
    pub routing: bool,
    pub admin: bool,
    pub detection_sensor: bool,
    pub range_test: bool,
    pub store_forward: bool,
    pub unknown: bool,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            text_messages: true,
            position_updates: true,
            node_info: true,
            telemetry: true,
            routing: false,
            admin: true,
            detection_sensor: true,
            range_test: true,
            store_forward: true,
            unknown: false,
        }
    }
}

impl FilterConfig {
    pub fn allows(&self, category: Category) -> bool {
        match category {
            Category::Text => self.text_messages,
            Category::Position => self.position_updates,
            Category::NodeInfo => self.node_info,
            Category::Telemetry => self.telemetry,
            Category::Routing => self.routing,
            Category::Admin => self.admin,
            Category::DetectionSensor => self.detection_sensor,
            Category::RangeTest => self.range_test,
            Category::StoreForward => self.store_forward,
            Category::Unknown => self.unknown,
        }
    }

    pub fn set(&mut self, category: Category, enabled: bool) {
        let slot = match category {
            Category::Text => &mut self.text_messages,
            Category::Position => &mut self.position_updates,
            Category::NodeInfo => &mut self.node_info,
            Category::Telemetry => &mut self.telemetry,
            Category::Routing => &mut self.routing,
            Category::Admin => &mut self.admin,
            Category::DetectionSensor => &mut self.detection_sensor,
            Category::RangeTest => &mut self.range_test,
            Category::StoreForward => &mut self.store_forward,
            Category::Unknown => &mut self.unknown,
        };
        *slot = enabled;
    }

    pub fn enabled(&self) -> Vec<&'static str> {
        Category::ALL
            .iter()
            .filter(|c| self.allows(**c))
            .map(|c| c.filter_key())
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub show_signal_strength: bool,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            show_signal_strength: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: String,
    /// De-duplication records older than this are purged at startup.
    pub retention_hours: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            retention_hours: 24,
        }
    }
}

impl StorageConfig {
    pub fn db_path(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.data_dir).join("message_tracking")
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours * 3600)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: Some("meshcord.log".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub discord: DiscordConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub radios: Vec<RadioConfig>,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub filters: FilterConfig,
    #[serde(default)]
    pub display: DisplayConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Sink credentials that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedSink {
    pub token: String,
    pub channel_id: u64,
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        Self::from_toml(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))
    }

    pub fn from_toml(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config {
            radios: vec![RadioConfig {
                name: "Radio".to_string(),
                host: "meshtastic.local".to_string(),
                port: 80,
                display_name: None,
            }],
            ..Config::default()
        };
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    /// Apply environment overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides using an arbitrary lookup (tests pass a map instead of the real env).
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = lookup("DISCORD_BOT_TOKEN") {
            self.discord.token = token;
        }
        if let Some(channel) = lookup("DISCORD_CHANNEL_ID") {
            self.discord.channel_id = channel;
        }
    }

    /// Check transport settings and return the parsed sink credentials.
    pub fn validate(&self) -> std::result::Result<ValidatedSink, ConfigError> {
        self.validate_transports()?;
        let token = self.discord.token.trim();
        if token.is_empty() {
            return Err(ConfigError::MissingToken);
        }
        let raw_channel = self.discord.channel_id.trim();
        if raw_channel.is_empty() {
            return Err(ConfigError::MissingChannelId);
        }
        let channel_id = raw_channel
            .parse::<u64>()
            .map_err(|_| ConfigError::InvalidChannelId(raw_channel.to_string()))?;
        Ok(ValidatedSink {
            token: token.to_string(),
            channel_id,
        })
    }

    /// Transport checks only; used on its own for dry runs, which need no credentials.
    pub fn validate_transports(&self) -> std::result::Result<(), ConfigError> {
        let method = self.connection.method;
        if method.uses_http() {
            if self.radios.is_empty() {
                return Err(ConfigError::NoRadios);
            }
            let mut seen = std::collections::HashSet::new();
            for (idx, radio) in self.radios.iter().enumerate() {
                if radio.name.trim().is_empty() || radio.host.trim().is_empty() {
                    return Err(ConfigError::IncompleteRadio(idx));
                }
                if !seen.insert(radio.name.as_str()) {
                    return Err(ConfigError::DuplicateRadio(radio.name.clone()));
                }
            }
            if self.http.poll_interval_secs == 0 {
                return Err(ConfigError::ZeroInterval("http.poll_interval_secs"));
            }
            if self.http.request_timeout_secs == 0 {
                return Err(ConfigError::ZeroInterval("http.request_timeout_secs"));
            }
        }
        if method.uses_serial() {
            if self.serial.port.trim().is_empty() {
                return Err(ConfigError::MissingSerialPort);
            }
            if self.serial.health_check_secs == 0 {
                return Err(ConfigError::ZeroInterval("serial.health_check_secs"));
            }
            if self.serial.connection_timeout_secs == 0 {
                return Err(ConfigError::ZeroInterval("serial.connection_timeout_secs"));
            }
            if self.serial.queue_capacity == 0 {
                return Err(ConfigError::ZeroInterval("serial.queue_capacity"));
            }
        }
        Ok(())
    }

    /// Configured radio by source name.
    pub fn radio(&self, name: &str) -> Option<&RadioConfig> {
        self.radios.iter().find(|r| r.name == name)
    }
}
