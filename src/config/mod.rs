//! # Configuration Management
//!
//! meshping reads a single TOML file (default `config.toml`). Every section and field has a
//! default, so an empty file is a valid configuration that talks TCP to `192.168.1.50:4403`.
//!
//! ## Sections
//!
//! - **`[meshtastic]`** - how to reach the radio (TCP host/port or serial device)
//! - **`[storage]`** - where the peer directory lives
//! - **`[bot]`** - trigger words, reply cooldown, message size limits
//! - **`[traceroute]`** - pacing, per-user queue cap, response timeout
//! - **`[supervisor]`** - health probe interval, reconnect backoff, periodic resync
//! - **`[logging]`** - level and optional log file
//! - **`[notify]`** - optional webhook for operator notifications
//!
//! ## Environment overrides
//!
//! Container deployments usually configure the bot through the environment. After the file is
//! loaded these variables take precedence:
//!
//! | Variable              | Field                        |
//! |-----------------------|------------------------------|
//! | `CONNECTION_TYPE`     | `meshtastic.connection`      |
//! | `MESHTASTIC_IP`       | `meshtastic.host`            |
//! | `MESHTASTIC_PORT`     | `meshtastic.port`            |
//! | `SERIAL_DEVICE`       | `meshtastic.serial_device`   |
//! | `DATABASE_PATH`       | `storage.peer_db`            |
//! | `DISCORD_WEBHOOK_URL` | `notify.webhook_url`         |
//!
//! ## Example
//!
//! ```rust,no_run
//! use meshping::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = Config::load("config.toml").await?;
//!     config.apply_env_overrides();
//!     config.validate()?;
//!     println!("radio: {}", config.meshtastic.link_params());
//!     Ok(())
//! }
//! ```

use crate::meshtastic::stream::LinkParams;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub meshtastic: MeshtasticConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub bot: BotConfig,
    #[serde(default)]
    pub traceroute: TracerouteConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    Tcp,
    Serial,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshtasticConfig {
    pub connection: ConnectionKind,
    pub host: String,
    pub port: u16,
    pub serial_device: String,
    pub baud_rate: u32,
    /// Seconds to wait for the radio's config dump after connecting.
    pub handshake_timeout_secs: u64,
}

impl Default for MeshtasticConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionKind::Tcp,
            host: "192.168.1.50".to_string(),
            port: 4403,
            serial_device: "/dev/ttyUSB0".to_string(),
            baud_rate: 115200,
            handshake_timeout_secs: 30,
        }
    }
}

impl MeshtasticConfig {
    pub fn link_params(&self) -> LinkParams {
        match self.connection {
            ConnectionKind::Tcp => LinkParams::Tcp {
                host: self.host.clone(),
                port: self.port,
            },
            ConnectionKind::Serial => LinkParams::Serial {
                device: self.serial_device.clone(),
                baud_rate: self.baud_rate,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub peer_db: String,
    /// How often dirty peer records are written to disk.
    pub flush_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            peer_db: "data/peers.json".to_string(),
            flush_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub reply_cooldown_secs: u64,
    /// Words that earn a pong, matched against the whole lower-cased message.
    pub triggers: Vec<String>,
    pub traceroute_command: String,
    /// Only answered in direct messages.
    pub dm_commands: Vec<String>,
    /// Longest inbound message considered, in bytes.
    pub max_inbound_len: usize,
    /// Radio payload limit per outbound chunk, in bytes.
    pub max_message_len: usize,
    pub chunk_gap_ms: u64,
    /// Upper bound for `ping N`.
    pub max_ping_count: u32,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            reply_cooldown_secs: 15,
            triggers: vec!["ping".into(), "hello".into(), "test".into()],
            traceroute_command: "traceroute".into(),
            dm_commands: vec!["help".into(), "/help".into(), "about".into(), "/about".into()],
            max_inbound_len: 200,
            max_message_len: 200,
            chunk_gap_ms: 500,
            max_ping_count: 5,
        }
    }
}

impl BotConfig {
    pub fn reply_cooldown(&self) -> Duration {
        Duration::from_secs(self.reply_cooldown_secs)
    }

    pub fn chunk_gap(&self) -> Duration {
        Duration::from_millis(self.chunk_gap_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TracerouteConfig {
    /// Minimum seconds between two trace dispatches, network wide.
    pub rate_limit_secs: u64,
    pub max_queue_per_user: usize,
    pub timeout_secs: u64,
    pub hop_limit: u32,
}

impl Default for TracerouteConfig {
    fn default() -> Self {
        Self {
            rate_limit_secs: 30,
            max_queue_per_user: 2,
            timeout_secs: 15,
            hop_limit: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub health_interval_secs: u64,
    pub backoff_floor_secs: u64,
    pub backoff_max_secs: u64,
    /// How long startup waits for the first connection before carrying on without it.
    pub connect_timeout_secs: u64,
    pub resync_interval_hours: u64,
    pub purge_after_days: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            health_interval_secs: 10,
            backoff_floor_secs: 2,
            backoff_max_secs: 60,
            connect_timeout_secs: 60,
            resync_interval_hours: 6,
            purge_after_days: 30,
        }
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
            file: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub webhook_url: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown CONNECTION_TYPE '{0}' (expected tcp or serial)")]
    UnknownConnection(String),
    #[error("invalid MESHTASTIC_PORT '{0}'")]
    InvalidPort(String),
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("bot.max_message_len must be at least 16 bytes and at most 228, got {0}")]
    MessageLen(usize),
    #[error("supervisor.backoff_max_secs ({max}) is below backoff_floor_secs ({floor})")]
    Backoff { floor: u64, max: u64 },
    #[error("meshtastic.host is empty")]
    EmptyHost,
}

impl Config {
    /// Load configuration from a TOML file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        Ok(config)
    }

    /// Load `path` if it exists, otherwise start from defaults.
    pub async fn load_or_default(path: &str) -> Result<Self> {
        if fs::try_exists(path).await.unwrap_or(false) {
            Self::load(path).await
        } else {
            log::info!("No config file at {}; using defaults", path);
            Ok(Self::default())
        }
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    pub fn apply_env_overrides(&mut self) {
        if let Err(e) = self.apply_overrides_from(|k| std::env::var(k).ok()) {
            log::warn!("Ignoring environment override: {}", e);
        }
    }

    /// Apply overrides from any key lookup. Stops at the first malformed value.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |k: &str| lookup(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(kind) = get("CONNECTION_TYPE") {
            self.meshtastic.connection = match kind.to_ascii_lowercase().as_str() {
                "tcp" => ConnectionKind::Tcp,
                "serial" => ConnectionKind::Serial,
                _ => return Err(ConfigError::UnknownConnection(kind)),
            };
        }
        if let Some(host) = get("MESHTASTIC_IP") {
            self.meshtastic.host = host;
        }
        if let Some(port) = get("MESHTASTIC_PORT") {
            self.meshtastic.port = port.parse().map_err(|_| ConfigError::InvalidPort(port))?;
        }
        if let Some(dev) = get("SERIAL_DEVICE") {
            self.meshtastic.serial_device = dev;
        }
        if let Some(path) = get("DATABASE_PATH") {
            self.storage.peer_db = path;
        }
        if let Some(url) = get("DISCORD_WEBHOOK_URL") {
            self.notify.webhook_url = Some(url);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.meshtastic.connection == ConnectionKind::Tcp && self.meshtastic.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if !(16..=228).contains(&self.bot.max_message_len) {
            return Err(ConfigError::MessageLen(self.bot.max_message_len));
        }
        let non_zero: [(&'static str, u64); 6] = [
            ("traceroute.max_queue_per_user", self.traceroute.max_queue_per_user as u64),
            ("traceroute.timeout_secs", self.traceroute.timeout_secs),
            ("traceroute.hop_limit", self.traceroute.hop_limit as u64),
            ("supervisor.health_interval_secs", self.supervisor.health_interval_secs),
            ("supervisor.backoff_floor_secs", self.supervisor.backoff_floor_secs),
            ("supervisor.connect_timeout_secs", self.supervisor.connect_timeout_secs),
        ];
        for (field, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }
        if self.supervisor.backoff_max_secs < self.supervisor.backoff_floor_secs {
            return Err(ConfigError::Backoff {
                floor: self.supervisor.backoff_floor_secs,
                max: self.supervisor.backoff_max_secs,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_file_gives_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.meshtastic.port, 4403);
        assert_eq!(cfg.bot.reply_cooldown_secs, 15);
        assert_eq!(cfg.traceroute.rate_limit_secs, 30);
        assert_eq!(cfg.traceroute.max_queue_per_user, 2);
        assert_eq!(cfg.traceroute.timeout_secs, 15);
        assert_eq!(cfg.supervisor.backoff_max_secs, 60);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let cfg: Config = toml::from_str(
            "[meshtastic]\nconnection = \"serial\"\nserial_device = \"/dev/ttyACM0\"\n",
        )
        .unwrap();
        assert_eq!(
            cfg.meshtastic.link_params(),
            LinkParams::Serial {
                device: "/dev/ttyACM0".into(),
                baud_rate: 115200
            }
        );
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("CONNECTION_TYPE", "TCP"),
            ("MESHTASTIC_IP", "10.0.0.7"),
            ("MESHTASTIC_PORT", "4404"),
            ("DATABASE_PATH", "/var/lib/meshping/peers.json"),
            ("DISCORD_WEBHOOK_URL", " "),
        ]
        .into_iter()
        .collect();
        let mut cfg = Config::default();
        cfg.apply_overrides_from(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(cfg.meshtastic.host, "10.0.0.7");
        assert_eq!(cfg.meshtastic.port, 4404);
        assert_eq!(cfg.storage.peer_db, "/var/lib/meshping/peers.json");
        assert!(cfg.notify.webhook_url.is_none());
    }

    #[test]
    fn bad_env_values_are_reported() {
        let mut cfg = Config::default();
        let err = cfg
            .apply_overrides_from(|k| (k == "MESHTASTIC_PORT").then(|| "99999".to_string()))
            .unwrap_err();
        assert_eq!(err, ConfigError::InvalidPort("99999".into()));
        let err = cfg
            .apply_overrides_from(|k| (k == "CONNECTION_TYPE").then(|| "ble".to_string()))
            .unwrap_err();
        assert_eq!(err, ConfigError::UnknownConnection("ble".into()));
    }

    #[test]
    fn validate_rejects_inverted_backoff() {
        let mut cfg = Config::default();
        cfg.supervisor.backoff_floor_secs = 90;
        assert!(matches!(cfg.validate(), Err(ConfigError::Backoff { .. })));
    }

    #[test]
    fn validate_rejects_zero_connect_timeout() {
        let mut cfg = Config::default();
        cfg.supervisor.connect_timeout_secs = 0;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Zero {
                field: "supervisor.connect_timeout_secs"
            })
        ));
    }

    #[test]
    fn default_config_serializes() {
        let text = toml::to_string_pretty(&Config::default()).unwrap();
        assert!(text.contains("[traceroute]"));
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back.bot.triggers, vec!["ping", "hello", "test"]);
    }
}
