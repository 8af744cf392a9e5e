//! Configuration file handling for the world server binary.
//!
//! The TOML file is loaded (or created with defaults), patched with CLI
//! overrides, validated and finally turned into a
//! [`meridian_server::ServerConfig`].

use anyhow::{bail, Context, Result};
use meridian_core::{opcodes, LinkKind, DEFAULT_MAX_FRAME};
use meridian_server::{ListenerConfig, ServerConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Application configuration loaded from TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Dispatch and framing settings
    #[serde(default)]
    pub server: ServerSettings,
    /// Endpoints to listen on
    #[serde(default)]
    pub listeners: ListenerSettings,
    /// Logging configuration settings
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Number of I/O partitions (0 means one per CPU core)
    pub partitions: usize,
    /// Largest accepted frame in bytes
    pub max_frame_size: usize,
    /// Seconds a new connection has to finish the key exchange
    pub bootstrap_timeout_secs: u64,
    /// Seconds an established connection may stay silent
    pub idle_timeout_secs: u64,
    /// Seconds shutdown waits for queues to drain
    pub shutdown_grace_secs: u64,
    /// Maximum number of concurrent connections per listener
    pub max_connections: usize,
    /// Type codes accepted from sessions outside any region
    pub lobby_allow: Vec<u16>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            partitions: 0,
            max_frame_size: DEFAULT_MAX_FRAME,
            bootstrap_timeout_secs: 10,
            idle_timeout_secs: 300,
            shutdown_grace_secs: 5,
            max_connections: 5000,
            lobby_allow: opcodes::DEFAULT_LOBBY_ALLOW.to_vec(),
        }
    }
}

/// Bind addresses per link kind. Inside a `[listeners]` section a missing
/// entry disables that listener; without the section all four are opened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerSettings {
    pub game: Option<String>,
    pub ai: Option<String>,
    pub login: Option<String>,
    pub admin: Option<String>,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            game: Some("0.0.0.0:7000".to_string()),
            ai: Some("127.0.0.1:7101".to_string()),
            login: Some("127.0.0.1:7102".to_string()),
            admin: Some("127.0.0.1:7103".to_string()),
        }
    }
}

impl ListenerSettings {
    fn entries(&self) -> [(LinkKind, Option<&str>); 4] {
        [
            (LinkKind::GameClient, self.game.as_deref()),
            (LinkKind::AiLink, self.ai.as_deref()),
            (LinkKind::LoginLink, self.login.as_deref()),
            (LinkKind::AdminPanel, self.admin.as_deref()),
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    /// Whether to output logs in JSON format
    pub json_format: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file doesn't exist, writes the defaults there and returns them.
    pub async fn load_from_file(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let config: AppConfig = toml::from_str(&content)
                .with_context(|| format!("parsing {}", path.display()))?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content)
                .await
                .with_context(|| format!("writing default config to {}", path.display()))?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mut configured = 0;
        for (kind, address) in self.listeners.entries() {
            if let Some(address) = address {
                address
                    .parse::<SocketAddr>()
                    .with_context(|| format!("Invalid {kind} bind address: {address}"))?;
                configured += 1;
            }
        }
        if configured == 0 {
            bail!("At least one listener must be configured");
        }

        if self.server.max_frame_size < meridian_core::HEADER_LEN + 1
            || self.server.max_frame_size > u16::MAX as usize
        {
            bail!(
                "max_frame_size must be between {} and {}",
                meridian_core::HEADER_LEN + 1,
                u16::MAX
            );
        }
        if self.server.bootstrap_timeout_secs == 0 || self.server.idle_timeout_secs == 0 {
            bail!("Timeouts must be at least one second");
        }
        if self.server.max_connections == 0 {
            bail!("max_connections must be greater than zero");
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            bail!(
                "Invalid log level: {}. Must be one of: {:?}",
                self.logging.level,
                valid_levels
            );
        }

        Ok(())
    }

    pub fn to_server_config(&self) -> Result<ServerConfig> {
        let defaults = ServerConfig::default();
        let mut listeners = Vec::new();
        for (kind, address) in self.listeners.entries() {
            if let Some(address) = address {
                let bind_address = address
                    .parse()
                    .with_context(|| format!("Invalid {kind} bind address: {address}"))?;
                listeners.push(ListenerConfig::new(kind, bind_address));
            }
        }

        Ok(ServerConfig {
            partitions: match self.server.partitions {
                0 => defaults.partitions,
                n => n,
            },
            max_frame_size: self.server.max_frame_size,
            bootstrap_timeout: Duration::from_secs(self.server.bootstrap_timeout_secs),
            idle_timeout: Duration::from_secs(self.server.idle_timeout_secs),
            shutdown_grace: Duration::from_secs(self.server.shutdown_grace_secs),
            max_connections: self.server.max_connections,
            lobby_allow: self.server.lobby_allow.clone(),
            listeners,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());

        let server_config = config.to_server_config().unwrap();
        assert_eq!(server_config.listeners.len(), 4);
        assert_eq!(server_config.max_connections, 5000);
        assert_eq!(server_config.idle_timeout, Duration::from_secs(300));
        assert!(server_config.partitions >= 1);
        assert_eq!(
            server_config.listener(LinkKind::GameClient).unwrap().bind_address,
            "0.0.0.0:7000".parse().unwrap()
        );
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.listeners.game = Some("invalid".to_string());
        assert!(config.validate().is_err());

        config.listeners = ListenerSettings {
            game: None,
            ai: None,
            login: None,
            admin: None,
        };
        assert!(config.validate().is_err());

        config.listeners = ListenerSettings::default();
        config.server.max_frame_size = 2;
        assert!(config.validate().is_err());

        config.server.max_frame_size = DEFAULT_MAX_FRAME;
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_missing_file_is_created_with_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meridian.toml");

        let config = AppConfig::load_from_file(&path).await.unwrap();
        assert!(path.exists());
        assert_eq!(config.logging.level, "info");

        let reloaded = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(reloaded.listeners.game, config.listeners.game);
        assert_eq!(reloaded.server.lobby_allow, config.server.lobby_allow);
    }

    #[tokio::test]
    async fn test_partial_file_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("world.toml");
        tokio::fs::write(
            &path,
            "[server]\npartitions = 3\n\n[listeners]\ngame = \"127.0.0.1:9000\"\n",
        )
        .await
        .unwrap();

        let config = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(config.server.partitions, 3);
        assert_eq!(config.server.idle_timeout_secs, 300);
        assert!(config.listeners.admin.is_none());

        let server_config = config.to_server_config().unwrap();
        assert_eq!(server_config.partitions, 3);
        assert_eq!(server_config.listeners.len(), 1);
    }
}
