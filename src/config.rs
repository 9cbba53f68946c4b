//! Configuration
//!
//! TOML configuration for the relay server. Every field has a default so a
//! missing file or a partial one still yields a runnable server.

use crate::protocol::Identity;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Seconds an empty room survives before deletion.
    #[serde(default = "default_room_grace_secs")]
    pub room_grace_secs: u64,
    /// Per-identity offline queue capacity; the oldest message is evicted
    /// beyond it.
    #[serde(default = "default_offline_queue_cap")]
    pub offline_queue_cap: usize,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub push: PushConfig,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_room_grace_secs() -> u64 {
    60
}

fn default_offline_queue_cap() -> usize {
    512
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Push notification configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConfig {
    /// Identity that receives push notifications while offline.
    #[serde(default = "default_notify_identity")]
    pub notify_identity: Identity,
    /// VAPID public key handed to clients; the private key lives with the
    /// push proxy that signs deliveries.
    #[serde(default)]
    pub vapid_public_key: Option<String>,
    #[serde(default = "default_push_ttl_secs")]
    pub ttl_secs: u32,
}

fn default_notify_identity() -> Identity {
    Identity::Admin
}

fn default_push_ttl_secs() -> u32 {
    86400
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            notify_identity: Identity::Admin,
            vapid_public_key: None,
            ttl_secs: default_push_ttl_secs(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            room_grace_secs: default_room_grace_secs(),
            offline_queue_cap: default_offline_queue_cap(),
            log_level: default_log_level(),
            push: PushConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// How long an empty room is kept before deletion.
    pub fn room_grace(&self) -> Duration {
        Duration::from_secs(self.room_grace_secs)
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 5000);
        assert_eq!(config.room_grace_secs, 60);
        assert_eq!(config.offline_queue_cap, 512);
        assert_eq!(config.push.notify_identity, Identity::Admin);
        assert!(config.push.vapid_public_key.is_none());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: ServerConfig = toml::from_str(
            r#"
            port = 9000

            [push]
            notify_identity = "friend"
            vapid_public_key = "BPublicKey"
            "#,
        )
        .unwrap();

        assert_eq!(config.port, 9000);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.room_grace_secs, 60);
        assert_eq!(config.push.notify_identity, Identity::Friend);
        assert_eq!(config.push.vapid_public_key.as_deref(), Some("BPublicKey"));
        assert_eq!(config.push.ttl_secs, 86400);
    }
}
