//! Call configuration. Logging defaults to on in debug builds only.

use crate::peer::media::MediaConstraints;
use crate::peer::types::ServerConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true;

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false; // warnings only

/// Period the link may stay disconnected before the call is failed
pub const GRACE_PERIOD: Duration = Duration::from_secs(10);

pub const CONFIG_PATH_ENV: &str = "MINDCALL_CONFIG";
pub const ICE_SERVERS_ENV: &str = "MINDCALL_ICE_SERVERS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub enabled: bool,
    /// `EnvFilter` directive used when `RUST_LOG` is not set
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: LOGGING_ENABLED,
            filter: "info".into(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct CallConfig {
    pub ice_servers: Vec<ServerConfig>,
    pub ice_candidate_pool_size: u8,
    /// Collection holding one record per call
    pub calls_collection: String,
    #[serde(with = "duration_secs")]
    pub grace_period: Duration,
    pub media: MediaConstraints,
    pub logging: LoggingConfig,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            ice_candidate_pool_size: 10,
            calls_collection: "calls".into(),
            grace_period: GRACE_PERIOD,
            media: MediaConstraints::default(),
            logging: LoggingConfig::default(),
        }
    }
}

pub fn default_ice_servers() -> Vec<ServerConfig> {
    vec![
        ServerConfig::stun("default-stun-1", "stun:stun1.l.google.com:19302"),
        ServerConfig::stun("default-stun-2", "stun:stun2.l.google.com:19302"),
    ]
}

impl CallConfig {
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Defaults, overlaid with `MINDCALL_CONFIG` (file) and
    /// `MINDCALL_ICE_SERVERS` (comma-separated URLs).
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(path.trim())?,
            _ => Self::default(),
        };
        if let Ok(urls) = std::env::var(ICE_SERVERS_ENV) {
            let servers = parse_ice_server_list(&urls);
            if !servers.is_empty() {
                config.ice_servers = servers;
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Replaces the ICE servers after validating them.
    pub fn with_ice_servers(mut self, servers: Vec<ServerConfig>) -> Result<Self, ConfigError> {
        validate_servers(&servers)?;
        self.ice_servers = servers;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_servers(&self.ice_servers)?;
        if self.calls_collection.trim().is_empty() || self.calls_collection.contains('/') {
            return Err(ConfigError::Invalid(
                "calls collection must be a single non-empty path segment".into(),
            ));
        }
        if !self.media.video && !self.media.audio {
            return Err(ConfigError::Invalid(
                "media constraints must request audio or video".into(),
            ));
        }
        Ok(())
    }
}

fn validate_servers(servers: &[ServerConfig]) -> Result<(), ConfigError> {
    for server in servers {
        if server.url.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "ICE server {} has an empty URL",
                server.id
            )));
        }
        if server.is_turn() && (server.username.is_none() || server.credential.is_none()) {
            return Err(ConfigError::Invalid(format!(
                "TURN server {} requires username and credential",
                server.id
            )));
        }
    }
    Ok(())
}

fn parse_ice_server_list(raw: &str) -> Vec<ServerConfig> {
    raw.split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .enumerate()
        .map(|(i, url)| ServerConfig::stun(format!("env-{i}"), url))
        .collect()
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_original_servers() {
        let config = CallConfig::default();
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.ice_candidate_pool_size, 10);
        assert_eq!(config.calls_collection, "calls");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = CallConfig::from_json_str(r#"{"grace_period": 3}"#).unwrap();
        assert_eq!(config.grace_period, Duration::from_secs(3));
        assert_eq!(config.ice_candidate_pool_size, 10);
    }

    #[test]
    fn test_turn_without_credentials_rejected() {
        let turn = ServerConfig {
            id: "t".into(),
            r#type: "turn".into(),
            url: "turn:relay.example.org:3478".into(),
            username: Some("user".into()),
            credential: None,
        };
        assert!(CallConfig::default().with_ice_servers(vec![turn]).is_err());
    }

    #[test]
    fn test_empty_media_rejected() {
        let mut config = CallConfig::default();
        config.media.audio = false;
        config.media.video = false;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ice_server_list_parsing() {
        let servers = parse_ice_server_list(" stun:a:1 , ,stun:b:2");
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[1].url, "stun:b:2");
    }
}
