//! Relay configuration
//!
//! Loads relay settings from a TOML file. Every field is optional in the file;
//! command-line flags are applied on top by the binary.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::relay::DEFAULT_SHUTDOWN_NOTICE;

/// Default configuration file, looked up in the working directory
pub const CONFIG_FILE: &str = "relay.toml";

/// Default listen port
pub const DEFAULT_PORT: u16 = 3000;

/// Default bind address
pub const DEFAULT_BIND: &str = "0.0.0.0";

/// Default cap on listeners per channel
pub const DEFAULT_MAX_LISTENERS: usize = 100;

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// How clients reach the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Message-framed WebSocket connections
    #[default]
    #[value(name = "websocket")]
    WebSocket,
    /// Raw TCP byte streams with a newline-terminated handshake
    Tcp,
}

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Maximum listeners per channel before the newest is dropped
    pub max_listeners: usize,
    /// Text sent to every connection before shutdown
    pub shutdown_notice: String,
    /// Transport to accept connections on
    pub transport: Transport,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            port: DEFAULT_PORT,
            max_listeners: DEFAULT_MAX_LISTENERS,
            shutdown_notice: DEFAULT_SHUTDOWN_NOTICE.to_string(),
            transport: Transport::default(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from `path`, falling back to defaults if it is missing
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: RelayConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that would leave the relay unusable
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_listeners == 0 {
            return Err(ConfigError::Invalid(
                "max_listeners must be at least 1".to_string(),
            ));
        }
        if self.bind.trim().is_empty() {
            return Err(ConfigError::Invalid("bind cannot be empty".to_string()));
        }
        Ok(())
    }

    /// Set the bind address
    pub fn with_bind(mut self, bind: impl Into<String>) -> Self {
        self.bind = bind.into();
        self
    }

    /// Set the port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the listener cap
    pub fn with_max_listeners(mut self, max_listeners: usize) -> Self {
        self.max_listeners = max_listeners;
        self
    }

    /// Set the transport
    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.port, 3000);
        assert_eq!(config.max_listeners, 100);
        assert_eq!(config.transport, Transport::WebSocket);
        assert_eq!(config.shutdown_notice, "Server is shutting down...");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_socket_addr() {
        let config = RelayConfig::default().with_bind("127.0.0.1").with_port(9000);
        assert_eq!(config.socket_addr(), "127.0.0.1:9000");
    }

    #[test]
    fn test_load_nonexistent_returns_default() {
        let dir = tempdir().unwrap();
        let config = RelayConfig::load(&dir.path().join(CONFIG_FILE)).unwrap();
        assert_eq!(config, RelayConfig::default());
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "port = 4000\nmax_listeners = 40\ntransport = \"tcp\"\n").unwrap();

        let config = RelayConfig::load(&path).unwrap();
        assert_eq!(config.port, 4000);
        assert_eq!(config.max_listeners, 40);
        assert_eq!(config.transport, Transport::Tcp);
        assert_eq!(config.bind, DEFAULT_BIND);
    }

    #[test]
    fn test_load_invalid_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "port = \"not a number\"").unwrap();
        assert!(matches!(
            RelayConfig::load(&path),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_rejects_zero_listeners() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "max_listeners = 0").unwrap();
        assert!(matches!(
            RelayConfig::load(&path),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_validate_rejects_empty_bind() {
        let config = RelayConfig::default().with_bind(" ");
        assert!(config.validate().is_err());
    }
}
