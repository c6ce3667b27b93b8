//! Configuration management

use crate::client::BridgeSettings;
use crate::filter::FilterKind;
use crate::server::RegistrySettings;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Addresses shared by both agents
    pub basic: BasicConfig,
    /// Server agent configuration
    pub server: ServerConfig,
    /// Client agent configuration
    pub client: ClientConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        Self::parse(&content)
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self, crate::Error> {
        toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Check every section
    pub fn validate(&self) -> Result<(), crate::Error> {
        self.basic.validate()?;
        self.server.validate()?;
        self.client.validate()?;
        self.logging.validate()
    }

    /// Settings for the server agent's registry
    pub fn registry_settings(&self) -> Result<RegistrySettings, crate::Error> {
        Ok(RegistrySettings {
            idle_timeout: Duration::from_secs(self.server.connection_timeout_sec),
            filter: FilterKind::from_key_file(self.server.key_file.as_deref())?,
        })
    }

    /// Settings for a client agent tunneling to `destination`
    pub fn bridge_settings(&self, destination: &str) -> Result<BridgeSettings, crate::Error> {
        require("--dest", destination)?;
        Ok(BridgeSettings {
            bind_address: self.client.client_bind_address.clone(),
            server_address: self.client.server_address.clone(),
            destination: destination.to_string(),
            keep_alive: Duration::from_secs(self.client.keep_alive_time_sec),
            filter: FilterKind::from_key_file(self.client.key_file.as_deref())?,
        })
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "basic.server_bind_address={}", self.basic.server_bind_address)?;
        writeln!(
            f,
            "basic.debug_bind_address={}",
            self.basic.debug_bind_address.as_deref().unwrap_or("")
        )?;
        writeln!(
            f,
            "server.connection_timeout_sec={}",
            self.server.connection_timeout_sec
        )?;
        writeln!(
            f,
            "server.key_file={}",
            self.server.key_file.as_deref().unwrap_or("")
        )?;
        writeln!(f, "client.client_bind_address={}", self.client.client_bind_address)?;
        writeln!(f, "client.keep_alive_time_sec={}", self.client.keep_alive_time_sec)?;
        writeln!(f, "client.server_address={}", self.client.server_address)?;
        writeln!(
            f,
            "client.key_file={}",
            self.client.key_file.as_deref().unwrap_or("")
        )?;
        write!(f, "{}", self.logging)
    }
}

/// Addresses shared by both agents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicConfig {
    /// Address the server agent listens on
    pub server_bind_address: String,
    /// Address of the server agent's status endpoint (optional)
    #[serde(default)]
    pub debug_bind_address: Option<String>,
}

impl BasicConfig {
    fn validate(&self) -> Result<(), crate::Error> {
        require("basic.server_bind_address", &self.server_bind_address)?;
        if let Some(debug) = &self.debug_bind_address {
            require("basic.debug_bind_address", debug)?;
        }
        Ok(())
    }
}

impl Default for BasicConfig {
    fn default() -> Self {
        Self {
            server_bind_address: "0.0.0.0:8459".to_string(),
            debug_bind_address: None,
        }
    }
}

/// Server agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Idle timeout of a tunneled connection, in seconds
    pub connection_timeout_sec: u64,
    /// Pre-shared key file enabling the cipher filter
    #[serde(default)]
    pub key_file: Option<String>,
}

impl ServerConfig {
    fn validate(&self) -> Result<(), crate::Error> {
        positive("server.connection_timeout_sec", self.connection_timeout_sec)?;
        if let Some(key_file) = &self.key_file {
            require("server.key_file", key_file)?;
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            connection_timeout_sec: 100,
            key_file: None,
        }
    }
}

/// Client agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Local listen address
    pub client_bind_address: String,
    /// Keep-alive period, in seconds
    pub keep_alive_time_sec: u64,
    /// Server agent address
    pub server_address: String,
    /// Pre-shared key file enabling the cipher filter
    #[serde(default)]
    pub key_file: Option<String>,
}

impl ClientConfig {
    fn validate(&self) -> Result<(), crate::Error> {
        require("client.client_bind_address", &self.client_bind_address)?;
        positive("client.keep_alive_time_sec", self.keep_alive_time_sec)?;
        require("client.server_address", &self.server_address)?;
        if let Some(key_file) = &self.key_file {
            require("client.key_file", key_file)?;
        }
        Ok(())
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_bind_address: "127.0.0.1:8458".to_string(),
            keep_alive_time_sec: 30,
            server_address: "127.0.0.1:8459".to_string(),
            key_file: None,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Compact,
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or an EnvFilter directive
    pub level: String,
    /// Log format (pretty, json, compact)
    pub format: String,
    /// Log file path (optional)
    #[serde(default)]
    pub file: Option<String>,
}

impl LoggingConfig {
    /// Load a standalone logging configuration (`--logconf`)
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read log config: {}", e)))?;

        let logging: Self = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse log config: {}", e)))?;
        logging.validate()?;
        Ok(logging)
    }

    /// Parsed output format
    pub fn log_format(&self) -> Result<LogFormat, crate::Error> {
        match self.format.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => Err(crate::Error::Config(format!(
                "logging.format must be pretty, compact or json, got '{}'",
                other
            ))),
        }
    }

    fn validate(&self) -> Result<(), crate::Error> {
        require("logging.level", &self.level)?;
        self.log_format()?;
        if let Some(file) = &self.file {
            require("logging.file", file)?;
        }
        Ok(())
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file: None,
        }
    }
}

impl fmt::Display for LoggingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "logging.level={}", self.level)?;
        writeln!(f, "logging.format={}", self.format)?;
        writeln!(f, "logging.file={}", self.file.as_deref().unwrap_or(""))
    }
}

fn require(name: &str, value: &str) -> Result<(), crate::Error> {
    if value.trim().is_empty() {
        return Err(crate::Error::Config(format!("{} must not be empty", name)));
    }
    Ok(())
}

fn positive(name: &str, value: u64) -> Result<(), crate::Error> {
    if value == 0 {
        return Err(crate::Error::Config(format!("{} must be positive", name)));
    }
    Ok(())
}
