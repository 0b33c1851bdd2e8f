//! Configuration system for the RELAYMUX CLI.

use clap::ValueEnum;
use relaymux_core::{DEFAULT_RELAY_PORT, RelayClientConfig, RelayServerConfig};
use relaymux_transport::{DatagramConfig, SessionKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// RELAYMUX configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Relay server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Relay client configuration
    #[serde(default)]
    pub client: ClientConfig,
    /// Secure datagram transport configuration
    #[serde(default)]
    pub datagram: DatagramSection,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Physical transport between clients and the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransportName {
    /// TCP byte stream
    Tcp,
    /// Encrypted UDP datagram sessions
    Datagram,
}

impl fmt::Display for TransportName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportName::Tcp => f.write_str("tcp"),
            TransportName::Datagram => f.write_str("datagram"),
        }
    }
}

/// Relay server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Transport to serve
    #[serde(default = "default_transport")]
    pub transport: TransportName,
    /// Maximum concurrently registered clients
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    /// Frames per client per second (0 = unlimited)
    #[serde(default)]
    pub rate_limit: u32,
    /// Seconds of silence before a client is dropped
    #[serde(default = "default_client_timeout")]
    pub client_timeout_secs: u64,
    /// Seconds a new connection has to register
    #[serde(default = "default_registration_timeout")]
    pub registration_timeout_secs: u64,
}

/// Relay client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Relay server address
    #[serde(default = "default_server_addr")]
    pub server_addr: String,
    /// Transport used to reach the relay
    #[serde(default = "default_transport")]
    pub transport: TransportName,
    /// Seconds allowed for dial plus registration
    #[serde(default = "default_registration_timeout")]
    pub registration_timeout_secs: u64,
    /// Seconds between reconnection attempts
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_secs: u64,
    /// Seconds between keepalives
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,
    /// Seconds of silence before the relay connection is considered dead
    #[serde(default = "default_client_timeout")]
    pub idle_timeout_secs: u64,
    /// Inbound bytes buffered per virtual connection
    #[serde(default = "default_max_queued_bytes")]
    pub max_queued_bytes: usize,
}

/// Secure datagram transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatagramSection {
    /// Pre-shared secret the session key is derived from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    /// Socket receive buffer size
    #[serde(default = "default_socket_buffer")]
    pub recv_buffer_size: usize,
    /// Socket send buffer size
    #[serde(default = "default_socket_buffer")]
    pub send_buffer_size: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_bind_addr() -> String {
    format!("0.0.0.0:{DEFAULT_RELAY_PORT}")
}

fn default_server_addr() -> String {
    format!("127.0.0.1:{DEFAULT_RELAY_PORT}")
}

fn default_transport() -> TransportName {
    TransportName::Tcp
}

fn default_max_clients() -> usize {
    10_000
}

fn default_client_timeout() -> u64 {
    90
}

fn default_registration_timeout() -> u64 {
    10
}

fn default_reconnect_interval() -> u64 {
    5
}

fn default_keepalive_interval() -> u64 {
    30
}

fn default_max_queued_bytes() -> usize {
    4 * 1024 * 1024 // 4 MiB
}

fn default_socket_buffer() -> usize {
    2 * 1024 * 1024 // 2 MiB
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            transport: default_transport(),
            max_clients: default_max_clients(),
            rate_limit: 0,
            client_timeout_secs: default_client_timeout(),
            registration_timeout_secs: default_registration_timeout(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: default_server_addr(),
            transport: default_transport(),
            registration_timeout_secs: default_registration_timeout(),
            reconnect_interval_secs: default_reconnect_interval(),
            keepalive_interval_secs: default_keepalive_interval(),
            idle_timeout_secs: default_client_timeout(),
            max_queued_bytes: default_max_queued_bytes(),
        }
    }
}

impl Default for DatagramSection {
    fn default() -> Self {
        Self {
            secret: None,
            recv_buffer_size: default_socket_buffer(),
            send_buffer_size: default_socket_buffer(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("relaymux/config.toml")
    }

    /// Load config from default path, or create default if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns an error if reading or creating the config fails.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();

        if path.exists() {
            Self::load(&path)
        } else {
            let config = Self::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        validate_host_port(&self.server.bind_addr, "Server bind address", true)?;
        validate_host_port(&self.client.server_addr, "Relay server", false)?;

        if self.server.max_clients == 0 {
            anyhow::bail!("Server max_clients must be at least 1");
        }

        let durations = [
            ("server.client_timeout_secs", self.server.client_timeout_secs),
            (
                "server.registration_timeout_secs",
                self.server.registration_timeout_secs,
            ),
            (
                "client.registration_timeout_secs",
                self.client.registration_timeout_secs,
            ),
            (
                "client.reconnect_interval_secs",
                self.client.reconnect_interval_secs,
            ),
            ("client.idle_timeout_secs", self.client.idle_timeout_secs),
        ];
        for (name, secs) in durations {
            if secs == 0 {
                anyhow::bail!("{} must be positive", name);
            }
        }

        if self.client.keepalive_interval_secs >= self.client.idle_timeout_secs {
            anyhow::bail!(
                "Keepalive interval ({}s) must be shorter than the idle timeout ({}s)",
                self.client.keepalive_interval_secs,
                self.client.idle_timeout_secs
            );
        }

        if self.client.max_queued_bytes == 0 {
            anyhow::bail!("client.max_queued_bytes must be positive");
        }

        let uses_datagram = self.server.transport == TransportName::Datagram
            || self.client.transport == TransportName::Datagram;
        if uses_datagram && self.datagram.secret.as_deref().is_none_or(str::is_empty) {
            anyhow::bail!("Datagram transport selected but no datagram.secret configured");
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }

    /// Relay server settings
    #[must_use]
    pub fn server_config(&self) -> RelayServerConfig {
        RelayServerConfig {
            max_clients: self.server.max_clients,
            rate_limit: self.server.rate_limit,
            client_timeout: Duration::from_secs(self.server.client_timeout_secs),
            registration_timeout: Duration::from_secs(self.server.registration_timeout_secs),
        }
    }

    /// Relay client settings
    #[must_use]
    pub fn client_config(&self) -> RelayClientConfig {
        RelayClientConfig {
            registration_timeout: Duration::from_secs(self.client.registration_timeout_secs),
            reconnect_interval: Duration::from_secs(self.client.reconnect_interval_secs),
            keepalive_interval: Duration::from_secs(self.client.keepalive_interval_secs),
            idle_timeout: Duration::from_secs(self.client.idle_timeout_secs),
            max_queued_bytes: self.client.max_queued_bytes,
            ..RelayClientConfig::default()
        }
    }

    /// Datagram socket settings
    #[must_use]
    pub fn datagram_config(&self) -> DatagramConfig {
        DatagramConfig {
            recv_buffer_size: self.datagram.recv_buffer_size,
            send_buffer_size: self.datagram.send_buffer_size,
            ..DatagramConfig::default()
        }
    }

    /// Copy safe to print: the datagram secret is masked
    #[must_use]
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.datagram.secret.is_some() {
            copy.datagram.secret = Some(REDACTED.to_string());
        }
        copy
    }

    /// Session key derived from the configured secret
    ///
    /// # Errors
    ///
    /// Returns an error if no secret is configured.
    pub fn session_key(&self) -> anyhow::Result<SessionKey> {
        match self.datagram.secret.as_deref() {
            Some(secret) if !secret.is_empty() => Ok(SessionKey::derive(secret.as_bytes())),
            _ => anyhow::bail!("datagram.secret is not configured"),
        }
    }
}

/// Stands in for secrets in printed configuration
const REDACTED: &str = "<redacted>";

/// Validate host:port format
fn validate_host_port(addr: &str, name: &str, allow_port_zero: bool) -> anyhow::Result<()> {
    let Some((host, port_str)) = addr.rsplit_once(':') else {
        anyhow::bail!(
            "{} '{}' missing port (expected format: host:port)",
            name,
            addr
        );
    };

    let port: u16 = port_str
        .parse()
        .map_err(|_| anyhow::anyhow!("{} '{}' has invalid port: {}", name, addr, port_str))?;

    if port == 0 && !allow_port_zero {
        anyhow::bail!("{} '{}' has invalid port: 0", name, addr);
    }

    if host.is_empty() {
        anyhow::bail!("{} '{}' has empty hostname", name, addr);
    }

    if host.contains("..") || host.contains('/') || host.contains('\\') {
        anyhow::bail!("{} '{}' contains invalid characters", name, addr);
    }

    Ok(())
}
