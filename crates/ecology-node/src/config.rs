//! Node configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (ECOLOGY_*)
//! - TOML configuration file

use anyhow::{Context, Result};
use ecology_core::EcologyConfig;
use ecology_protocol::{DeviceId, Value};
use ecology_transport::{ConnectorRole, WebSocketConfig, MAX_FRAME_SIZE};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Identity of this device.
    #[serde(default = "default_device_id")]
    pub device_id: String,

    /// Whether this node holds the authoritative data store.
    #[serde(default)]
    pub is_reference: bool,

    /// Host the HTTP endpoints bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port of the HTTP endpoints.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Connectors to start.
    #[serde(default)]
    pub connectors: Vec<ConnectorConfig>,

    /// Rooms whose events are logged and counted.
    #[serde(default)]
    pub rooms: Vec<RoomConfig>,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Values the reference seeds its store with.
    #[serde(default)]
    pub data: toml::Table,
}

/// One WebSocket connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    /// Topology role, e.g. "core-server" or "dependent-client".
    pub role: ConnectorRole,

    /// Address to bind (server roles) or dial (client roles).
    pub address: String,

    /// Delay between dial attempts in milliseconds.
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_ms: u64,

    /// Maximum inbound frame size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// A room to watch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomConfig {
    pub name: String,

    #[serde(default)]
    pub events: Vec<String>,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_device_id() -> String {
    std::env::var("ECOLOGY_DEVICE_ID").unwrap_or_else(|_| DeviceId::generate().0)
}

fn default_host() -> String {
    std::env::var("ECOLOGY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("ECOLOGY_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_true() -> bool {
    true
}

fn default_reconnect_interval() -> u64 {
    1_000 // 1 second
}

fn default_max_message_size() -> usize {
    MAX_FRAME_SIZE
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_id: default_device_id(),
            is_reference: false,
            host: default_host(),
            port: default_port(),
            connectors: Vec::new(),
            rooms: Vec::new(),
            metrics: MetricsConfig::default(),
            data: toml::Table::new(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl ConnectorConfig {
    /// Transport settings for this connector.
    #[must_use]
    pub fn websocket_config(&self) -> WebSocketConfig {
        WebSocketConfig {
            address: self.address.clone(),
            max_message_size: self.max_message_size,
            reconnect_interval: Duration::from_millis(self.reconnect_interval_ms),
            ..WebSocketConfig::default()
        }
    }
}

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// `ECOLOGY_CONFIG` names a file to use instead of the search paths.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var("ECOLOGY_CONFIG") {
            return Self::from_file(shellexpand::tilde(&path).as_ref());
        }

        let config_paths = [
            "ecology.toml",
            "/etc/ecology/ecology.toml",
            "~/.config/ecology/ecology.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address of the HTTP endpoints.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, self.port))
    }

    #[must_use]
    pub fn ecology_config(&self) -> EcologyConfig {
        EcologyConfig {
            device_id: DeviceId::new(self.device_id.as_str()),
            is_reference: self.is_reference,
        }
    }

    /// Seed values from the `[data]` table, sorted by key.
    #[must_use]
    pub fn seed_data(&self) -> Vec<(String, Value)> {
        let mut seed: Vec<(String, Value)> = self
            .data
            .iter()
            .map(|(k, v)| (k.clone(), toml_to_value(v)))
            .collect();
        seed.sort_by(|a, b| a.0.cmp(&b.0));
        seed
    }
}

/// Convert a TOML value. Integers that fit 32 bits become `Int32`.
fn toml_to_value(value: &toml::Value) -> Value {
    match value {
        toml::Value::String(s) => Value::String(s.clone()),
        toml::Value::Integer(i) => i32::try_from(*i).map_or(Value::Int64(*i), Value::Int32),
        toml::Value::Float(f) => Value::Float64(*f),
        toml::Value::Boolean(b) => Value::Bool(*b),
        toml::Value::Datetime(d) => Value::String(d.to_string()),
        toml::Value::Array(items) => Value::List(items.iter().map(toml_to_value).collect()),
        toml::Value::Table(table) => Value::Map(
            table
                .iter()
                .map(|(k, v)| (Value::String(k.clone()), toml_to_value(v)))
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(!config.is_reference);
        assert!(config.connectors.is_empty());
        assert!(config.metrics.enabled);
        assert_eq!(config.metrics.port, 9090);
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config {
            host: "127.0.0.1".into(),
            port: 8181,
            ..Config::default()
        };
        assert_eq!(config.bind_addr().unwrap().port(), 8181);

        let bad = Config {
            host: "not a host".into(),
            ..Config::default()
        };
        assert!(bad.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            device_id = "hub"
            is_reference = true
            port = 9000

            [[connectors]]
            role = "core-server"
            address = "0.0.0.0:7000"

            [[connectors]]
            role = "dependent-client"
            address = "ws://gateway:7001"
            reconnect_interval_ms = 250

            [[rooms]]
            name = "lobby"
            events = ["tap", "swipe"]

            [data]
            volume = 7
            mode = "dark"
            big = 10000000000
            levels = [1, 2]
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.device_id, "hub");
        assert!(config.is_reference);
        assert_eq!(config.connectors.len(), 2);
        assert_eq!(config.connectors[0].max_message_size, MAX_FRAME_SIZE);
        assert_eq!(config.connectors[0].role, ConnectorRole::CoreServer);
        assert_eq!(config.connectors[0].reconnect_interval_ms, 1_000);
        assert_eq!(
            config.connectors[1].websocket_config().reconnect_interval,
            Duration::from_millis(250)
        );
        assert_eq!(config.rooms[0].events, vec!["tap", "swipe"]);

        assert_eq!(
            config.seed_data(),
            vec![
                ("big".to_string(), Value::Int64(10_000_000_000)),
                (
                    "levels".to_string(),
                    Value::List(vec![Value::Int32(1), Value::Int32(2)])
                ),
                ("mode".to_string(), Value::from("dark")),
                ("volume".to_string(), Value::Int32(7)),
            ]
        );
    }

    #[test]
    fn test_unknown_role_rejected() {
        let toml_str = r#"
            [[connectors]]
            role = "sideways"
            address = "127.0.0.1:1"
        "#;
        assert!(toml::from_str::<Config>(toml_str).is_err());
    }
}
