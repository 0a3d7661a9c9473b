//! Configuration management for adcd.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{DeviceFamily, DeviceName};

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Gateway server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Configured devices.
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,

    /// Register cache storage.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file, creating parent directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {e}")))?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Config(format!("Failed to create config dir: {e}")))?;
        }
        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("Failed to write config: {e}")))?;

        Ok(())
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        let mut ips = HashSet::new();
        for device in &self.devices {
            if !names.insert(&device.name) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate device name: {}",
                    device.name
                )));
            }
            if !ips.insert(device.ip) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate device address: {}",
                    device.ip
                )));
            }
        }
        Ok(())
    }

    /// Get default config path.
    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("ru", "afi", "adcd").map_or_else(
            || PathBuf::from("adcd.toml"),
            |dirs| dirs.config_dir().join("config.toml"),
        )
    }

    /// Look up a configured device by name.
    pub fn device(&self, name: &DeviceName) -> Result<&DeviceConfig> {
        self.devices
            .iter()
            .find(|d| &d.name == name)
            .ok_or_else(|| Error::DeviceNotFound(name.to_string()))
    }

    /// Create example configuration with two devices.
    pub fn example() -> Self {
        Self {
            devices: vec![
                DeviceConfig {
                    name: DeviceName::from("adc64-0"),
                    ip: Ipv4Addr::new(192, 168, 1, 208),
                    family: DeviceFamily::Adc64,
                    zero_suppression: false,
                },
                DeviceConfig {
                    name: DeviceName::from("tqdc-0"),
                    ip: Ipv4Addr::new(192, 168, 1, 209),
                    family: DeviceFamily::Tqdc,
                    zero_suppression: false,
                },
            ],
            ..Default::default()
        }
    }
}

/// Gateway server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Local address the control socket binds to.
    #[serde(default = "default_bind_ip")]
    pub ip: Ipv4Addr,

    /// Device control port (both ends of the control exchange).
    #[serde(default = "default_control_port")]
    pub control_port: u16,

    /// Device MStream port acquisition sockets talk to.
    #[serde(default = "default_mstream_port")]
    pub mstream_port: u16,

    /// Discovery multicast group consumed by the discovery collaborator.
    #[serde(default = "default_discover_group")]
    pub discover_group: Ipv4Addr,

    /// Discovery multicast port.
    #[serde(default = "default_discover_port")]
    pub discover_port: u16,

    /// Interval between bulk register polls.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
}

fn default_bind_ip() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}
fn default_control_port() -> u16 {
    33300
}
fn default_mstream_port() -> u16 {
    33301
}
fn default_discover_group() -> Ipv4Addr {
    Ipv4Addr::new(239, 192, 1, 1)
}
fn default_discover_port() -> u16 {
    33303
}
fn default_poll_interval() -> Duration {
    Duration::from_secs(30)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ip: default_bind_ip(),
            control_port: default_control_port(),
            mstream_port: default_mstream_port(),
            discover_group: default_discover_group(),
            discover_port: default_discover_port(),
            poll_interval: default_poll_interval(),
        }
    }
}

/// One configured device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: DeviceName,
    pub ip: Ipv4Addr,
    #[serde(default)]
    pub family: DeviceFamily,
    /// Start streams with zero suppression enabled (ADC64 only).
    #[serde(default)]
    pub zero_suppression: bool,
}

/// Register cache storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database path.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

fn default_db_path() -> PathBuf {
    directories::ProjectDirs::from("ru", "afi", "adcd").map_or_else(
        || PathBuf::from("registers.db"),
        |dirs| dirs.data_dir().join("registers.db"),
    )
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text or json).
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable colored output.
    #[serde(default = "default_color")]
    pub color: bool,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "text".into()
}
fn default_color() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            color: default_color(),
        }
    }
}

/// Initialize the global tracing subscriber.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to init logging: {e}")))?;
    } else {
        subscriber
            .with(fmt::layer().with_ansi(config.color))
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to init logging: {e}")))?;
    }

    Ok(())
}
