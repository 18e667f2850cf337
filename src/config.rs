//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `host.toml`.
//!     loads configuration from file or falls back to defaults.
//!
//! structure:
//!     - DiscoveryConfig: udp listen address, scan window, dhcp refresh period.
//!     - StreamConfig: device port, timeouts, batch capacities.
//!     - StorageConfig: optional MySQL url (in-memory store otherwise).
//!     - ApiConfig: where the operator api listens.
//!     - LoggingConfig: default log filter.
//!     - devices: seed list for the in-memory store.
//!
//! ==============================================================================

use crate::discovery::DISCOVERY_PORT;
use crate::domain::{DeviceId, DeviceIdentity, RegisteredDevice};
use crate::session::{SessionSettings, STREAM_PORT};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming an explicit config file
pub const CONFIG_ENV: &str = "SENSOR_HOST_CONFIG";

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct HostConfig {
    pub discovery: DiscoveryConfig,
    pub stream: StreamConfig,
    pub storage: StorageConfig,
    pub api: ApiConfig,
    pub logging: LoggingConfig,
    pub devices: Vec<DeviceIdentity>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub bind_address: IpAddr,
    pub port: u16,
    pub scan_timeout_seconds: u64,
    pub refresh_interval_seconds: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DISCOVERY_PORT,
            scan_timeout_seconds: 5,
            refresh_interval_seconds: 300,
        }
    }
}

impl DiscoveryConfig {
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_seconds)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_seconds.max(1))
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StreamConfig {
    pub port: u16,
    pub connect_timeout_seconds: u64,
    pub idle_margin_seconds: u64,
    pub initial_interval_seconds: u32,
    /// batch size for sessions started at boot
    pub bootstrap_batch: usize,
    /// batch size for operator-started sessions
    pub manual_batch: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            port: STREAM_PORT,
            connect_timeout_seconds: 5,
            idle_margin_seconds: 15,
            initial_interval_seconds: 2,
            bootstrap_batch: 10,
            manual_batch: 5,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct StorageConfig {
    pub database_url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ApiConfig {
    pub bind: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 3000),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub show_sensor_data: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            show_sensor_data: false,
        }
    }
}

impl HostConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| anyhow::anyhow!("Failed to read config file: {}", e))?;

        let config: HostConfig = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))?;

        Ok(config)
    }

    /// Load from $SENSOR_HOST_CONFIG, ./config/host.toml or ../config/host.toml.
    ///
    /// Returns the path used, or None when falling back to defaults. An explicit
    /// path that fails to load is an error; the search paths are best effort.
    pub fn load_or_default() -> anyhow::Result<(Self, Option<PathBuf>)> {
        if let Ok(explicit) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(explicit);
            let config = Self::load(&path)?;
            return Ok((config, Some(path)));
        }

        let paths = [
            PathBuf::from("config").join("host.toml"),
            PathBuf::from("..").join("config").join("host.toml"),
        ];
        for path in paths {
            if path.exists() {
                let config = Self::load(&path)?;
                return Ok((config, Some(path)));
            }
        }

        Ok((Self::default(), None))
    }

    /// Session settings for a given batch capacity
    pub fn session_settings(&self, batch_capacity: usize) -> SessionSettings {
        SessionSettings {
            port: self.stream.port,
            batch_capacity: batch_capacity.max(1),
            connect_timeout: Duration::from_secs(self.stream.connect_timeout_seconds),
            idle_margin: Duration::from_secs(self.stream.idle_margin_seconds),
            initial_interval: self.stream.initial_interval_seconds,
            show_sensor_data: self.logging.show_sensor_data,
        }
    }

    /// [[devices]] as registry rows, numbered from 1 in file order
    pub fn seed_devices(&self) -> Vec<RegisteredDevice> {
        self.devices
            .iter()
            .enumerate()
            .map(|(i, identity)| RegisteredDevice {
                id: DeviceId(i as u64 + 1),
                identity: identity.clone(),
            })
            .collect()
    }

    /// Log configuration summary
    pub fn log_summary(&self) {
        tracing::info!(
            discovery = %self.discovery.bind_addr(),
            scan_timeout_s = self.discovery.scan_timeout_seconds,
            refresh_s = self.discovery.refresh_interval_seconds,
            stream_port = self.stream.port,
            idle_margin_s = self.stream.idle_margin_seconds,
            bootstrap_batch = self.stream.bootstrap_batch,
            manual_batch = self.stream.manual_batch,
            storage = if self.storage.database_url.is_some() { "mysql" } else { "memory" },
            api = %self.api.bind,
            seeded_devices = self.devices.len(),
            "Host configuration"
        );
    }
}
