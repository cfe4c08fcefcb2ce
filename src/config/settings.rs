//! Link, device and daemon settings

use crate::core::comm::{
    CommError, Device, DeviceKind, Dispatcher, LinkProtocol, PollerConfig, RecentIds,
};
use crate::core::transport::{create_transport, Transport, TransportError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// No configuration directory on this platform
    #[error("Could not determine config directory")]
    NoConfigDir,

    /// File could not be read or written
    #[error("{path}: {source}")]
    Io {
        /// File path
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// File is not valid TOML for this schema
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Configuration could not be serialized
    #[error("serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Settings are inconsistent
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// A link transport could not be created
    #[error("link {link}: {source}")]
    Transport {
        /// Link name
        link: String,
        /// Underlying error
        source: TransportError,
    },

    /// A link worker could not be started
    #[error("link {link}: {source}")]
    Link {
        /// Link name
        link: String,
        /// Underlying error
        source: CommError,
    },
}

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Periodic polling
    #[serde(default)]
    pub polling: PollingConfig,
    /// Communication links
    #[serde(default, rename = "link")]
    pub links: Vec<LinkConfig>,
    /// Field devices
    #[serde(default, rename = "device")]
    pub devices: Vec<DeviceConfig>,
}

impl AppConfig {
    /// Load from the default location, or defaults if there is no file
    pub fn load() -> Result<Self, ConfigError> {
        let path = super::default_config_path().ok_or(ConfigError::NoConfigDir)?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load and validate a file
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to file
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Look up a link by name
    pub fn link(&self, name: &str) -> Option<&LinkConfig> {
        self.links.iter().find(|l| l.name == name)
    }

    /// Look up a device by name
    pub fn device(&self, name: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.name == name)
    }

    /// Start a worker for every link and register every device.
    ///
    /// Must be called within a Tokio runtime.
    pub fn start(&self, capacity: usize) -> Result<Dispatcher, ConfigError> {
        self.validate()?;
        let dispatcher = Dispatcher::new(capacity);
        for link in &self.links {
            let transport =
                create_transport(link.transport.clone()).map_err(|source| ConfigError::Transport {
                    link: link.name.clone(),
                    source,
                })?;
            dispatcher
                .add_link(link.protocol, link.poller_config(), link.recent_ids, transport)
                .map_err(|source| ConfigError::Link {
                    link: link.name.clone(),
                    source,
                })?;
        }
        for device in &self.devices {
            dispatcher.add_device(device.to_device());
        }
        Ok(dispatcher)
    }

    /// Check names, references and timing.
    ///
    /// Camera drop addresses are checked per transaction, not here.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut links = HashSet::new();
        for link in &self.links {
            if !links.insert(link.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate link {}", link.name)));
            }
            if link.timeout_ms == 0 {
                return Err(ConfigError::Invalid(format!("{}: timeout_ms is zero", link.name)));
            }
            if link.retries == 0 {
                return Err(ConfigError::Invalid(format!("{}: retries is zero", link.name)));
            }
        }
        let mut devices = HashSet::new();
        for device in &self.devices {
            if !devices.insert(device.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate device {}",
                    device.name
                )));
            }
            let Some(link) = self.link(&device.link) else {
                return Err(ConfigError::Invalid(format!(
                    "{}: unknown link {}",
                    device.name, device.link
                )));
            };
            if !link.protocol.supports(&device.kind) {
                return Err(ConfigError::Invalid(format!(
                    "{}: {} link {} cannot reach a {}",
                    device.name,
                    link.protocol,
                    link.name,
                    device.kind.name()
                )));
            }
        }
        Ok(())
    }
}

fn default_level() -> String {
    "info".to_string()
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_level")]
    pub level: String,
    /// Emit JSON lines instead of text
    #[serde(default)]
    pub json: bool,
    /// Also write a daily rolling file here
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
            directory: None,
        }
    }
}

fn default_high_secs() -> u64 {
    30
}

fn default_low_secs() -> u64 {
    300
}

fn default_feed_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

/// Periodic polling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Interval of high-priority status polls (s)
    #[serde(default = "default_high_secs")]
    pub high_interval_secs: u64,
    /// Interval of low-priority polls (s)
    #[serde(default = "default_low_secs")]
    pub low_interval_secs: u64,
    /// Interval of alert feed fetches (s)
    #[serde(default = "default_feed_secs")]
    pub feed_interval_secs: u64,
    /// Push settings to every meter at startup
    #[serde(default = "default_true")]
    pub send_settings_on_start: bool,
    /// Install detector listeners at startup
    #[serde(default = "default_true")]
    pub listen_detectors: bool,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            high_interval_secs: default_high_secs(),
            low_interval_secs: default_low_secs(),
            feed_interval_secs: default_feed_secs(),
            send_settings_on_start: true,
            listen_detectors: true,
        }
    }
}

fn default_timeout_ms() -> u64 {
    750
}

fn default_retries() -> u32 {
    3
}

fn default_listen_ms() -> u64 {
    250
}

fn default_recent_ids() -> usize {
    RecentIds::<u16>::DEFAULT_CAPACITY
}

/// Communication link
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Link name
    pub name: String,
    /// Protocol spoken on the link
    pub protocol: LinkProtocol,
    /// How to reach the line
    pub transport: Transport,
    /// Receive timeout per step (ms)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Failed attempts allowed before a transaction fails
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Minimum spacing between exchanges (ms); protocol default if unset
    #[serde(default)]
    pub min_interval_ms: Option<u64>,
    /// Listen turn length (ms)
    #[serde(default = "default_listen_ms")]
    pub listen_ms: u64,
    /// Detector event ids remembered for duplicate suppression
    #[serde(default = "default_recent_ids")]
    pub recent_ids: usize,
}

impl LinkConfig {
    /// Create a link with default timing
    pub fn new(name: &str, protocol: LinkProtocol, transport: Transport) -> Self {
        Self {
            name: name.to_string(),
            protocol,
            transport,
            timeout_ms: default_timeout_ms(),
            retries: default_retries(),
            min_interval_ms: None,
            listen_ms: default_listen_ms(),
            recent_ids: default_recent_ids(),
        }
    }

    /// Effective minimum spacing
    pub fn min_interval(&self) -> Duration {
        self.min_interval_ms
            .map_or_else(|| self.protocol.default_min_interval(), Duration::from_millis)
    }

    /// Worker settings for this link
    pub fn poller_config(&self) -> PollerConfig {
        PollerConfig::new(&self.name)
            .timeout(Duration::from_millis(self.timeout_ms))
            .retries(self.retries)
            .min_interval(self.min_interval())
            .listen_interval(Duration::from_millis(self.listen_ms))
            .stash_limit(self.recent_ids.saturating_mul(2))
    }
}

/// Field device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device name
    pub name: String,
    /// Link the device is attached to
    pub link: String,
    /// Kind and protocol settings
    pub kind: DeviceKind,
}

impl DeviceConfig {
    /// Build the runtime device
    pub fn to_device(&self) -> Device {
        Device::new(&self.name, &self.link, self.kind.clone())
    }
}
