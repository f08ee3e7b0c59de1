//! Transport configuration
//!
//! Loaded from a TOML file with a single `[transport]` section. Everything the
//! transport writes to disk lives below `persistency_dir`; the per-endpoint
//! credentials directory is keyed by the pairing endpoint host so that a
//! device moved to another cluster starts from a clean identity.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

/// Top-level configuration file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub transport: TransportConfig,
}

/// `[transport]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportConfig {
    /// Realm-scoped pairing API base URL
    pub endpoint: String,
    /// Root directory for the database, credentials and sync state
    pub persistency_dir: PathBuf,
    /// Agent key used to register the device when no credentials secret is stored
    pub agent_key: Option<String>,
    /// CA bundle used to verify the broker
    #[serde(default = "default_broker_ca")]
    pub broker_ca: PathBuf,
    /// Extra CA trusted for the pairing endpoint
    pub pairing_ca: Option<PathBuf>,
    /// Accept invalid certificates on the pairing endpoint
    #[serde(default)]
    pub ignore_ssl_errors: bool,
    /// Arm the reboot watchdog whenever the broker is unreachable
    #[serde(default)]
    pub reboot_when_connection_fails: bool,
    /// Base reboot watchdog delay (default: 600 = 10 hours)
    #[serde(default = "default_reboot_delay_minutes")]
    pub reboot_delay_minutes: u64,
    /// Hardware id; the CLI may override it
    pub hardware_id: Option<String>,
}

fn default_broker_ca() -> PathBuf {
    PathBuf::from("/etc/ssl/certs/ca-certificates.crt")
}

fn default_reboot_delay_minutes() -> u64 {
    600
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Missing required field: {0}")]
    MissingField(&'static str),
    #[error("Invalid endpoint URL: {0}")]
    InvalidEndpoint(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Config {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.transport.validate()?;
        Ok(config)
    }
}

impl TransportConfig {
    /// Minimal configuration with defaults for everything optional.
    pub fn new(endpoint: impl Into<String>, persistency_dir: impl Into<PathBuf>) -> Self {
        Self {
            endpoint: endpoint.into(),
            persistency_dir: persistency_dir.into(),
            agent_key: None,
            broker_ca: default_broker_ca(),
            pairing_ca: None,
            ignore_ssl_errors: false,
            reboot_when_connection_fails: false,
            reboot_delay_minutes: default_reboot_delay_minutes(),
            hardware_id: None,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.endpoint_url()?;

        if self.persistency_dir.as_os_str().is_empty() {
            return Err(ConfigError::MissingField("persistency_dir"));
        }

        if self.reboot_when_connection_fails && self.reboot_delay_minutes == 0 {
            return Err(ConfigError::InvalidConfig(
                "reboot_delay_minutes must be greater than 0 when reboot is enabled".to_string(),
            ));
        }

        if let Some(hardware_id) = &self.hardware_id {
            validate_hardware_id(hardware_id)?;
        }

        Ok(())
    }

    /// Parsed endpoint; must be http(s) with a host.
    pub fn endpoint_url(&self) -> Result<Url, ConfigError> {
        if self.endpoint.is_empty() {
            return Err(ConfigError::MissingField("endpoint"));
        }
        let url = Url::parse(&self.endpoint)
            .map_err(|_| ConfigError::InvalidEndpoint(self.endpoint.clone()))?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(ConfigError::InvalidEndpoint(self.endpoint.clone()));
        }
        Ok(url)
    }

    /// `{persistency_dir}/persistence.db`
    pub fn database_path(&self) -> PathBuf {
        self.persistency_dir.join("persistence.db")
    }

    /// `{persistency_dir}/transportStatus.toml`
    pub fn sync_state_path(&self) -> PathBuf {
        self.persistency_dir.join("transportStatus.toml")
    }

    /// `{persistency_dir}/endpoint/{endpoint host}`
    pub fn endpoint_dir(&self) -> Result<PathBuf, ConfigError> {
        let url = self.endpoint_url()?;
        let host = url
            .host_str()
            .ok_or_else(|| ConfigError::InvalidEndpoint(self.endpoint.clone()))?;
        Ok(self.persistency_dir.join("endpoint").join(host))
    }
}

/// Hardware ids are URL-safe base64 in practice; reject anything that would
/// break a topic or a URL path segment.
pub fn validate_hardware_id(hardware_id: &str) -> Result<(), ConfigError> {
    if hardware_id.is_empty() {
        return Err(ConfigError::MissingField("hardware_id"));
    }
    if let Some(ch) = hardware_id
        .chars()
        .find(|ch| !ch.is_ascii_alphanumeric() && *ch != '-' && *ch != '_')
    {
        return Err(ConfigError::InvalidConfig(format!(
            "hardware_id contains invalid character: '{ch}'"
        )));
    }
    Ok(())
}
