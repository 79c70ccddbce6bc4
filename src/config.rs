use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

use crate::error::ConfigError;

const CONFIG_FILE_NAME: &str = ".shelly-exporter.yaml";
// Served by the index and health handlers
const RESERVED_PATHS: [&str; 2] = ["/", "/health"];

/// Exporter configuration, read from YAML and overridden by CLI flags.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_address: String,
    pub metrics_path: String,
    pub log_level: String,
    /// Bare device URLs without metadata.
    pub shelly_devices: Vec<String>,
    /// Devices with name/category metadata.
    pub devices: Vec<DeviceConfig>,
    #[serde(deserialize_with = "deserialize_duration")]
    pub scrape_interval: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub scrape_timeout: Duration,
    /// Number of devices queried at the same time during a cycle.
    pub scrape_concurrency: usize,
    pub cost_calculation: CostConfig,
    pub tls: TlsConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub url: String,
    pub name: String,
    pub category: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CostConfig {
    pub enabled: bool,
    pub default_rate: f64,
    /// Checked in order, first matching time range wins.
    pub rates: Vec<RateRule>,
}

/// `time` is a `HH:MM-HH:MM` range, `rate` a price per kWh.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RateRule {
    pub time: String,
    pub rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub ca_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub insecure_skip_verify: bool,
}

/// Optional labels attached to a device endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMetadata {
    pub name: String,
    pub category: String,
    pub description: String,
}

/// A device to poll. Identity is the URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEndpoint {
    pub url: String,
    pub metadata: Option<DeviceMetadata>,
}

impl DeviceEndpoint {
    pub fn bare(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            metadata: None,
        }
    }

    pub fn category(&self) -> Option<&str> {
        self.metadata.as_ref().map(|m| m.category.as_str())
    }
}

impl From<&DeviceConfig> for DeviceMetadata {
    fn from(device: &DeviceConfig) -> Self {
        Self {
            name: device.name.clone(),
            category: device.category.clone(),
            description: device.description.clone(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:8080".to_string(),
            metrics_path: "/metrics".to_string(),
            log_level: "info".to_string(),
            shelly_devices: Vec::new(),
            devices: Vec::new(),
            scrape_interval: Duration::from_secs(30),
            scrape_timeout: Duration::from_secs(10),
            scrape_concurrency: 4,
            cost_calculation: CostConfig::default(),
            tls: TlsConfig::default(),
        }
    }
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            default_rate: 0.15,
            rates: Vec::new(),
        }
    }
}

impl Config {
    /// Loads the given file, or the first `.shelly-exporter.yaml` found in the
    /// working directory, `$HOME` or `/etc/shelly-exporter`. Without any file
    /// the defaults are returned.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match Self::find_default_file() {
                Some(path) => path,
                None => return Ok(Self::default()),
            },
        };
        let text = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text)
    }

    fn find_default_file() -> Option<PathBuf> {
        let mut candidates = vec![PathBuf::from(CONFIG_FILE_NAME)];
        if let Some(home) = env::var_os("HOME") {
            candidates.push(Path::new(&home).join(CONFIG_FILE_NAME));
        }
        candidates.push(Path::new("/etc/shelly-exporter").join("config.yaml"));
        candidates.into_iter().find(|path| path.is_file())
    }

    /// Collects every problem instead of stopping at the first one.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.listen_address.is_empty() {
            errors.push("listen_address cannot be empty".to_string());
        } else if !is_host_port(&self.bind_address()) {
            errors.push(format!(
                "listen_address must be host:port, got {}",
                self.listen_address
            ));
        }
        if self.metrics_path.is_empty() {
            errors.push("metrics_path cannot be empty".to_string());
        } else if !self.metrics_path.starts_with('/') {
            errors.push("metrics_path must start with '/'".to_string());
        } else if RESERVED_PATHS.contains(&self.metrics_path.as_str()) {
            errors.push(format!("metrics_path cannot be {}", self.metrics_path));
        }
        if self.shelly_devices.is_empty() && self.devices.is_empty() {
            errors.push("at least one shelly device must be configured".to_string());
        }
        if self.scrape_interval.is_zero() {
            errors.push("scrape_interval must be positive".to_string());
        }
        if self.scrape_timeout.is_zero() {
            errors.push("scrape_timeout must be positive".to_string());
        }
        if self.scrape_timeout >= self.scrape_interval {
            errors.push("scrape_timeout must be less than scrape_interval".to_string());
        }
        if self.scrape_concurrency == 0 {
            errors.push("scrape_concurrency must be at least 1".to_string());
        }

        for (i, device) in self.devices.iter().enumerate() {
            if device.url.is_empty() {
                errors.push(format!("devices[{i}].url cannot be empty"));
            }
            if device.name.is_empty() {
                errors.push(format!("devices[{i}].name cannot be empty"));
            }
            if device.category.is_empty() {
                errors.push(format!("devices[{i}].category cannot be empty"));
            }
        }

        let cost = &self.cost_calculation;
        if cost.enabled {
            if cost.default_rate <= 0.0 {
                errors.push("cost_calculation.default_rate must be positive".to_string());
            }
            for (i, rule) in cost.rates.iter().enumerate() {
                if rule.time.is_empty() {
                    errors.push(format!("cost_calculation.rates[{i}].time cannot be empty"));
                }
                if rule.rate <= 0.0 {
                    errors.push(format!("cost_calculation.rates[{i}].rate must be positive"));
                }
            }
        }

        if self.tls.enabled {
            match (&self.tls.cert_file, &self.tls.key_file) {
                (Some(_), None) => {
                    errors.push("tls.key_file is required when tls.cert_file is set".to_string())
                }
                (None, Some(_)) => {
                    errors.push("tls.cert_file is required when tls.key_file is set".to_string())
                }
                _ => {}
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }

    /// Address to bind. A bare `:port` listens on all interfaces.
    pub fn bind_address(&self) -> String {
        match self.listen_address.strip_prefix(':') {
            Some(port) => format!("0.0.0.0:{port}"),
            None => self.listen_address.clone(),
        }
    }

    /// Bare URLs first, then metadata devices, each group in configured order.
    pub fn endpoints(&self) -> Vec<DeviceEndpoint> {
        self.shelly_devices
            .iter()
            .chain(self.devices.iter().map(|device| &device.url))
            .map(|url| DeviceEndpoint {
                url: url.clone(),
                metadata: self.device_by_url(url).map(DeviceMetadata::from),
            })
            .collect()
    }

    pub fn device_by_url(&self, url: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|device| device.url == url)
    }
}

fn is_host_port(address: &str) -> bool {
    match address.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;
    humantime::parse_duration(&text).map_err(serde::de::Error::custom)
}
