use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::Config;

/// Prometheus exporter for Shelly devices.
#[derive(Debug, Default, Parser)]
#[command(version, about)]
pub struct Cli {
    /// YAML configuration file
    #[arg(long, env = "SHELLY_EXPORTER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address the HTTP server listens on
    #[arg(long, env = "SHELLY_EXPORTER_LISTEN_ADDRESS")]
    pub listen_address: Option<String>,

    #[arg(long, env = "SHELLY_EXPORTER_METRICS_PATH")]
    pub metrics_path: Option<String>,

    /// trace, debug, info, warn or error
    #[arg(long, env = "SHELLY_EXPORTER_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Device base URLs, comma separated
    #[arg(long, env = "SHELLY_EXPORTER_SHELLY_DEVICES", value_delimiter = ',')]
    pub shelly_devices: Vec<String>,

    /// Expected time between scrapes, e.g. `30s`
    #[arg(long, env = "SHELLY_EXPORTER_SCRAPE_INTERVAL", value_parser = humantime::parse_duration)]
    pub scrape_interval: Option<Duration>,

    /// Deadline for one device, e.g. `10s` or `500ms`
    #[arg(long, env = "SHELLY_EXPORTER_SCRAPE_TIMEOUT", value_parser = humantime::parse_duration)]
    pub scrape_timeout: Option<Duration>,

    #[arg(long, env = "SHELLY_EXPORTER_TLS_ENABLED")]
    pub tls_enabled: bool,

    #[arg(long, env = "SHELLY_EXPORTER_TLS_CA_FILE")]
    pub tls_ca_file: Option<PathBuf>,

    #[arg(long, env = "SHELLY_EXPORTER_TLS_CERT_FILE")]
    pub tls_cert_file: Option<PathBuf>,

    #[arg(long, env = "SHELLY_EXPORTER_TLS_KEY_FILE")]
    pub tls_key_file: Option<PathBuf>,

    #[arg(long, env = "SHELLY_EXPORTER_TLS_INSECURE_SKIP_VERIFY")]
    pub tls_insecure_skip_verify: bool,
}

impl Cli {
    /// Overrides file values with whatever was given on the command line or
    /// through the environment. Unset flags leave the file value alone.
    pub fn apply_to(&self, config: &mut Config) {
        if let Some(listen_address) = &self.listen_address {
            config.listen_address = listen_address.clone();
        }
        if let Some(metrics_path) = &self.metrics_path {
            config.metrics_path = metrics_path.clone();
        }
        if let Some(log_level) = &self.log_level {
            config.log_level = log_level.clone();
        }
        let devices: Vec<String> = self
            .shelly_devices
            .iter()
            .map(|device| device.trim())
            .filter(|device| !device.is_empty())
            .map(str::to_string)
            .collect();
        if !devices.is_empty() {
            config.shelly_devices = devices;
        }
        if let Some(interval) = self.scrape_interval {
            config.scrape_interval = interval;
        }
        if let Some(timeout) = self.scrape_timeout {
            config.scrape_timeout = timeout;
        }

        if self.tls_enabled {
            config.tls.enabled = true;
        }
        if let Some(ca_file) = &self.tls_ca_file {
            config.tls.ca_file = Some(ca_file.clone());
        }
        if let Some(cert_file) = &self.tls_cert_file {
            config.tls.cert_file = Some(cert_file.clone());
        }
        if let Some(key_file) = &self.tls_key_file {
            config.tls.key_file = Some(key_file.clone());
        }
        if self.tls_insecure_skip_verify {
            config.tls.insecure_skip_verify = true;
        }
    }
}
