use reqwest::StatusCode;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::config::TlsConfig;
use crate::error::{AcquisitionError, ConfigError};
use crate::status::{normalize, Schema, StatusSnapshot};

// Gen2+ API: https://shelly-api-docs.shelly.cloud/gen2/ComponentsAndServices/Shelly#shellygetstatus
const RPC_STATUS_PATH: &str = "/rpc/Shelly.GetStatus";
// Gen1 API: https://shelly-api-docs.shelly.cloud/gen1/#status
const LEGACY_STATUS_PATH: &str = "/status";

/// Reads the status of one device, whichever API generation it speaks.
#[derive(Debug, Clone)]
pub struct ShellyClient {
    base_url: String,
    client: reqwest::Client,
}

impl ShellyClient {
    pub fn new(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        let base_url: String = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Tries the RPC API first and falls back to the legacy API when the RPC
    /// endpoint answers with a non-200 status or a body it cannot decode.
    ///
    /// Both attempts share `timeout`. When it runs out the in-flight request is
    /// dropped and [`AcquisitionError::Timeout`] is returned.
    pub async fn get_status(&self, timeout: Duration) -> Result<StatusSnapshot, AcquisitionError> {
        tokio::time::timeout(timeout, self.fetch_status())
            .await
            .map_err(|_| AcquisitionError::Timeout {
                url: self.base_url.clone(),
                timeout,
            })?
    }

    async fn fetch_status(&self) -> Result<StatusSnapshot, AcquisitionError> {
        match self.fetch(Schema::Rpc).await {
            Err(e @ (AcquisitionError::Protocol { .. } | AcquisitionError::Decode { .. })) => {
                debug!(device = %self.base_url, error = %e, "RPC status unavailable, trying legacy API");
                self.fetch(Schema::Legacy).await
            }
            result => result,
        }
    }

    async fn fetch(&self, schema: Schema) -> Result<StatusSnapshot, AcquisitionError> {
        let url = match schema {
            Schema::Rpc => format!("{}{}", self.base_url, RPC_STATUS_PATH),
            Schema::Legacy => format!("{}{}", self.base_url, LEGACY_STATUS_PATH),
        };

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|source| AcquisitionError::Transport {
                url: url.clone(),
                source,
            })?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(AcquisitionError::Protocol { url, status });
        }

        let body = response
            .bytes()
            .await
            .map_err(|source| AcquisitionError::Transport {
                url: url.clone(),
                source,
            })?;
        normalize(schema, &body).map_err(|source| AcquisitionError::Decode { url, source })
    }
}

/// Builds the HTTP client shared by all devices, applying the outbound TLS
/// settings when enabled.
pub fn build_http_client(tls: &TlsConfig) -> Result<reqwest::Client, ConfigError> {
    let mut builder = reqwest::Client::builder()
        .user_agent(concat!("shelly_exporter/", env!("CARGO_PKG_VERSION")));

    if tls.enabled {
        if let Some(ca_file) = &tls.ca_file {
            let pem = read_pem(ca_file)?;
            let certificate =
                reqwest::Certificate::from_pem(&pem).map_err(|source| ConfigError::Tls {
                    path: ca_file.display().to_string(),
                    source,
                })?;
            builder = builder.add_root_certificate(certificate);
        }

        if let (Some(cert_file), Some(key_file)) = (&tls.cert_file, &tls.key_file) {
            let mut pem = read_pem(cert_file)?;
            pem.extend(read_pem(key_file)?);
            let identity = reqwest::Identity::from_pem(&pem).map_err(|source| ConfigError::Tls {
                path: cert_file.display().to_string(),
                source,
            })?;
            builder = builder.identity(identity);
        }

        builder = builder.danger_accept_invalid_certs(tls.insecure_skip_verify);
    }

    builder.build().map_err(ConfigError::HttpClient)
}

fn read_pem(path: &Path) -> Result<Vec<u8>, ConfigError> {
    fs::read(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })
}
