//! Shelly Exporter Library
//!
//! Polls Shelly devices over their HTTP APIs (Gen2+ RPC with a fallback to the
//! Gen1 legacy API), normalizes the answers into one status shape and exposes
//! them as Prometheus metrics together with electricity cost and heating share
//! derived across all devices.

pub mod cli;
pub mod collector;
pub mod config;
pub mod error;
pub mod exposition;
pub mod rate;
pub mod server;
pub mod shelly_client;
pub mod status;

// Re-export commonly used types for easier access
pub use collector::{Collector, CycleReport, CycleTotals};
pub use config::{Config, DeviceEndpoint};
pub use error::{AcquisitionError, ConfigError};
pub use shelly_client::{build_http_client, ShellyClient};
pub use status::StatusSnapshot;
