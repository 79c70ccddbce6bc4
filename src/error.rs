use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

use crate::status::Schema;

/// Body did not match the schema of the endpoint that produced it.
#[derive(Error, Debug)]
#[error("{schema} response does not match the expected schema: {source}")]
pub struct DecodeError {
    pub schema: Schema,
    #[source]
    pub source: serde_json::Error,
}

/// Why a device could not be read during a cycle.
///
/// Every variant degrades to a single "device down" sample; none of them abort
/// the cycle.
#[derive(Error, Debug)]
pub enum AcquisitionError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("unexpected status code {status} from {url}")]
    Protocol { url: String, status: StatusCode },
    #[error("invalid body from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: DecodeError,
    },
    #[error("no answer from {url} within {timeout:?}")]
    Timeout { url: String, timeout: Duration },
}

/// A cost schedule entry that is not of the form `HH:MM-HH:MM`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid time range '{0}', expected HH:MM-HH:MM")]
pub struct ScheduleFormatError(pub String);

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid TLS material in {path}: {source}")]
    Tls {
        path: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),
    #[error("validation failed: {}", .0.join("; "))]
    Invalid(Vec<String>),
}
