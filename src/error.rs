// src/error.rs
//! Error taxonomy for the directory service.
//!
//! `ConfigError` aborts startup. `StorageError` and `FetchError` are per-source
//! failures: the aggregator records them on the source's outcome and keeps going.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::types::FetchStatus;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config from {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("no companies configured")]
    Empty,

    #[error("company id must not be blank")]
    BlankId,

    #[error("duplicate company id '{0}'")]
    DuplicateSource(String),

    #[error("company ids '{id}' and '{other}' map to the same credential variable {env_var}")]
    CollidingIds {
        id: String,
        other: String,
        env_var: String,
    },

    #[error("current company '{0}' is not among the configured companies")]
    UnknownCurrent(String),

    #[error("company '{0}' is remote but has no api endpoint")]
    MissingEndpoint(String),

    #[error("company '{id}' has an invalid api endpoint: {reason}")]
    InvalidEndpoint { id: String, reason: String },

    #[error("company '{id}' has no api credential (set {env_var})")]
    MissingCredential { id: String, env_var: String },

    #[error("ADMIN_TOKEN is not set; refusing to start without an explicit admin credential")]
    MissingAdminToken,

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Hard failure of the local record store. "No records" is not an error.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("record store unavailable at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("record store at {path} is malformed: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("record store lock poisoned")]
    Poisoned,
}

/// Failure of a single peer fetch attempt (or the last one of a sequence).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("peer answered HTTP {status}")]
    HttpStatus { status: u16 },

    #[error("undecodable peer response: {0}")]
    Decode(String),

    /// The descriptor points at this deployment, so there is nothing to call.
    #[error("source '{0}' has no remote endpoint")]
    NotRemote(String),
}

impl FetchError {
    /// Transport-level failures are worth another attempt; a peer that answered
    /// with an error status or garbage is not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Timeout { .. } | FetchError::Connection(_))
    }

    pub fn category(&self) -> &'static str {
        match self {
            FetchError::Timeout { .. } | FetchError::Connection(_) => "transport",
            FetchError::HttpStatus { .. } | FetchError::Decode(_) => "protocol",
            FetchError::NotRemote(_) => "routing",
        }
    }

    pub fn status(&self) -> FetchStatus {
        match self {
            FetchError::Timeout { .. } => FetchStatus::Timeout,
            _ => FetchStatus::Error,
        }
    }
}
