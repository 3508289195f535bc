//! Error kinds for the subdomain lifecycle
//!
//! Every failure is classified by how far it reaches:
//! - [`ValidationError`] rejects operator input before anything is touched
//! - [`IoError`] aborts the current subdomain's filesystem work
//! - [`CertError`] is reported but never corrupts configuration state
//! - [`ConfigError`] blocks a proxy reload; the running configuration stays active
//! - [`Error::NotFound`] rejects a selection before any mutation

use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result alias used across the library
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Operator input that failed validation
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid subdomain format: {0:?}")]
    Subdomain(String),
    #[error("invalid IP address format: {0:?}")]
    Address(String),
    #[error("invalid port number: {0:?}")]
    Port(String),
    #[error("subdomain {0} is already managed")]
    Duplicate(String),
}

/// Filesystem failure with the path and operation that triggered it
#[derive(Debug, Error)]
#[error("failed to {operation} {}: {source}", path.display())]
pub struct IoError {
    /// Short verb phrase, e.g. "write" or "back up"
    pub operation: &'static str,
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

impl IoError {
    pub fn new(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self {
            operation,
            path: path.into(),
            source,
        }
    }

    /// Build a closure for `map_err` that attaches operation and path
    pub fn with(operation: &'static str, path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| Self::new(operation, path, source)
    }
}

/// The certificate-authority client failed for one subdomain
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("certificate operation for {subdomain} failed: {message}")]
pub struct CertError {
    pub subdomain: String,
    /// Diagnostic text from the client's error stream, or the spawn failure
    pub message: String,
}

impl CertError {
    pub fn new(subdomain: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            subdomain: subdomain.into(),
            message: message.into(),
        }
    }
}

/// The proxy rejected its configuration or could not be reloaded
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("proxy configuration error: {message}")]
pub struct ConfigError {
    pub message: String,
}

impl ConfigError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Loading or persisting the desired-state file failed
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to serialize desired state: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("configuration errors:\n  - {}", .0.join("\n  - "))]
    Invalid(Vec<String>),
}

/// Any error the library can surface
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Io(#[from] IoError),
    #[error(transparent)]
    Cert(#[from] CertError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("subdomain {0} not found")]
    NotFound(String),
}

/// Steps a single-subdomain operation moves through
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Validated,
    Rendered,
    Materialized,
    Removed,
    CertificateObtained,
    CertificateDeleted,
    Reloaded,
    Persisted,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Validated => "validation",
            Stage::Rendered => "rendering",
            Stage::Materialized => "materialize",
            Stage::Removed => "config removal",
            Stage::CertificateObtained => "certificate issuance",
            Stage::CertificateDeleted => "certificate deletion",
            Stage::Reloaded => "proxy reload",
            Stage::Persisted => "persist",
            Stage::Done => "done",
        };
        f.write_str(name)
    }
}

/// A single-subdomain operation that could not safely change primary state
#[derive(Debug, Error)]
#[error("{stage} failed: {source}")]
pub struct OperationError {
    /// The stage that was being attempted
    pub stage: Stage,
    #[source]
    pub source: Error,
}

impl OperationError {
    pub fn new(stage: Stage, source: impl Into<Error>) -> Self {
        Self {
            stage,
            source: source.into(),
        }
    }
}
