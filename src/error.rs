//! Error types for callstat
//!
//! Nothing in here ever reaches the instrumented workload: resolver and sink
//! failures are absorbed by the monitor and only logged. The variants exist so
//! configuration loading and collaborators have something typed to return.

use std::path::PathBuf;
use thiserror::Error;

/// Failure reported by an [`IdentityResolver`](crate::identity::IdentityResolver)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("call identity has no source information")]
    NoSourceInfo,

    #[error("resolver failed: {0}")]
    Failed(String),

    #[error("resolver panicked")]
    Panicked,
}

/// Errors for configuration loading and report publication
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("invalid configuration: {field} {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    #[error("failed to read config file {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("report sink failed: {0}")]
    Sink(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MonitorError>;
