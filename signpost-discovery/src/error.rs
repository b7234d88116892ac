//! Discovery error types

use std::time::Duration;
use thiserror::Error;

/// Service discovery errors
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Registry connection failed: {0}")]
    Connection(String),

    #[error("Registry fetch failed: {0}")]
    Fetch(String),

    #[error("Registry watch failed: {0}")]
    Watch(String),

    #[error("Registry request timed out after {0:?}")]
    Timeout(Duration),

    #[error("No endpoint found for service: {0}")]
    NotFound(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DiscoveryError>;
