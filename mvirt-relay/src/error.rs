//! Daemon-level error type.

use crate::config::ConfigError;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to open {what}: {source}")]
    Socket {
        what: &'static str,
        #[source]
        source: io::Error,
    },
}

impl RelayError {
    pub(crate) fn socket(what: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| RelayError::Socket { what, source }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
