//! Error types for the failover engine.

use std::path::PathBuf;

use avail_core::AvailError;
use thiserror::Error;

pub type FailoverResult<T> = Result<T, FailoverError>;

#[derive(Debug, Error)]
pub enum FailoverError {
    #[error("stay-failed marker {path}: {source}")]
    Marker {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("interface {0} is not monitored")]
    UnknownInterface(String),
}

impl From<FailoverError> for AvailError {
    fn from(err: FailoverError) -> Self {
        match err {
            FailoverError::UnknownInterface(kind) => AvailError::not_found(format!("failover interface '{kind}'")),
            other => AvailError::Failed(other.to_string()),
        }
    }
}
