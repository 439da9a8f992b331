//! Error types for message encoding and decoding.

use avail_core::AvailError;
use thiserror::Error;

pub type MsgResult<T> = Result<T, MsgError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MsgError {
    #[error("message truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("message too large: {0} bytes")]
    TooLarge(usize),

    #[error("unsupported version {version}.{revision}")]
    BadVersion { version: u16, revision: u16 },

    #[error("authentication failed")]
    BadAuth,

    #[error("unknown message type {0}")]
    UnknownType(u32),

    #[error("invalid {field} value {value}")]
    BadEnum { field: &'static str, value: u32 },

    #[error("{field} longer than {max} bytes")]
    FieldTooLong { field: &'static str, max: usize },

    #[error("malformed text message: {0}")]
    BadText(String),
}

impl From<MsgError> for AvailError {
    fn from(err: MsgError) -> Self {
        AvailError::Failed(err.to_string())
    }
}
