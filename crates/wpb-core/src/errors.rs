use std::{path::PathBuf, time::Duration};

/// Core error type for the pairing service.
///
/// Adapter crates (bridge, HTTP) map their specific failures into this type so
/// the service can classify them consistently (user input vs throttled vs
/// upstream vs internal).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("invalid phone number format: {digits} digits")]
    InvalidPhoneFormat { digits: usize },

    #[error("pairing already in progress")]
    Busy,

    #[error("pairing requested too soon, retry in {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("pairing code request rejected: {0}")]
    PairingRejected(String),

    #[error("pairing code request failed after {attempts} attempts: {details}")]
    PairingExhausted { attempts: u32, details: String },

    #[error("connection closed before pairing code could be generated: {details}")]
    ConnectionClosedEarly { details: String },

    #[error("pairing timed out after {0:?}")]
    TimedOut(Duration),

    #[error("protocol error: {message}")]
    Protocol {
        status: Option<u16>,
        message: String,
    },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid path: {path}: {reason}")]
    InvalidPath { path: PathBuf, reason: String },

    #[error("external error: {0}")]
    External(String),
}

impl Error {
    /// Upstream status code, when the protocol boundary supplied one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Protocol { status, .. } => *status,
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
