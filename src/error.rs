// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HaulError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection to {addr} failed: {reason}")]
    Connect { addr: String, reason: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("State lock busy: {0}")]
    LockBusy(String),

    #[error("Trigger error: {0}")]
    Trigger(String),

    #[error("Messaging error: {0}")]
    Zmq(String),
}

impl From<tmq::TmqError> for HaulError {
    fn from(e: tmq::TmqError) -> Self {
        HaulError::Zmq(e.to_string())
    }
}

impl From<zmq::Error> for HaulError {
    fn from(e: zmq::Error) -> Self {
        HaulError::Zmq(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, HaulError>;
