use std::io;
use thiserror::Error;

use crate::acquisition::AcquisitionState;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("config error: {0}")]
    Config(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("device not connected")]
    NotConnected,
    #[error("cannot {action} while {from}")]
    IllegalTransition {
        from: AcquisitionState,
        action: &'static str,
    },
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("empty command")]
    EmptyCommand,
}

impl From<serde_json::Error> for DriverError {
    fn from(e: serde_json::Error) -> Self {
        DriverError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;
