//! Error types for the control core.

use avroom_common::ParseEnumError;
use thiserror::Error;

use crate::config::ConfigError;

/// Errors raised by the registry, routing controller and transition engine
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("duplicate device id: {0}")]
    DuplicateDevice(String),

    #[error("device {device}: missing required option '{option}'")]
    MissingOption { device: String, option: &'static str },

    #[error("device {device}: {message}")]
    InvalidOption { device: String, message: String },

    #[error(transparent)]
    InvalidValue(#[from] ParseEnumError),

    #[error("unknown destination: {0}")]
    UnknownDestination(String),

    #[error("no source is bound to input {0}")]
    UnknownSource(u16),

    #[error("unknown device: {0}")]
    UnknownDevice(String),

    #[error("no matrix switch is registered")]
    NoSwitch,

    #[error("system controller has not been started")]
    NotStarted,

    #[error("system controller has been shut down")]
    ShutDown,

    #[error("driver error on {device}: {message}")]
    Driver { device: String, message: String },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ControlError {
    pub(crate) fn invalid(device: &str, message: impl Into<String>) -> Self {
        ControlError::InvalidOption {
            device: device.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn driver(device: &str, err: impl std::fmt::Display) -> Self {
        ControlError::Driver {
            device: device.to_string(),
            message: err.to_string(),
        }
    }
}

pub type ControlResult<T> = Result<T, ControlError>;
