use std::net::SocketAddr;
use thiserror::Error;

use crate::characteristic::Characteristic;

#[derive(Debug, Error)]
pub enum Error {
    #[error("device request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid device response: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("device response is missing {0}")]
    MissingField(&'static str),

    #[error("invalid value '{value}' for {characteristic}")]
    InvalidValue {
        characteristic: Characteristic,
        value: String,
    },

    #[error("{0} is not enabled for this accessory")]
    Unsupported(Characteristic),

    #[error("unknown characteristic '{0}'")]
    UnknownCharacteristic(String),

    #[error("failed to bind {addr} (is the port already in use?): {message}")]
    Bind { addr: SocketAddr, message: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
