//! Accessory configuration, read once at startup.
//!
//! The file is either a single accessory object or a Homebridge-style
//! `config.json` whose `accessories` array holds `"accessory": "WebFan"`
//! entries. Keys keep the names Homebridge users already write.

use reqwest::{Method, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::characteristic::Characteristic;
use crate::error::{Error, Result};

pub const ACCESSORY_TYPE: &str = "WebFan";

const DEFAULT_POLL_INTERVAL_SECS: u64 = 300;
const DEFAULT_LISTENER_PORT: u16 = 2000;
const DEFAULT_TIMEOUT_MS: u64 = 3000;

fn default_name() -> String {
    "Fan".to_string()
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_port() -> u16 {
    DEFAULT_LISTENER_PORT
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_http_method() -> String {
    "GET".to_string()
}

/// How a value is attached to a device URL.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum UrlStyle {
    /// `{apiroute}/setState?value=1`
    #[default]
    Query,
    /// `{apiroute}/setState/1`
    Path,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct FanConfig {
    #[serde(default = "default_name")]
    pub name: String,
    pub apiroute: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    #[serde(default)]
    pub listener: bool,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub rotation_speed: bool,
    #[serde(default)]
    pub rotation_direction: bool,
    pub manufacturer: Option<String>,
    pub serial: Option<String>,
    pub model: Option<String>,
    pub firmware: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_http_method", rename = "http_method")]
    pub http_method: String,
    #[serde(default)]
    pub url_style: UrlStyle,
}

/// Static accessory metadata plus the characteristics it exposes.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AccessoryInformation {
    pub manufacturer: String,
    pub model: String,
    pub serial_number: String,
    pub firmware_revision: String,
    pub characteristics: Vec<Characteristic>,
}

impl FanConfig {
    /// Minimal configuration for a device at `apiroute`.
    pub fn new(apiroute: impl Into<String>) -> Self {
        Self {
            name: default_name(),
            apiroute: apiroute.into(),
            poll_interval: DEFAULT_POLL_INTERVAL_SECS,
            listener: false,
            port: DEFAULT_LISTENER_PORT,
            rotation_speed: false,
            rotation_direction: false,
            manufacturer: None,
            serial: None,
            model: None,
            firmware: None,
            username: None,
            password: None,
            timeout: DEFAULT_TIMEOUT_MS,
            http_method: default_http_method(),
            url_style: UrlStyle::Query,
        }
    }

    // Zero falls back to the default, as an unset value would.
    pub fn poll_interval(&self) -> Duration {
        match self.poll_interval {
            0 => Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            secs => Duration::from_secs(secs),
        }
    }

    pub fn timeout(&self) -> Duration {
        match self.timeout {
            0 => Duration::from_millis(DEFAULT_TIMEOUT_MS),
            ms => Duration::from_millis(ms),
        }
    }

    pub fn listener_port(&self) -> u16 {
        match self.port {
            0 => DEFAULT_LISTENER_PORT,
            port => port,
        }
    }

    pub fn method(&self) -> Result<Method> {
        Method::from_bytes(self.http_method.trim().to_ascii_uppercase().as_bytes())
            .map_err(|_| Error::Config(format!("invalid http_method '{}'", self.http_method)))
    }

    /// Basic-auth credentials, present only when both halves are configured.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(user), Some(pass)) => Some((user, pass)),
            _ => None,
        }
    }

    pub fn supports(&self, characteristic: Characteristic) -> bool {
        match characteristic {
            Characteristic::On => true,
            Characteristic::RotationSpeed => self.rotation_speed,
            Characteristic::RotationDirection => self.rotation_direction,
        }
    }

    pub fn information(&self) -> AccessoryInformation {
        let author = env!("CARGO_PKG_AUTHORS");
        AccessoryInformation {
            manufacturer: self.manufacturer.clone().unwrap_or_else(|| {
                if author.is_empty() {
                    env!("CARGO_PKG_NAME").to_string()
                } else {
                    author.to_string()
                }
            }),
            model: self
                .model
                .clone()
                .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string()),
            serial_number: self.serial.clone().unwrap_or_else(|| self.apiroute.clone()),
            firmware_revision: self
                .firmware
                .clone()
                .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
            characteristics: Characteristic::ALL
                .into_iter()
                .filter(|characteristic| self.supports(*characteristic))
                .collect(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("accessory name must not be empty".to_string()));
        }
        let url = Url::parse(&self.apiroute).map_err(|err| {
            Error::Config(format!(
                "invalid apiroute '{}' for {}: {err}",
                self.apiroute, self.name
            ))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "apiroute for {} must be an http(s) URL",
                self.name
            )));
        }
        self.method()?;
        Ok(())
    }
}

/// Parses a config document into the configured fan accessories.
pub fn parse_accessories(bytes: &[u8]) -> Result<Vec<FanConfig>> {
    let document: Value = serde_json::from_slice(bytes)?;
    let configs = match document.get("accessories") {
        Some(Value::Array(entries)) => entries
            .iter()
            .filter(|entry| entry.get("accessory").and_then(Value::as_str) == Some(ACCESSORY_TYPE))
            .map(|entry| FanConfig::deserialize(entry).map_err(Error::from))
            .collect::<Result<Vec<_>>>()?,
        Some(_) => return Err(Error::Config("'accessories' must be an array".to_string())),
        None => vec![FanConfig::deserialize(&document)?],
    };

    if configs.is_empty() {
        return Err(Error::Config(format!(
            "no '{ACCESSORY_TYPE}' accessories configured"
        )));
    }
    let mut names = HashSet::new();
    let mut ports: HashMap<u16, &str> = HashMap::new();
    for config in &configs {
        config.validate()?;
        if !names.insert(config.name.as_str()) {
            return Err(Error::Config(format!(
                "duplicate accessory name '{}'",
                config.name
            )));
        }
        if !config.listener {
            continue;
        }
        if let Some(other) = ports.insert(config.listener_port(), config.name.as_str()) {
            return Err(Error::Config(format!(
                "accessories '{}' and '{}' both listen on port {}",
                other,
                config.name,
                config.listener_port()
            )));
        }
    }
    Ok(configs)
}

pub fn load_accessories(path: &Path) -> Result<Vec<FanConfig>> {
    let bytes = fs::read(path).map_err(|err| {
        Error::Config(format!("unable to read {}: {err}", path.display()))
    })?;
    parse_accessories(&bytes)
}

pub fn config_path() -> Result<PathBuf> {
    let base = if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg)
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config")
    } else {
        return Err(Error::Config(
            "Unable to determine config directory".to_string(),
        ));
    };

    Ok(base.join("webfan").join("config.json"))
}
