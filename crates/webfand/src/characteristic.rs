//! Fan characteristics and their cached readings.

use serde::{Serialize, Serializer};
use serde_json::Value;
use std::fmt;

use crate::error::{Error, Result};

const SPEED_MAX: u8 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Characteristic {
    On,
    RotationSpeed,
    RotationDirection,
}

impl Characteristic {
    pub const ALL: [Characteristic; 3] = [
        Characteristic::On,
        Characteristic::RotationSpeed,
        Characteristic::RotationDirection,
    ];

    /// Name used by the device when pushing updates, and by the host API.
    pub fn push_name(self) -> &'static str {
        match self {
            Characteristic::On => "state",
            Characteristic::RotationSpeed => "rotationSpeed",
            Characteristic::RotationDirection => "rotationDirection",
        }
    }

    pub fn from_push_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|characteristic| characteristic.push_name() == name)
    }

    /// Device endpoint that sets this characteristic.
    pub fn set_endpoint(self) -> &'static str {
        match self {
            Characteristic::On => "setState",
            Characteristic::RotationSpeed => "setRotationSpeed",
            Characteristic::RotationDirection => "setRotationDirection",
        }
    }
}

impl fmt::Display for Characteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Characteristic::On => "On",
            Characteristic::RotationSpeed => "RotationSpeed",
            Characteristic::RotationDirection => "RotationDirection",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationDirection {
    Clockwise,
    CounterClockwise,
}

impl RotationDirection {
    pub fn as_u8(self) -> u8 {
        match self {
            RotationDirection::Clockwise => 0,
            RotationDirection::CounterClockwise => 1,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(RotationDirection::Clockwise),
            1 => Some(RotationDirection::CounterClockwise),
            _ => None,
        }
    }
}

impl Serialize for RotationDirection {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_u8())
    }
}

/// A typed value for one characteristic.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CharacteristicValue {
    On(bool),
    RotationSpeed(u8),
    RotationDirection(RotationDirection),
}

impl CharacteristicValue {
    pub fn characteristic(&self) -> Characteristic {
        match self {
            CharacteristicValue::On(_) => Characteristic::On,
            CharacteristicValue::RotationSpeed(_) => Characteristic::RotationSpeed,
            CharacteristicValue::RotationDirection(_) => Characteristic::RotationDirection,
        }
    }

    /// Value as it appears in device URLs.
    pub fn wire_value(&self) -> u8 {
        match self {
            CharacteristicValue::On(on) => u8::from(*on),
            CharacteristicValue::RotationSpeed(speed) => *speed,
            CharacteristicValue::RotationDirection(direction) => direction.as_u8(),
        }
    }

    /// Parses a value received as text (webhook path/query, CLI).
    pub fn parse(characteristic: Characteristic, raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let invalid = || Error::InvalidValue {
            characteristic,
            value: raw.to_string(),
        };
        match characteristic {
            Characteristic::On => match trimmed {
                "1" | "true" => Ok(CharacteristicValue::On(true)),
                "0" | "false" => Ok(CharacteristicValue::On(false)),
                _ => Err(invalid()),
            },
            _ => {
                let number: f64 = trimmed.parse().map_err(|_| invalid())?;
                Self::from_number(characteristic, number).ok_or_else(invalid)
            }
        }
    }

    /// Parses a value taken from a JSON document (device status, host API).
    pub fn from_json(characteristic: Characteristic, value: &Value) -> Result<Self> {
        let parsed = match value {
            Value::String(raw) => return Self::parse(characteristic, raw),
            Value::Bool(on) if characteristic == Characteristic::On => {
                Some(CharacteristicValue::On(*on))
            }
            Value::Number(number) => number
                .as_f64()
                .and_then(|number| Self::from_number(characteristic, number)),
            _ => None,
        };
        parsed.ok_or_else(|| Error::InvalidValue {
            characteristic,
            value: value.to_string(),
        })
    }

    fn from_number(characteristic: Characteristic, number: f64) -> Option<Self> {
        if !number.is_finite() {
            return None;
        }
        match characteristic {
            Characteristic::On => match number {
                n if n == 0.0 => Some(CharacteristicValue::On(false)),
                n if n == 1.0 => Some(CharacteristicValue::On(true)),
                _ => None,
            },
            Characteristic::RotationSpeed => {
                let speed = number.round().clamp(0.0, f64::from(SPEED_MAX)) as u8;
                Some(CharacteristicValue::RotationSpeed(speed))
            }
            Characteristic::RotationDirection => {
                if number.fract() != 0.0 || !(0.0..=1.0).contains(&number) {
                    return None;
                }
                RotationDirection::from_u8(number as u8).map(CharacteristicValue::RotationDirection)
            }
        }
    }
}

impl fmt::Display for CharacteristicValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.wire_value())
    }
}

/// Last known value of a characteristic.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "value", rename_all = "lowercase")]
pub enum Reading<T> {
    Unknown,
    Value(T),
    Failed(String),
}

impl<T> Default for Reading<T> {
    fn default() -> Self {
        Reading::Unknown
    }
}

impl<T> Reading<T> {
    pub fn is_failed(&self) -> bool {
        matches!(self, Reading::Failed(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FanState {
    pub on: Reading<bool>,
    pub rotation_speed: Reading<u8>,
    pub rotation_direction: Reading<RotationDirection>,
}

impl FanState {
    pub fn apply(&mut self, value: CharacteristicValue) {
        match value {
            CharacteristicValue::On(on) => self.on = Reading::Value(on),
            CharacteristicValue::RotationSpeed(speed) => {
                self.rotation_speed = Reading::Value(speed)
            }
            CharacteristicValue::RotationDirection(direction) => {
                self.rotation_direction = Reading::Value(direction)
            }
        }
    }
}
