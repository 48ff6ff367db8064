//! Device I/O lines and their values

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of a device I/O line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PinKind {
    /// Analog line (integer readings, PWM intensity writes)
    Analog,
    /// Digital line (high/low)
    Digital,
}

impl PinKind {
    /// Single-letter prefix used in topics and logs (`A` / `D`)
    pub fn letter(&self) -> char {
        match self {
            PinKind::Analog => 'A',
            PinKind::Digital => 'D',
        }
    }
}

/// A device I/O line, identified by kind and index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pin {
    kind: PinKind,
    number: u32,
}

impl Pin {
    /// Analog pin `number`
    pub const fn analog(number: u32) -> Self {
        Self {
            kind: PinKind::Analog,
            number,
        }
    }

    /// Digital pin `number`
    pub const fn digital(number: u32) -> Self {
        Self {
            kind: PinKind::Digital,
            number,
        }
    }

    /// Pin of the given kind
    pub const fn new(kind: PinKind, number: u32) -> Self {
        Self { kind, number }
    }

    /// Kind of this pin
    pub fn kind(&self) -> PinKind {
        self.kind
    }

    /// Index of this pin
    pub fn number(&self) -> u32 {
        self.number
    }

    /// Check if this is an analog pin
    pub fn is_analog(&self) -> bool {
        self.kind == PinKind::Analog
    }

    /// Check if this is a digital pin
    pub fn is_digital(&self) -> bool {
        self.kind == PinKind::Digital
    }
}

impl fmt::Display for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind.letter(), self.number)
    }
}

/// A reading or a written state of a pin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PinValue {
    /// Analog reading
    Analog(u32),
    /// Digital state
    Digital(bool),
}

impl PinValue {
    /// The pin kind this value belongs to
    pub fn kind(&self) -> PinKind {
        match self {
            PinValue::Analog(_) => PinKind::Analog,
            PinValue::Digital(_) => PinKind::Digital,
        }
    }

    /// Canonical string form used on the bus (`1`/`0` digital, decimal analog)
    pub fn to_payload(&self) -> String {
        match self {
            PinValue::Analog(value) => value.to_string(),
            PinValue::Digital(true) => "1".to_string(),
            PinValue::Digital(false) => "0".to_string(),
        }
    }
}

impl fmt::Display for PinValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_payload())
    }
}

/// A pin state change reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinEvent {
    /// The pin that changed
    pub pin: Pin,
    /// Its new value
    pub value: PinValue,
}
