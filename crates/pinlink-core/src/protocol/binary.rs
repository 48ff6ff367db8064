//! Fixed-size binary protocol
//!
//! Each command is a 3-byte frame `[opcode, pin, value]`. Only pin intensity
//! and pin switch exist, and the device never replies. Meant for firmware
//! whose program memory cannot hold a text parser.

use crate::error::{LinkError, Result};
use crate::pin::Pin;
use crate::protocol::{Command, DeviceMessage, Protocol};
use crate::scanner::Framing;

/// Registry name of the binary protocol
pub const BINARY_PROTOCOL_NAME: &str = "simplebyte";

/// Opcode for setting an analog pin intensity
pub const OPCODE_POWER_PIN_INTENSITY: u8 = 11;

/// Opcode for switching a digital pin
pub const OPCODE_POWER_PIN_SWITCH: u8 = 12;

/// Frame length in bytes
const FRAME_LEN: usize = 3;

/// The 3-byte binary protocol
#[derive(Debug, Clone, Default)]
pub struct BinaryProtocol;

impl BinaryProtocol {
    /// Create the protocol
    pub fn new() -> Self {
        Self
    }

    fn unsupported(&self, what: &str) -> LinkError {
        LinkError::UnsupportedCommand {
            protocol: BINARY_PROTOCOL_NAME.to_string(),
            command: what.to_string(),
        }
    }
}

fn to_byte(value: u32, what: &str) -> Result<u8> {
    u8::try_from(value).map_err(|_| LinkError::InvalidValue(format!("{} {} exceeds 255", what, value)))
}

impl Protocol for BinaryProtocol {
    fn name(&self) -> &str {
        BINARY_PROTOCOL_NAME
    }

    fn framing(&self) -> Framing {
        Framing::FixedLength(FRAME_LEN)
    }

    fn encode(&self, command: &Command, id: Option<u64>) -> Result<Vec<u8>> {
        if id.is_some() {
            return Err(LinkError::ReplyNotSupported(BINARY_PROTOCOL_NAME.to_string()));
        }
        match command {
            Command::SwitchAnalog { pin, value } => Ok(vec![
                OPCODE_POWER_PIN_INTENSITY,
                to_byte(pin.number(), "pin")?,
                to_byte(*value, "intensity")?,
            ]),
            Command::SwitchDigital { pin, value } => Ok(vec![
                OPCODE_POWER_PIN_SWITCH,
                to_byte(pin.number(), "pin")?,
                u8::from(*value),
            ]),
            other => Err(self.unsupported(other.name())),
        }
    }

    fn decode(&self, frame: &[u8]) -> Result<DeviceMessage> {
        Err(LinkError::decode(
            frame,
            "binary protocol carries no device messages",
        ))
    }

    fn encode_message(&self, message: &DeviceMessage) -> Result<Vec<u8>> {
        let what = match message {
            DeviceMessage::PinStateChanged { .. } => "pin-state-changed",
            DeviceMessage::Reply(_) => "reply",
            DeviceMessage::Ready => "ready",
            DeviceMessage::Custom(_) => "custom",
        };
        Err(self.unsupported(what))
    }

    fn decode_command(&self, frame: &[u8]) -> Result<(Command, Option<u64>)> {
        let [opcode, pin, value] = frame else {
            return Err(LinkError::decode(frame, "binary frames are 3 bytes"));
        };
        let command = match *opcode {
            OPCODE_POWER_PIN_INTENSITY => Command::SwitchAnalog {
                pin: Pin::analog(u32::from(*pin)),
                value: u32::from(*value),
            },
            OPCODE_POWER_PIN_SWITCH => Command::SwitchDigital {
                pin: Pin::digital(u32::from(*pin)),
                value: *value != 0,
            },
            other => return Err(LinkError::decode(frame, format!("unknown opcode {}", other))),
        };
        Ok((command, None))
    }
}
