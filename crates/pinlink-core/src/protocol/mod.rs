//! Wire protocols between host and device
//!
//! A [`Protocol`] turns [`Command`]s into bytes and device frames into
//! [`DeviceMessage`]s. Protocols are looked up by name in a
//! [`ProtocolRegistry`]; a link is bound to one protocol for its lifetime.
//!
//! Two protocols are built in:
//!
//! - [`TextProtocol`] (`ardulink2`) - line based `alp://verb/args?id=n`
//!   frames with reply support
//! - [`BinaryProtocol`] (`simplebyte`) - fixed 3-byte frames for devices that
//!   cannot parse text, pin intensity and pin switch only

mod binary;
mod registry;
mod text;

pub use binary::{
    BinaryProtocol, BINARY_PROTOCOL_NAME, OPCODE_POWER_PIN_INTENSITY, OPCODE_POWER_PIN_SWITCH,
};
pub use registry::ProtocolRegistry;
pub use text::{TextProtocol, TEXT_PROTOCOL_NAME, TEXT_SCHEME};

use crate::error::Result;
use crate::pin::{Pin, PinValue};
use crate::scanner::Framing;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// A key press forwarded to the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPress {
    /// Typed character
    pub key_char: char,
    /// Key code
    pub key_code: i32,
    /// Key location on the keyboard
    pub key_location: i32,
    /// Modifier mask
    pub modifiers: i32,
    /// Extended modifier mask
    pub modifiers_ex: i32,
}

/// A tone played on an analog pin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tone {
    /// Output pin
    pub pin: Pin,
    /// Frequency in hertz
    pub hertz: u32,
    /// How long to play, `None` plays until a no-tone
    pub duration: Option<Duration>,
}

/// Commands the host sends to the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Forward a key press
    KeyPress(KeyPress),
    /// Set the intensity of an analog (PWM) pin
    SwitchAnalog {
        /// Target pin
        pin: Pin,
        /// Intensity
        value: u32,
    },
    /// Switch a digital pin high or low
    SwitchDigital {
        /// Target pin
        pin: Pin,
        /// New state
        value: bool,
    },
    /// Ask the device to report changes of a pin
    StartListening(Pin),
    /// Ask the device to stop reporting a pin
    StopListening(Pin),
    /// Play a tone
    Tone(Tone),
    /// Stop a tone on a pin
    NoTone(Pin),
    /// Opaque application message
    Custom(Vec<String>),
}

impl Command {
    /// Short name used in logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            Command::KeyPress(_) => "key-press",
            Command::SwitchAnalog { .. } => "switch-analog",
            Command::SwitchDigital { .. } => "switch-digital",
            Command::StartListening(_) => "start-listening",
            Command::StopListening(_) => "stop-listening",
            Command::Tone(_) => "tone",
            Command::NoTone(_) => "no-tone",
            Command::Custom(_) => "custom",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::SwitchAnalog { pin, value } => write!(f, "{} {}={}", self.name(), pin, value),
            Command::SwitchDigital { pin, value } => write!(f, "{} {}={}", self.name(), pin, value),
            Command::StartListening(pin) | Command::StopListening(pin) | Command::NoTone(pin) => {
                write!(f, "{} {}", self.name(), pin)
            }
            Command::Tone(tone) => write!(f, "{} {} {}Hz", self.name(), tone.pin, tone.hertz),
            _ => f.write_str(self.name()),
        }
    }
}

/// A device reply to a command sent with an id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Correlation id of the command
    pub id: u64,
    /// Whether the device executed the command
    pub ok: bool,
    /// Extra key/value parameters
    pub parameters: BTreeMap<String, String>,
}

impl Reply {
    /// Reply without parameters
    pub fn new(id: u64, ok: bool) -> Self {
        Self {
            id,
            ok,
            parameters: BTreeMap::new(),
        }
    }
}

/// Messages decoded from device frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceMessage {
    /// A listened pin changed state
    PinStateChanged {
        /// The pin
        pin: Pin,
        /// Its new value
        value: PinValue,
    },
    /// Reply to a command sent with an id
    Reply(Reply),
    /// Firmware finished booting
    Ready,
    /// Opaque application message
    Custom(Vec<String>),
}

/// A wire protocol implementation
///
/// Implementations are pure: encoding and decoding have no side effects and
/// never panic on malformed input.
pub trait Protocol: Send + Sync {
    /// Registry name of this protocol
    fn name(&self) -> &str;

    /// How inbound bytes are split into frames
    fn framing(&self) -> Framing;

    /// Encode a command, tagging it with `id` when a reply is expected
    fn encode(&self, command: &Command, id: Option<u64>) -> Result<Vec<u8>>;

    /// Decode one device frame (without its delimiter)
    fn decode(&self, frame: &[u8]) -> Result<DeviceMessage>;

    /// Encode a device message, as the device would send it
    fn encode_message(&self, message: &DeviceMessage) -> Result<Vec<u8>>;

    /// Decode one host frame back into a command and its reply id
    fn decode_command(&self, frame: &[u8]) -> Result<(Command, Option<u64>)>;
}

impl fmt::Debug for dyn Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Protocol").field("name", &self.name()).finish()
    }
}

/// Strip the framing delimiter from an encoded frame
///
/// Encoders return complete frames; decoders take frames without delimiter.
pub fn strip_delimiter<'a>(framing: &Framing, bytes: &'a [u8]) -> &'a [u8] {
    match framing {
        Framing::Delimited(delimiter) => bytes.strip_suffix(delimiter.as_slice()).unwrap_or(bytes),
        Framing::FixedLength(_) => bytes,
    }
}
