//! Line based text protocol
//!
//! Frames are ASCII lines of the form `alp://<verb>/<args>[?id=<n>]`:
//!
//! | verb | direction | args |
//! |------|-----------|------|
//! | `kprs` | host → device | `chr<c>cod<n>loc<n>mod<n>mex<n>` |
//! | `ppin` | host → device | `<pin>/<0..=255>` |
//! | `ppsw` | host → device | `<pin>/<0\|1>` |
//! | `srld` / `spld` | host → device | `<pin>` (digital) |
//! | `srla` / `spla` | host → device | `<pin>` (analog) |
//! | `tone` | host → device | `<pin>/<hertz>/<millis or -1>` |
//! | `notn` | host → device | `<pin>` |
//! | `cust` | both | `/`-joined payload |
//! | `ared` / `dred` | device → host | `<pin>/<value>` |
//! | `rply` | device → host | `ok\|ko` with `?id=<n>[&key=value]` |
//! | `ready` | device → host | none |
//!
//! The `?id=` suffix is only sent for commands that expect a reply, so
//! firmware that never replies is never asked to.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{LinkError, Result};
use crate::pin::{Pin, PinKind, PinValue};
use crate::protocol::{Command, DeviceMessage, KeyPress, Protocol, Reply, Tone};
use crate::scanner::Framing;

/// URI scheme of every frame
pub const TEXT_SCHEME: &str = "alp";

/// Registry name of the text protocol
pub const TEXT_PROTOCOL_NAME: &str = "ardulink2";

/// Highest intensity accepted by `ppin`
const MAX_INTENSITY: u32 = 255;

/// The reference text protocol
#[derive(Debug, Clone, Default)]
pub struct TextProtocol;

impl TextProtocol {
    /// Create the protocol
    pub fn new() -> Self {
        Self
    }

    fn verb(command: &Command) -> &'static str {
        match command {
            Command::KeyPress(_) => "kprs",
            Command::SwitchAnalog { .. } => "ppin",
            Command::SwitchDigital { .. } => "ppsw",
            Command::StartListening(pin) if pin.is_digital() => "srld",
            Command::StartListening(_) => "srla",
            Command::StopListening(pin) if pin.is_digital() => "spld",
            Command::StopListening(_) => "spla",
            Command::Tone(_) => "tone",
            Command::NoTone(_) => "notn",
            Command::Custom(_) => "cust",
        }
    }

    fn args(command: &Command) -> Result<String> {
        let args = match command {
            Command::KeyPress(key) => format!(
                "chr{}cod{}loc{}mod{}mex{}",
                key.key_char, key.key_code, key.key_location, key.modifiers, key.modifiers_ex
            ),
            Command::SwitchAnalog { pin, value } => {
                if *value > MAX_INTENSITY {
                    return Err(LinkError::InvalidValue(format!(
                        "intensity {} on {} exceeds {}",
                        value, pin, MAX_INTENSITY
                    )));
                }
                format!("{}/{}", pin.number(), value)
            }
            Command::SwitchDigital { pin, value } => {
                format!("{}/{}", pin.number(), u8::from(*value))
            }
            Command::StartListening(pin) | Command::StopListening(pin) | Command::NoTone(pin) => {
                pin.number().to_string()
            }
            Command::Tone(tone) => {
                let millis = tone
                    .duration
                    .map(|d| d.as_millis().to_string())
                    .unwrap_or_else(|| "-1".to_string());
                format!("{}/{}/{}", tone.pin.number(), tone.hertz, millis)
            }
            Command::Custom(payload) => join_payload(payload)?,
        };
        Ok(args)
    }
}

impl Protocol for TextProtocol {
    fn name(&self) -> &str {
        TEXT_PROTOCOL_NAME
    }

    fn framing(&self) -> Framing {
        Framing::newline()
    }

    fn encode(&self, command: &Command, id: Option<u64>) -> Result<Vec<u8>> {
        let mut frame = format!(
            "{}://{}/{}",
            TEXT_SCHEME,
            Self::verb(command),
            Self::args(command)?
        );
        if let Some(id) = id {
            frame.push_str(&format!("?id={}", id));
        }
        frame.push('\n');
        Ok(frame.into_bytes())
    }

    fn decode(&self, frame: &[u8]) -> Result<DeviceMessage> {
        let parsed = ParsedFrame::parse(frame)?;
        match parsed.verb {
            "ared" => {
                let (pin, value) = pin_and_value(frame, parsed.args)?;
                let value = parse_number::<u32>(frame, value, "analog value")?;
                Ok(DeviceMessage::PinStateChanged {
                    pin: Pin::analog(pin),
                    value: PinValue::Analog(value),
                })
            }
            "dred" => {
                let (pin, value) = pin_and_value(frame, parsed.args)?;
                let value = parse_bit(value)
                    .ok_or_else(|| LinkError::decode(frame, "digital value must be 0 or 1"))?;
                Ok(DeviceMessage::PinStateChanged {
                    pin: Pin::digital(pin),
                    value: PinValue::Digital(value),
                })
            }
            "rply" => {
                let ok = match parsed.args {
                    "ok" => true,
                    "ko" => false,
                    _ => return Err(LinkError::decode(frame, "reply must be ok or ko")),
                };
                let mut parameters = parsed.query;
                let id = parameters
                    .remove("id")
                    .ok_or_else(|| LinkError::decode(frame, "reply without id"))?;
                let id = parse_number::<u64>(frame, &id, "reply id")?;
                Ok(DeviceMessage::Reply(Reply { id, ok, parameters }))
            }
            "ready" => Ok(DeviceMessage::Ready),
            "cust" => Ok(DeviceMessage::Custom(split_payload(parsed.args))),
            verb => Err(LinkError::decode(frame, format!("unknown verb {:?}", verb))),
        }
    }

    fn encode_message(&self, message: &DeviceMessage) -> Result<Vec<u8>> {
        let body = match message {
            DeviceMessage::PinStateChanged { pin, value } => match (pin.kind(), value) {
                (PinKind::Analog, PinValue::Analog(v)) => format!("ared/{}/{}", pin.number(), v),
                (PinKind::Digital, PinValue::Digital(v)) => {
                    format!("dred/{}/{}", pin.number(), u8::from(*v))
                }
                _ => {
                    return Err(LinkError::ProtocolViolation(format!(
                        "value {:?} does not fit pin {}",
                        value, pin
                    )))
                }
            },
            DeviceMessage::Reply(reply) => {
                let mut body = format!(
                    "rply/{}?id={}",
                    if reply.ok { "ok" } else { "ko" },
                    reply.id
                );
                for (key, value) in &reply.parameters {
                    body.push_str(&format!("&{}={}", key, value));
                }
                body
            }
            DeviceMessage::Ready => "ready/".to_string(),
            DeviceMessage::Custom(payload) => format!("cust/{}", join_payload(payload)?),
        };
        Ok(format!("{}://{}\n", TEXT_SCHEME, body).into_bytes())
    }

    fn decode_command(&self, frame: &[u8]) -> Result<(Command, Option<u64>)> {
        let parsed = ParsedFrame::parse(frame)?;
        let id = match parsed.query.get("id") {
            Some(id) => Some(parse_number::<u64>(frame, id, "id")?),
            None => None,
        };
        let single_pin = |kind: PinKind| -> Result<Pin> {
            Ok(Pin::new(kind, parse_number(frame, parsed.args, "pin")?))
        };

        let command = match parsed.verb {
            "kprs" => Command::KeyPress(parse_key_press(frame, parsed.args)?),
            "ppin" => {
                let (pin, value) = pin_and_value(frame, parsed.args)?;
                Command::SwitchAnalog {
                    pin: Pin::analog(pin),
                    value: parse_number(frame, value, "intensity")?,
                }
            }
            "ppsw" => {
                let (pin, value) = pin_and_value(frame, parsed.args)?;
                Command::SwitchDigital {
                    pin: Pin::digital(pin),
                    value: parse_bit(value)
                        .ok_or_else(|| LinkError::decode(frame, "switch value must be 0 or 1"))?,
                }
            }
            "srld" => Command::StartListening(single_pin(PinKind::Digital)?),
            "spld" => Command::StopListening(single_pin(PinKind::Digital)?),
            "srla" => Command::StartListening(single_pin(PinKind::Analog)?),
            "spla" => Command::StopListening(single_pin(PinKind::Analog)?),
            "notn" => Command::NoTone(single_pin(PinKind::Analog)?),
            "tone" => {
                let parts: Vec<&str> = parsed.args.split('/').collect();
                if parts.len() != 3 {
                    return Err(LinkError::decode(frame, "tone needs pin/hertz/duration"));
                }
                let millis: i64 = parse_number(frame, parts[2], "duration")?;
                Command::Tone(Tone {
                    pin: Pin::analog(parse_number(frame, parts[0], "pin")?),
                    hertz: parse_number(frame, parts[1], "hertz")?,
                    duration: u64::try_from(millis).ok().map(Duration::from_millis),
                })
            }
            "cust" => Command::Custom(split_payload(parsed.args)),
            verb => return Err(LinkError::decode(frame, format!("unknown verb {:?}", verb))),
        };
        Ok((command, id))
    }
}

/// A frame split into verb, args and query parameters
struct ParsedFrame<'a> {
    verb: &'a str,
    args: &'a str,
    query: BTreeMap<String, String>,
}

impl<'a> ParsedFrame<'a> {
    fn parse(frame: &'a [u8]) -> Result<Self> {
        let text = std::str::from_utf8(frame)
            .map_err(|_| LinkError::decode(frame, "frame is not valid UTF-8"))?;
        let text = text.trim_end_matches('\r');
        let rest = text
            .strip_prefix(TEXT_SCHEME)
            .and_then(|rest| rest.strip_prefix("://"))
            .ok_or_else(|| LinkError::decode(frame, format!("expected {}:// scheme", TEXT_SCHEME)))?;

        let (path, query) = match rest.split_once('?') {
            Some((path, query)) => (path, query),
            None => (rest, ""),
        };
        let (verb, args) = path.split_once('/').unwrap_or((path, ""));
        if verb.is_empty() {
            return Err(LinkError::decode(frame, "missing verb"));
        }

        let query = query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| match pair.split_once('=') {
                Some((key, value)) => (key.to_string(), value.to_string()),
                None => (pair.to_string(), String::new()),
            })
            .collect();

        Ok(Self { verb, args, query })
    }
}

fn pin_and_value<'a>(frame: &[u8], args: &'a str) -> Result<(u32, &'a str)> {
    let (pin, value) = args
        .split_once('/')
        .ok_or_else(|| LinkError::decode(frame, "expected <pin>/<value>"))?;
    Ok((parse_number(frame, pin, "pin")?, value))
}

fn parse_number<T: std::str::FromStr>(frame: &[u8], text: &str, what: &str) -> Result<T> {
    text.parse()
        .map_err(|_| LinkError::decode(frame, format!("{} {:?} is not a number", what, text)))
}

fn parse_bit(text: &str) -> Option<bool> {
    match text {
        "1" => Some(true),
        "0" => Some(false),
        _ => None,
    }
}

/// Join custom payload elements with `/`
///
/// An element must not carry the query or frame syntax of the protocol.
fn join_payload(payload: &[String]) -> Result<String> {
    if let Some(element) = payload
        .iter()
        .find(|element| element.contains(['?', '&', '\n', '\r']))
    {
        return Err(LinkError::InvalidValue(format!(
            "custom payload element {:?} contains frame syntax",
            element
        )));
    }
    Ok(payload.join("/"))
}

fn split_payload(args: &str) -> Vec<String> {
    if args.is_empty() {
        Vec::new()
    } else {
        args.split('/').map(str::to_string).collect()
    }
}

/// Parse `chr<c>cod<n>loc<n>mod<n>mex<n>`
fn parse_key_press(frame: &[u8], args: &str) -> Result<KeyPress> {
    let bad = || LinkError::decode(frame, "malformed key press");
    let rest = args.strip_prefix("chr").ok_or_else(bad)?;
    let mut chars = rest.chars();
    let key_char = chars.next().ok_or_else(bad)?;
    let rest = chars.as_str();

    let mut fields = [0i32; 4];
    let mut rest = rest;
    for (i, tag) in ["cod", "loc", "mod", "mex"].iter().enumerate() {
        rest = rest.strip_prefix(tag).ok_or_else(bad)?;
        let end = rest
            .char_indices()
            .skip(1)
            .find(|(_, c)| !c.is_ascii_digit())
            .map(|(pos, _)| pos)
            .unwrap_or(rest.len());
        fields[i] = rest[..end].parse().map_err(|_| bad())?;
        rest = &rest[end..];
    }
    if !rest.is_empty() {
        return Err(bad());
    }

    Ok(KeyPress {
        key_char,
        key_code: fields[0],
        key_location: fields[1],
        modifiers: fields[2],
        modifiers_ex: fields[3],
    })
}
