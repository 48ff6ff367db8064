//! Pinlink Core - Host side of a microcontroller link
//!
//! This crate talks to a microcontroller-class device over a byte
//! transport: it frames the inbound stream, encodes and decodes a pluggable
//! wire protocol, correlates commands with replies and keeps the device
//! listening on the pins somebody cares about.
//!
//! # Modules
//!
//! - [`pin`] - Pin identity and values
//! - [`scanner`] - Splitting byte streams into frames
//! - [`protocol`] - Wire protocols and the protocol registry
//! - [`connection`] - Byte channels and the stream-backed connection
//! - [`correlator`] - Command/reply correlation
//! - [`link`] - Command and listener API over one connection
//! - [`config`] - Configuration types
//! - [`error`] - Error types
//! - [`test_utils`] - In-memory connection and device simulator
//!
//! # Example
//!
//! ```rust,ignore
//! use pinlink_core::{Link, LinkConfig, Pin, StreamConnection, Framing};
//!
//! let stream = tokio::net::TcpStream::connect("127.0.0.1:4478").await?;
//! let connection = Arc::new(StreamConnection::from_stream("tcp", stream, Framing::newline()));
//! let link = Link::from_config(connection, LinkConfig::default())?;
//!
//! link.wait_until_ready().await;
//! link.add_event_listener(Some(Pin::digital(2)), |event| {
//!     println!("{} is now {}", event.pin, event.value);
//!     Ok(())
//! }).await?;
//! link.switch_digital_pin(Pin::digital(13), true).await?;
//! ```
//!
//! # Features
//!
//! - `serial` - open connections on serial ports (requires `libudev-dev` on Linux)

#![warn(missing_docs)]

pub mod config;
pub mod connection;
pub mod correlator;
pub mod error;
pub mod link;
pub mod pin;
pub mod protocol;
pub mod scanner;
pub mod test_utils;

pub use config::{LinkConfig, ReadyMode};
pub use connection::{Connection, ConnectionListener, ConnectionState, StreamConnection};
pub use error::{LinkError, Result};
pub use link::{Link, ListenerId};
pub use pin::{Pin, PinEvent, PinKind, PinValue};
pub use protocol::{
    BinaryProtocol, Command, DeviceMessage, KeyPress, Protocol, ProtocolRegistry, Reply,
    TextProtocol, Tone,
};
pub use scanner::{FrameScanner, Framing};

#[cfg(feature = "serial")]
pub use connection::open_serial;

/// Version of the pinlink-core crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
