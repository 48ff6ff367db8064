//! Serial port connections
//!
//! Opens a serial port with tokio-serial and wraps it in a
//! [`StreamConnection`]. Opening the port usually resets the board, so
//! callers should wait for the firmware with `Link::wait_for_ready`.

use std::path::Path;
use tokio::io::WriteHalf;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::info;

use super::StreamConnection;
use crate::error::{LinkError, Result};
use crate::scanner::Framing;

/// Open `port` at `baud_rate` and start scanning it with `framing`
pub fn open_serial(
    port: impl AsRef<Path>,
    baud_rate: u32,
    framing: Framing,
) -> Result<StreamConnection<WriteHalf<SerialStream>>> {
    let port = port.as_ref();
    if !port.exists() {
        return Err(LinkError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("serial port not found: {}", port.display()),
        )));
    }

    info!(port = %port.display(), baud = baud_rate, "Opening serial port");
    let stream = tokio_serial::new(port.to_string_lossy(), baud_rate).open_native_async()?;

    Ok(StreamConnection::from_stream(
        format!("serial:{}", port.display()),
        stream,
        framing,
    ))
}
