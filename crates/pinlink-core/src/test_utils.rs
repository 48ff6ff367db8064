//! Test utilities for links without hardware
//!
//! This module provides an in-memory [`Connection`] that records everything
//! written to it and lets tests play the device side, plus a
//! [`DeviceSimulator`] that answers commands the way firmware would.
//!
//! # Example
//!
//! ```rust,ignore
//! use pinlink_core::test_utils::{DeviceSimulator, MockConnection};
//!
//! let connection = Arc::new(MockConnection::new());
//! connection.set_responder(DeviceSimulator::text());
//! let link = Link::new(connection.clone(), protocol)?;
//!
//! connection.inject(b"alp://dred/3/1");
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::connection::{Connection, ConnectionListener, ListenerSet};
use crate::error::{LinkError, Result};
use crate::protocol::{strip_delimiter, DeviceMessage, Protocol, Reply, TextProtocol};

/// Produces device frames in answer to a written host frame
pub type Responder = Arc<dyn Fn(&[u8]) -> Vec<Vec<u8>> + Send + Sync>;

/// In-memory connection for tests
#[derive(Default)]
pub struct MockConnection {
    listeners: ListenerSet,
    written: Mutex<Vec<Vec<u8>>>,
    fail_writes: AtomicBool,
    closed: AtomicBool,
    close_calls: AtomicUsize,
    responder: Mutex<Option<Responder>>,
}

impl MockConnection {
    /// Create a new mock connection
    pub fn new() -> Self {
        Self::default()
    }

    /// Play the device: deliver a frame (without delimiter) to the listeners
    pub fn inject(&self, frame: &[u8]) {
        self.listeners.notify_received(frame);
    }

    /// Simulate the transport going away
    pub fn simulate_lost(&self) {
        self.listeners.notify_lost();
    }

    /// Simulate the transport coming back
    pub fn simulate_reconnected(&self) {
        self.listeners.notify_reconnected();
    }

    /// Make every following write fail (or succeed again)
    pub fn fail_writes(&self, enabled: bool) {
        self.fail_writes.store(enabled, Ordering::SeqCst);
    }

    /// Answer written frames with the frames the responder returns
    pub fn set_responder(&self, responder: Responder) {
        *self.responder.lock() = Some(responder);
    }

    /// Frames written so far
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().clone()
    }

    /// Frames written so far, as text
    pub fn written_text(&self) -> Vec<String> {
        self.written
            .lock()
            .iter()
            .map(|frame| String::from_utf8_lossy(frame).into_owned())
            .collect()
    }

    /// Count written frames containing `needle`
    pub fn count_written(&self, needle: &str) -> usize {
        self.written_text()
            .iter()
            .filter(|frame| frame.contains(needle))
            .count()
    }

    /// Forget the recorded writes
    pub fn clear_written(&self) {
        self.written.lock().clear();
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Check whether `close()` was called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// How many times `close()` was called
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn write(&self, bytes: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(LinkError::Disconnected);
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(LinkError::WriteError("simulated write failure".to_string()));
        }
        self.written.lock().push(bytes.to_vec());
        self.listeners.notify_sent(bytes);

        let responder = self.responder.lock().clone();
        if let Some(responder) = responder {
            for frame in responder(bytes) {
                self.inject(&frame);
            }
        }
        Ok(())
    }

    fn add_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.listeners.add(listener);
    }

    fn remove_listener(&self, listener: &Arc<dyn ConnectionListener>) {
        self.listeners.remove(listener);
    }

    async fn close(&self) -> Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &str {
        "MockConnection"
    }
}

/// Answers host commands the way firmware would
pub struct DeviceSimulator {
    protocol: Arc<dyn Protocol>,
    reply_ok: bool,
}

impl DeviceSimulator {
    /// Simulator speaking `protocol`
    pub fn new(protocol: Arc<dyn Protocol>) -> Self {
        Self {
            protocol,
            reply_ok: true,
        }
    }

    /// Simulator speaking the text protocol, replying `ok`
    pub fn text() -> Responder {
        Self::new(Arc::new(TextProtocol::new())).into_responder()
    }

    /// Reply `ko` instead of `ok`
    pub fn rejecting(mut self) -> Self {
        self.reply_ok = false;
        self
    }

    /// Frames the device sends back for one host frame
    ///
    /// Commands carrying an id get a reply; everything else is silent.
    pub fn respond(&self, bytes: &[u8]) -> Vec<Vec<u8>> {
        let frame = strip_delimiter(&self.protocol.framing(), bytes);
        match self.protocol.decode_command(frame) {
            Ok((command, Some(id))) => {
                debug!(id, command = %command, "Simulated device replying");
                let reply = DeviceMessage::Reply(Reply::new(id, self.reply_ok));
                match self.protocol.encode_message(&reply) {
                    Ok(bytes) => vec![strip_delimiter(&self.protocol.framing(), &bytes).to_vec()],
                    Err(_) => Vec::new(),
                }
            }
            _ => Vec::new(),
        }
    }

    /// Wrap into a [`Responder`] for [`MockConnection::set_responder`]
    pub fn into_responder(self) -> Responder {
        Arc::new(move |bytes| self.respond(bytes))
    }
}
