//! Byte channels between host and device
//!
//! A [`Connection`] is a duplex byte channel with listener callbacks for
//! received frames and sent bytes. Physical transports live outside this
//! crate; [`StreamConnection`] adapts any tokio `AsyncRead`/`AsyncWrite`
//! pair (a TCP socket, a serial stream) into a connection.
//!
//! # Feature Requirements
//!
//! - `serial`: [`open_serial`] opens a stream connection on a serial port.
//!   Requires `libudev-dev` and `pkg-config` on Linux
//!   ```bash
//!   apt install libudev-dev pkg-config
//!   ```

mod stream;

#[cfg(feature = "serial")]
mod serial;

pub use stream::StreamConnection;

#[cfg(feature = "serial")]
pub use serial::open_serial;

use crate::error::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{trace, warn};

/// Callbacks for traffic on a connection
///
/// Callbacks run on the connection's reader task (for `received` and
/// `connection_lost`) or on the writing task (for `sent`). They must not
/// block.
pub trait ConnectionListener: Send + Sync {
    /// A frame arrived from the device (delimiter stripped)
    fn received(&self, frame: &[u8]);

    /// Bytes were handed to the transport
    fn sent(&self, _bytes: &[u8]) {}

    /// The transport stopped delivering data
    fn connection_lost(&self) {}

    /// The transport delivers data again
    fn reconnected(&self) {}
}

/// Trait for host-device byte channels
///
/// This trait abstracts over different transports (serial, TCP proxy,
/// Bluetooth) providing a unified API for writing bytes and observing
/// inbound frames.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Write bytes to the device
    async fn write(&self, bytes: &[u8]) -> Result<()>;

    /// Register a listener for received frames and sent bytes
    fn add_listener(&self, listener: Arc<dyn ConnectionListener>);

    /// Deregister a listener previously added
    fn remove_listener(&self, listener: &Arc<dyn ConnectionListener>);

    /// Close the channel; further writes fail
    async fn close(&self) -> Result<()>;

    /// Get the connection name (for logging)
    fn name(&self) -> &str;
}

/// Connection state as observed by listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport delivers data
    Connected,
    /// Transport stopped delivering data
    Lost,
    /// Closed on request
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Lost => write!(f, "lost"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Ordered listener list shared by connection implementations
///
/// Every notification runs on a snapshot of the list, so listeners may add or
/// remove listeners from inside a callback.
#[derive(Default)]
pub struct ListenerSet {
    listeners: RwLock<Vec<Arc<dyn ConnectionListener>>>,
}

impl ListenerSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a listener
    pub fn add(&self, listener: Arc<dyn ConnectionListener>) {
        self.listeners.write().push(listener);
    }

    /// Remove a listener by identity
    pub fn remove(&self, listener: &Arc<dyn ConnectionListener>) {
        self.listeners
            .write()
            .retain(|existing| !Arc::ptr_eq(existing, listener));
    }

    /// Remove every listener
    pub fn clear(&self) {
        self.listeners.write().clear();
    }

    /// Number of registered listeners
    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// Check if no listener is registered
    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    fn snapshot(&self) -> Vec<Arc<dyn ConnectionListener>> {
        self.listeners.read().clone()
    }

    /// Deliver a received frame to every listener
    pub fn notify_received(&self, frame: &[u8]) {
        trace!(size = frame.len(), "Delivering received frame");
        for listener in self.snapshot() {
            isolate("received", || listener.received(frame));
        }
    }

    /// Report written bytes to every listener
    pub fn notify_sent(&self, bytes: &[u8]) {
        for listener in self.snapshot() {
            isolate("sent", || listener.sent(bytes));
        }
    }

    /// Report a lost transport to every listener
    pub fn notify_lost(&self) {
        for listener in self.snapshot() {
            isolate("connection_lost", || listener.connection_lost());
        }
    }

    /// Report a restored transport to every listener
    pub fn notify_reconnected(&self) {
        for listener in self.snapshot() {
            isolate("reconnected", || listener.reconnected());
        }
    }
}

/// Run one listener callback, containing a panic to that listener
fn isolate(callback: &str, f: impl FnOnce()) {
    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)).is_err() {
        warn!(callback, "Connection listener panicked");
    }
}

impl std::fmt::Debug for ListenerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerSet")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        frames: Mutex<Vec<Vec<u8>>>,
    }

    impl ConnectionListener for Recorder {
        fn received(&self, frame: &[u8]) {
            self.frames.lock().push(frame.to_vec());
        }
    }

    struct Panicking;

    impl ConnectionListener for Panicking {
        fn received(&self, _frame: &[u8]) {
            panic!("listener failure");
        }
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(ConnectionState::Lost.to_string(), "lost");
    }

    #[test]
    fn test_panicking_listener_does_not_stop_others() {
        let set = ListenerSet::new();
        let recorder = Arc::new(Recorder::default());
        set.add(Arc::new(Panicking));
        set.add(recorder.clone());

        set.notify_received(b"alp://ready/");
        assert_eq!(recorder.frames.lock().len(), 1);
    }

    #[test]
    fn test_remove_by_identity() {
        let set = ListenerSet::new();
        let first: Arc<dyn ConnectionListener> = Arc::new(Recorder::default());
        let second: Arc<dyn ConnectionListener> = Arc::new(Recorder::default());
        set.add(first.clone());
        set.add(second.clone());

        set.remove(&first);
        assert_eq!(set.len(), 1);
        set.remove(&first);
        assert_eq!(set.len(), 1);
        set.remove(&second);
        assert!(set.is_empty());
    }
}
