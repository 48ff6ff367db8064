//! Command/reply correlation
//!
//! Commands that expect a reply are tagged with an id. The correlator
//! allocates ids, remembers the callback for each outstanding id and hands
//! the matching reply to it exactly once.
//!
//! # Ordering
//!
//! Allocating an id, registering its callback and writing the frame happen
//! under one async lock, so ids reach the transport in allocation order and
//! a reply can never arrive for an id that is not registered yet. The
//! pending map has its own short synchronous lock; the reader task takes it
//! on every reply without waiting for a write in progress. Callbacks run
//! after that lock is released.

use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, trace};

use crate::connection::Connection;
use crate::error::Result;
use crate::protocol::{Command, Protocol, Reply};

/// Callback invoked with the reply to a command
pub type ReplyCallback = Box<dyn FnOnce(&Reply) + Send>;

/// Tracks commands awaiting a reply
pub struct MessageCorrelator {
    protocol: Arc<dyn Protocol>,
    /// Last allocated id; held across the write
    last_id: Mutex<u64>,
    pending: SyncMutex<HashMap<u64, ReplyCallback>>,
}

impl MessageCorrelator {
    /// Create a correlator encoding with `protocol`
    pub fn new(protocol: Arc<dyn Protocol>) -> Self {
        Self {
            protocol,
            last_id: Mutex::new(0),
            pending: SyncMutex::new(HashMap::new()),
        }
    }

    /// Encode and write a command that expects no reply
    pub async fn send(&self, connection: &dyn Connection, command: &Command) -> Result<()> {
        let bytes = self.protocol.encode(command, None)?;
        connection.write(&bytes).await?;
        trace!(command = %command, "Sent command");
        Ok(())
    }

    /// Encode and write a command tagged with a fresh id
    ///
    /// Returns the id. If encoding or writing fails the id is forgotten and
    /// the callback dropped without being called.
    pub async fn send_with_reply(
        &self,
        connection: &dyn Connection,
        command: &Command,
        callback: ReplyCallback,
    ) -> Result<u64> {
        let mut last_id = self.last_id.lock().await;
        *last_id += 1;
        let id = *last_id;
        self.pending.lock().insert(id, callback);

        let written = match self.protocol.encode(command, Some(id)) {
            Ok(bytes) => connection.write(&bytes).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            self.pending.lock().remove(&id);
            debug!(id, command = %command, error = %e, "Send failed, dropping pending reply");
            return Err(e);
        }

        trace!(id, command = %command, "Sent command awaiting reply");
        Ok(id)
    }

    /// Hand a reply to its pending callback
    ///
    /// Returns `false` when no command is waiting for this id; such replies
    /// are routine (late replies after close) and are dropped quietly. A
    /// panicking callback is logged and counts as delivered.
    pub fn on_reply(&self, reply: &Reply) -> bool {
        let callback = self.pending.lock().remove(&reply.id);
        match callback {
            Some(callback) => {
                let delivered =
                    std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(reply)));
                if delivered.is_err() {
                    error!(id = reply.id, "Reply callback panicked");
                }
                true
            }
            None => {
                trace!(id = reply.id, "Reply for unknown id");
                false
            }
        }
    }

    /// Forget every pending command without calling its callback
    pub fn abandon_all(&self) -> usize {
        let abandoned: Vec<_> = self.pending.lock().drain().collect();
        if !abandoned.is_empty() {
            debug!(count = abandoned.len(), "Abandoning pending replies");
        }
        abandoned.len()
    }

    /// Number of commands awaiting a reply
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

impl std::fmt::Debug for MessageCorrelator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageCorrelator")
            .field("protocol", &self.protocol.name())
            .field("pending", &self.pending_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pin::Pin;
    use crate::protocol::{BinaryProtocol, TextProtocol};
    use crate::test_utils::MockConnection;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_callback(counter: &Arc<AtomicUsize>) -> ReplyCallback {
        let counter = counter.clone();
        Box::new(move |_reply| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn test_ids_are_monotonic() {
        let correlator = MessageCorrelator::new(Arc::new(TextProtocol::new()));
        let connection = MockConnection::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let mut ids = Vec::new();
        for pin in 0..5 {
            let id = correlator
                .send_with_reply(
                    &connection,
                    &Command::StartListening(Pin::analog(pin)),
                    counting_callback(&counter),
                )
                .await
                .unwrap();
            ids.push(id);
        }
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert_eq!(correlator.pending_count(), 5);
        assert_eq!(connection.written_text()[0], "alp://srla/0?id=1\n");
    }

    #[tokio::test]
    async fn test_reply_invokes_callback_once() {
        let correlator = MessageCorrelator::new(Arc::new(TextProtocol::new()));
        let connection = MockConnection::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let id = correlator
            .send_with_reply(
                &connection,
                &Command::NoTone(Pin::analog(0)),
                counting_callback(&counter),
            )
            .await
            .unwrap();

        assert!(correlator.on_reply(&Reply::new(id, true)));
        assert!(!correlator.on_reply(&Reply::new(id, true)));
        assert!(!correlator.on_reply(&Reply::new(999, true)));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_panicking_callback_is_contained() {
        let correlator = MessageCorrelator::new(Arc::new(TextProtocol::new()));
        let connection = MockConnection::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let first = correlator
            .send_with_reply(
                &connection,
                &Command::NoTone(Pin::analog(0)),
                Box::new(|_| panic!("callback bug")),
            )
            .await
            .unwrap();
        let second = correlator
            .send_with_reply(
                &connection,
                &Command::NoTone(Pin::analog(1)),
                counting_callback(&counter),
            )
            .await
            .unwrap();

        assert!(correlator.on_reply(&Reply::new(first, true)));
        assert!(!correlator.on_reply(&Reply::new(first, true)));
        assert!(correlator.on_reply(&Reply::new(second, true)));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_write_discards_pending() {
        let correlator = MessageCorrelator::new(Arc::new(TextProtocol::new()));
        let connection = MockConnection::new();
        connection.fail_writes(true);
        let counter = Arc::new(AtomicUsize::new(0));

        let result = correlator
            .send_with_reply(
                &connection,
                &Command::NoTone(Pin::analog(0)),
                counting_callback(&counter),
            )
            .await;
        assert!(result.is_err());
        assert_eq!(correlator.pending_count(), 0);
        assert!(!correlator.on_reply(&Reply::new(1, true)));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_encode_discards_pending() {
        let correlator = MessageCorrelator::new(Arc::new(BinaryProtocol::new()));
        let connection = MockConnection::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let result = correlator
            .send_with_reply(
                &connection,
                &Command::SwitchDigital {
                    pin: Pin::digital(1),
                    value: true,
                },
                counting_callback(&counter),
            )
            .await;
        assert!(result.is_err());
        assert_eq!(correlator.pending_count(), 0);
        assert!(connection.written().is_empty());
    }

    #[tokio::test]
    async fn test_send_without_reply_has_no_id() {
        let correlator = MessageCorrelator::new(Arc::new(TextProtocol::new()));
        let connection = MockConnection::new();

        correlator
            .send(&connection, &Command::NoTone(Pin::analog(0)))
            .await
            .unwrap();
        assert_eq!(connection.written_text(), vec!["alp://notn/0\n"]);
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_abandon_all_skips_callbacks() {
        let correlator = MessageCorrelator::new(Arc::new(TextProtocol::new()));
        let connection = MockConnection::new();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            correlator
                .send_with_reply(
                    &connection,
                    &Command::Custom(vec!["ping".to_string()]),
                    counting_callback(&counter),
                )
                .await
                .unwrap();
        }
        assert_eq!(correlator.abandon_all(), 3);
        assert!(!correlator.on_reply(&Reply::new(2, true)));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
