//! Connection over tokio byte streams
//!
//! Wraps a reader and a writer half. A dedicated task scans the reader into
//! frames and hands each one to the registered listeners, in order.

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{Connection, ConnectionListener, ListenerSet};
use crate::error::{LinkError, Result};
use crate::scanner::{FrameScanner, Framing};

/// A [`Connection`] backed by an async reader/writer pair
///
/// The reader task starts on construction, so a tokio runtime must be
/// running. When the reader ends without `close()` having been called,
/// listeners are told the connection was lost.
pub struct StreamConnection<W> {
    name: String,
    writer: Mutex<Option<W>>,
    listeners: Arc<ListenerSet>,
    reader_task: SyncMutex<Option<JoinHandle<()>>>,
    closed: Arc<AtomicBool>,
}

impl<W: AsyncWrite + Unpin + Send> StreamConnection<W> {
    /// Create a connection from separate halves
    pub fn new<R>(name: impl Into<String>, reader: R, writer: W, framing: Framing) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let name = name.into();
        let listeners = Arc::new(ListenerSet::new());
        let closed = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(read_loop(
            name.clone(),
            FrameScanner::new(reader, framing),
            listeners.clone(),
            closed.clone(),
        ));

        Self {
            name,
            writer: Mutex::new(Some(writer)),
            listeners,
            reader_task: SyncMutex::new(Some(task)),
            closed,
        }
    }

    /// Check whether `close()` was called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl<S> StreamConnection<WriteHalf<S>>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Create a connection from a duplex stream such as a `TcpStream`
    pub fn from_stream(name: impl Into<String>, stream: S, framing: Framing) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(name, reader, writer, framing)
    }
}

async fn read_loop<R: AsyncRead + Unpin>(
    name: String,
    mut scanner: FrameScanner<R>,
    listeners: Arc<ListenerSet>,
    closed: Arc<AtomicBool>,
) {
    debug!(connection = %name, "Reader task started");
    while let Some(frame) = scanner.next_frame().await {
        listeners.notify_received(&frame);
    }
    if !closed.load(Ordering::SeqCst) {
        match scanner.take_failure() {
            Some(e) => warn!(connection = %name, error = %e, code = e.error_code(), "Connection lost"),
            None => info!(connection = %name, "Connection lost"),
        }
        listeners.notify_lost();
    }
    debug!(connection = %name, "Reader task stopped");
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> Connection for StreamConnection<W> {
    async fn write(&self, bytes: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(LinkError::Disconnected);
        }
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(LinkError::Disconnected)?;

        writer.write_all(bytes).await.map_err(|e| {
            error!(connection = %self.name, error = %e, "Write error");
            LinkError::WriteError(e.to_string())
        })?;
        writer
            .flush()
            .await
            .map_err(|e| LinkError::WriteError(format!("Flush failed: {}", e)))?;
        drop(guard);

        self.listeners.notify_sent(bytes);
        Ok(())
    }

    fn add_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.listeners.add(listener);
    }

    fn remove_listener(&self, listener: &Arc<dyn ConnectionListener>) {
        self.listeners.remove(listener);
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(task) = self.reader_task.lock().take() {
            task.abort();
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!(connection = %self.name, error = %e, "Shutdown failed");
            }
        }
        info!(connection = %self.name, "Connection closed");
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl<W> std::fmt::Debug for StreamConnection<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConnection")
            .field("name", &self.name)
            .field("listeners", &self.listeners)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl<W> Drop for StreamConnection<W> {
    fn drop(&mut self) {
        if let Some(task) = self.reader_task.get_mut().take() {
            task.abort();
        }
    }
}
