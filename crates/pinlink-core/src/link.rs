//! The device link
//!
//! A [`Link`] binds one [`Connection`] to one [`Protocol`]. It offers the
//! command API, dispatches decoded device messages to registered listeners
//! and keeps the device listening on exactly the pins somebody listens to.
//!
//! # Listening
//!
//! Pin-filtered event listeners are reference counted per pin. The first
//! listener for a pin sends start-listening, the last one removed sends
//! stop-listening. The count is updated under an async lock held across the
//! write, so concurrent add/remove calls for one pin neither duplicate nor
//! miss a command.
//!
//! # Dispatch
//!
//! Inbound frames are decoded and dispatched on the connection's reader
//! task, in arrival order. Listener callbacks are synchronous; an `Err` or a
//! panic from one listener is logged and the others still run. Listeners
//! that want to send commands should spawn a task.

use parking_lot::{Mutex as SyncMutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::config::{LinkConfig, ReadyMode};
use crate::connection::{Connection, ConnectionListener, ConnectionState};
use crate::correlator::MessageCorrelator;
use crate::error::{LinkError, Result};
use crate::pin::{Pin, PinEvent};
use crate::protocol::{Command, DeviceMessage, KeyPress, Protocol, ProtocolRegistry, Reply, Tone};

/// Receives pin state changes
pub type EventListener = Arc<dyn Fn(&PinEvent) -> anyhow::Result<()> + Send + Sync>;

/// Receives every device reply
pub type ReplyListener = Arc<dyn Fn(&Reply) -> anyhow::Result<()> + Send + Sync>;

/// Receives custom device messages
pub type CustomListener = Arc<dyn Fn(&[String]) -> anyhow::Result<()> + Send + Sync>;

/// Receives connection state changes
pub type ConnectionStateListener =
    Arc<dyn Fn(ConnectionState) -> anyhow::Result<()> + Send + Sync>;

/// Identifies a listener registration on a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

struct EventRegistration {
    id: ListenerId,
    filter: Option<Pin>,
    listener: EventListener,
}

/// What a removed registration was
enum Removed {
    Event(Option<Pin>),
    Other,
}

#[derive(Default)]
struct Listeners {
    events: RwLock<Vec<EventRegistration>>,
    replies: RwLock<Vec<(ListenerId, ReplyListener)>>,
    customs: RwLock<Vec<(ListenerId, CustomListener)>>,
    states: RwLock<Vec<(ListenerId, ConnectionStateListener)>>,
}

impl Listeners {
    fn remove(&self, id: ListenerId) -> Option<Removed> {
        {
            let mut events = self.events.write();
            if let Some(index) = events.iter().position(|r| r.id == id) {
                return Some(Removed::Event(events.remove(index).filter));
            }
        }
        let removed = remove_by_id(&self.replies, id)
            || remove_by_id(&self.customs, id)
            || remove_by_id(&self.states, id);
        removed.then_some(Removed::Other)
    }

    fn clear(&self) {
        self.events.write().clear();
        self.replies.write().clear();
        self.customs.write().clear();
        self.states.write().clear();
    }

    fn len(&self) -> usize {
        self.events.read().len()
            + self.replies.read().len()
            + self.customs.read().len()
            + self.states.read().len()
    }
}

fn remove_by_id<T>(list: &RwLock<Vec<(ListenerId, T)>>, id: ListenerId) -> bool {
    let mut list = list.write();
    let before = list.len();
    list.retain(|(existing, _)| *existing != id);
    list.len() != before
}

/// Run one listener callback, containing errors and panics to that listener
fn isolate(kind: &'static str, id: ListenerId, f: impl FnOnce() -> anyhow::Result<()>) {
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(kind, listener = %id, error = %e, "Listener failed"),
        Err(_) => error!(kind, listener = %id, "Listener panicked"),
    }
}

struct ReadyWaiter {
    id: u64,
    mode: ReadyMode,
    signal: Arc<Notify>,
}

/// Dispatch side of a link, registered on the connection
struct LinkInner {
    protocol: Arc<dyn Protocol>,
    correlator: MessageCorrelator,
    listeners: Listeners,
    waiters: SyncMutex<Vec<ReadyWaiter>>,
    next_waiter: AtomicU64,
}

impl LinkInner {
    fn signal_waiters(&self, ready: bool) {
        for waiter in self.waiters.lock().iter() {
            if ready || waiter.mode == ReadyMode::AnyMessage {
                waiter.signal.notify_one();
            }
        }
    }

    fn add_waiter(&self, mode: ReadyMode) -> (u64, Arc<Notify>) {
        let id = self.next_waiter.fetch_add(1, Ordering::Relaxed);
        let signal = Arc::new(Notify::new());
        self.waiters.lock().push(ReadyWaiter {
            id,
            mode,
            signal: signal.clone(),
        });
        (id, signal)
    }

    fn remove_waiter(&self, id: u64) {
        self.waiters.lock().retain(|waiter| waiter.id != id);
    }

    fn dispatch(&self, message: DeviceMessage) {
        match message {
            DeviceMessage::PinStateChanged { pin, value } => {
                if value.kind() != pin.kind() {
                    error!(
                        pin = %pin,
                        value = %value,
                        "Protocol violation: value does not match pin kind, dropping"
                    );
                    return;
                }
                let event = PinEvent { pin, value };
                let listeners: Vec<_> = self
                    .listeners
                    .events
                    .read()
                    .iter()
                    .filter(|r| r.filter.map_or(true, |filter| filter == pin))
                    .map(|r| (r.id, r.listener.clone()))
                    .collect();
                trace!(pin = %pin, value = %value, listeners = listeners.len(), "Pin state changed");
                for (id, listener) in listeners {
                    isolate("event", id, || listener(&event));
                }
            }
            DeviceMessage::Reply(reply) => {
                self.correlator.on_reply(&reply);
                let listeners = self.listeners.replies.read().clone();
                for (id, listener) in listeners {
                    isolate("reply", id, || listener(&reply));
                }
            }
            DeviceMessage::Ready => {
                debug!(protocol = self.protocol.name(), "Device ready");
                self.signal_waiters(true);
            }
            DeviceMessage::Custom(payload) => {
                let listeners = self.listeners.customs.read().clone();
                for (id, listener) in listeners {
                    isolate("custom", id, || listener(&payload));
                }
            }
        }
    }

    fn notify_state(&self, state: ConnectionState) {
        let listeners = self.listeners.states.read().clone();
        for (id, listener) in listeners {
            isolate("connection", id, || listener(state));
        }
    }
}

impl ConnectionListener for LinkInner {
    fn received(&self, frame: &[u8]) {
        self.signal_waiters(false);
        match self.protocol.decode(frame) {
            Ok(message) => self.dispatch(message),
            Err(e) => warn!(protocol = self.protocol.name(), error = %e, "Dropping undecodable frame"),
        }
    }

    fn connection_lost(&self) {
        warn!("Connection lost");
        self.notify_state(ConnectionState::Lost);
    }

    fn reconnected(&self) {
        info!("Connection restored");
        self.notify_state(ConnectionState::Connected);
    }
}

/// Command and listener API over one connection and one protocol
pub struct Link {
    connection: Arc<dyn Connection>,
    inner: Arc<LinkInner>,
    registration: Arc<dyn ConnectionListener>,
    /// Filtered listeners per pin; held across start/stop writes
    listening: Mutex<HashMap<Pin, usize>>,
    next_listener: AtomicU64,
    closed: AtomicBool,
    config: LinkConfig,
}

impl Link {
    /// Create a link speaking `protocol` over `connection`
    pub fn new(connection: Arc<dyn Connection>, protocol: Arc<dyn Protocol>) -> Self {
        let config = LinkConfig::with_protocol(protocol.name());
        Self::build(connection, protocol, config)
    }

    /// Create a link, resolving the protocol in the global registry
    pub fn from_config(connection: Arc<dyn Connection>, config: LinkConfig) -> Result<Self> {
        let protocol = ProtocolRegistry::global().get(&config.protocol)?;
        Ok(Self::build(connection, protocol, config))
    }

    fn build(
        connection: Arc<dyn Connection>,
        protocol: Arc<dyn Protocol>,
        config: LinkConfig,
    ) -> Self {
        let inner = Arc::new(LinkInner {
            correlator: MessageCorrelator::new(protocol.clone()),
            protocol,
            listeners: Listeners::default(),
            waiters: SyncMutex::new(Vec::new()),
            next_waiter: AtomicU64::new(0),
        });
        let registration: Arc<dyn ConnectionListener> = inner.clone();
        connection.add_listener(registration.clone());

        info!(
            connection = connection.name(),
            protocol = inner.protocol.name(),
            "Link opened"
        );

        Self {
            connection,
            inner,
            registration,
            listening: Mutex::new(HashMap::new()),
            next_listener: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            config,
        }
    }

    /// The protocol this link speaks
    pub fn protocol(&self) -> &Arc<dyn Protocol> {
        &self.inner.protocol
    }

    /// The link configuration
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Check whether `close()` was called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(LinkError::Closed)
        } else {
            Ok(())
        }
    }

    fn next_listener_id(&self) -> ListenerId {
        ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed))
    }

    // ===== Commands =====

    /// Send a command that expects no reply
    pub async fn send(&self, command: Command) -> Result<()> {
        self.ensure_open()?;
        self.inner
            .correlator
            .send(self.connection.as_ref(), &command)
            .await
    }

    /// Send a command and call `callback` with its reply
    ///
    /// Returns the correlation id. The callback runs at most once, never if
    /// the send fails or the link is closed first.
    pub async fn send_with_reply<F>(&self, command: Command, callback: F) -> Result<u64>
    where
        F: FnOnce(&Reply) + Send + 'static,
    {
        self.ensure_open()?;
        self.inner
            .correlator
            .send_with_reply(self.connection.as_ref(), &command, Box::new(callback))
            .await
    }

    /// Send a command and receive its reply on a channel
    ///
    /// The receiver errors if the link is closed before the reply arrives.
    pub async fn request(&self, command: Command) -> Result<oneshot::Receiver<Reply>> {
        let (tx, rx) = oneshot::channel();
        self.send_with_reply(command, move |reply| {
            let _ = tx.send(reply.clone());
        })
        .await?;
        Ok(rx)
    }

    /// Set the intensity of an analog (PWM) pin
    pub async fn switch_analog_pin(&self, pin: Pin, value: u32) -> Result<()> {
        self.send(Command::SwitchAnalog { pin, value }).await
    }

    /// Switch a digital pin high or low
    pub async fn switch_digital_pin(&self, pin: Pin, value: bool) -> Result<()> {
        self.send(Command::SwitchDigital { pin, value }).await
    }

    /// Ask the device to report changes of `pin`
    ///
    /// This bypasses listener reference counting.
    pub async fn start_listening(&self, pin: Pin) -> Result<()> {
        self.send(Command::StartListening(pin)).await
    }

    /// Ask the device to stop reporting `pin`
    pub async fn stop_listening(&self, pin: Pin) -> Result<()> {
        self.send(Command::StopListening(pin)).await
    }

    /// Play a tone
    pub async fn send_tone(&self, tone: Tone) -> Result<()> {
        self.send(Command::Tone(tone)).await
    }

    /// Stop a tone on `pin`
    pub async fn send_no_tone(&self, pin: Pin) -> Result<()> {
        self.send(Command::NoTone(pin)).await
    }

    /// Forward a key press
    pub async fn send_key_press(&self, key_press: KeyPress) -> Result<()> {
        self.send(Command::KeyPress(key_press)).await
    }

    /// Send an opaque application message
    pub async fn send_custom_message<I, S>(&self, payload: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let payload = payload.into_iter().map(Into::into).collect();
        self.send(Command::Custom(payload)).await
    }

    // ===== Listeners =====

    /// Register a pin event listener
    ///
    /// With a filter, only events for that pin are delivered and the device
    /// is told to start listening if this is the first listener for it. If
    /// that command fails the listener is not registered.
    pub async fn add_event_listener<F>(&self, filter: Option<Pin>, listener: F) -> Result<ListenerId>
    where
        F: Fn(&PinEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.ensure_open()?;
        let id = self.next_listener_id();
        let registration = EventRegistration {
            id,
            filter,
            listener: Arc::new(listener),
        };

        let Some(pin) = filter else {
            self.inner.listeners.events.write().push(registration);
            debug!(listener = %id, "Added event listener");
            return Ok(id);
        };

        let mut listening = self.listening.lock().await;
        // close() may have drained the counts while we waited
        self.ensure_open()?;
        let count = listening.get(&pin).copied().unwrap_or(0);
        if count == 0 {
            let started = self
                .inner
                .correlator
                .send(self.connection.as_ref(), &Command::StartListening(pin))
                .await;
            if let Err(e) = started {
                warn!(pin = %pin, error = %e, "Start listening failed");
                return Err(e);
            }
            info!(pin = %pin, "Started listening");
        }
        self.inner.listeners.events.write().push(registration);
        listening.insert(pin, count + 1);
        debug!(listener = %id, pin = %pin, count = count + 1, "Added event listener");
        Ok(id)
    }

    /// Register a listener for every device reply
    pub fn add_reply_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Reply) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.next_listener_id();
        self.inner.listeners.replies.write().push((id, Arc::new(listener)));
        id
    }

    /// Register a listener for custom device messages
    pub fn add_custom_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&[String]) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.next_listener_id();
        self.inner.listeners.customs.write().push((id, Arc::new(listener)));
        id
    }

    /// Register a listener for connection state changes
    pub fn add_connection_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(ConnectionState) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.next_listener_id();
        self.inner.listeners.states.write().push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener
    ///
    /// Removing the last filtered listener for a pin tells the device to
    /// stop listening; the listener is removed even if that command fails.
    /// Returns `false` for unknown ids.
    pub async fn remove_listener(&self, id: ListenerId) -> Result<bool> {
        let mut listening = self.listening.lock().await;
        let pin = match self.inner.listeners.remove(id) {
            None => return Ok(false),
            Some(Removed::Other) | Some(Removed::Event(None)) => {
                debug!(listener = %id, "Removed listener");
                return Ok(true);
            }
            Some(Removed::Event(Some(pin))) => pin,
        };

        let count = listening.get(&pin).copied().unwrap_or(0);
        if count > 1 {
            listening.insert(pin, count - 1);
            debug!(listener = %id, pin = %pin, count = count - 1, "Removed event listener");
            return Ok(true);
        }

        listening.remove(&pin);
        self.inner
            .correlator
            .send(self.connection.as_ref(), &Command::StopListening(pin))
            .await?;
        info!(pin = %pin, "Stopped listening");
        Ok(true)
    }

    /// Pins the device is currently asked to report
    pub async fn listening_pins(&self) -> Vec<Pin> {
        let mut pins: Vec<Pin> = self.listening.lock().await.keys().copied().collect();
        pins.sort_by_key(|pin| (pin.kind().letter(), pin.number()));
        pins
    }

    /// Number of registered listeners of all kinds
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    /// Number of commands awaiting a reply
    pub fn pending_replies(&self) -> usize {
        self.inner.correlator.pending_count()
    }

    // ===== Lifecycle =====

    /// Wait until the device shows signs of life
    ///
    /// Sends an inert no-tone probe on `A0` every probe interval and
    /// returns `true` as soon as inbound traffic matching `mode` is seen,
    /// `false` when `timeout` elapses first or the link is closed.
    pub async fn wait_for_ready(&self, timeout: Duration, mode: ReadyMode) -> bool {
        let (waiter, signal) = self.inner.add_waiter(mode);
        let deadline = Instant::now() + timeout;
        let probe = Command::NoTone(Pin::analog(0));

        let ready = loop {
            if self.is_closed() {
                break false;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            let sent = tokio::time::timeout(
                remaining,
                self.inner.correlator.send(self.connection.as_ref(), &probe),
            )
            .await;
            match sent {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Ready check write failed"),
                Err(_) => {
                    let e = LinkError::Timeout {
                        duration_ms: timeout.as_millis() as u64,
                    };
                    warn!(error = %e, code = e.error_code(), "Ready check write stalled");
                    break false;
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let wait = self.config.probe_interval.min(remaining);
            if tokio::time::timeout(wait, signal.notified()).await.is_ok() {
                break true;
            }
            if Instant::now() >= deadline {
                break false;
            }
        };

        self.inner.remove_waiter(waiter);
        if ready {
            info!(?mode, "Device is ready");
        } else {
            warn!(?mode, timeout_ms = timeout.as_millis() as u64, "Device not ready");
        }
        ready
    }

    /// [`wait_for_ready`](Self::wait_for_ready) with the configured
    /// timeout and mode
    pub async fn wait_until_ready(&self) -> bool {
        self.wait_for_ready(self.config.ready_timeout, self.config.ready_mode)
            .await
    }

    /// Close the link and its connection
    ///
    /// Stops listening on every listened pin (failures are logged), removes
    /// all listeners, abandons pending replies and closes the connection.
    /// Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut listening = self.listening.lock().await;
        let mut pins: Vec<Pin> = listening.drain().map(|(pin, _)| pin).collect();
        pins.sort_by_key(|pin| (pin.kind().letter(), pin.number()));
        for pin in pins {
            if let Err(e) = self
                .inner
                .correlator
                .send(self.connection.as_ref(), &Command::StopListening(pin))
                .await
            {
                warn!(pin = %pin, error = %e, "Stop listening failed during close");
            }
        }
        drop(listening);

        self.inner.notify_state(ConnectionState::Closed);
        self.inner.listeners.clear();
        let abandoned = self.inner.correlator.abandon_all();
        self.connection.remove_listener(&self.registration);
        self.connection.close().await?;

        info!(connection = self.connection.name(), abandoned, "Link closed");
        Ok(())
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("connection", &self.connection.name())
            .field("protocol", &self.inner.protocol.name())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.connection.remove_listener(&self.registration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pin::PinValue;
    use crate::protocol::TextProtocol;
    use crate::test_utils::{DeviceSimulator, MockConnection};
    use std::sync::atomic::AtomicUsize;

    fn text_link() -> (Arc<MockConnection>, Link) {
        let connection = Arc::new(MockConnection::new());
        let link = Link::new(connection.clone(), Arc::new(TextProtocol::new()));
        (connection, link)
    }

    fn collect_events() -> (Arc<SyncMutex<Vec<PinEvent>>>, impl Fn(&PinEvent) -> anyhow::Result<()>) {
        let events = Arc::new(SyncMutex::new(Vec::new()));
        let sink = events.clone();
        (events, move |event: &PinEvent| {
            sink.lock().push(*event);
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_commands_are_encoded() {
        let (connection, link) = text_link();
        link.switch_analog_pin(Pin::analog(3), 128).await.unwrap();
        link.switch_digital_pin(Pin::digital(13), true).await.unwrap();
        link.send_no_tone(Pin::analog(1)).await.unwrap();
        link.send_custom_message(["hello", "world"]).await.unwrap();

        assert_eq!(
            connection.written_text(),
            vec![
                "alp://ppin/3/128\n",
                "alp://ppsw/13/1\n",
                "alp://notn/1\n",
                "alp://cust/hello/world\n",
            ]
        );
    }

    #[tokio::test]
    async fn test_filtered_listeners_share_one_start() {
        let (connection, link) = text_link();
        let pin = Pin::analog(2);

        let first = link.add_event_listener(Some(pin), |_| Ok(())).await.unwrap();
        let second = link.add_event_listener(Some(pin), |_| Ok(())).await.unwrap();
        assert_eq!(connection.count_written("srla/2"), 1);
        assert_eq!(link.listening_pins().await, vec![pin]);

        assert!(link.remove_listener(first).await.unwrap());
        assert_eq!(connection.count_written("spla/2"), 0);
        assert!(link.remove_listener(second).await.unwrap());
        assert_eq!(connection.count_written("spla/2"), 1);
        assert!(!link.remove_listener(second).await.unwrap());
        assert!(link.listening_pins().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_start_does_not_register() {
        let (connection, link) = text_link();
        connection.fail_writes(true);

        let result = link.add_event_listener(Some(Pin::digital(4)), |_| Ok(())).await;
        assert!(result.is_err());
        assert_eq!(link.listener_count(), 0);
        assert!(link.listening_pins().await.is_empty());

        connection.fail_writes(false);
        link.add_event_listener(Some(Pin::digital(4)), |_| Ok(()))
            .await
            .unwrap();
        assert_eq!(connection.count_written("srld/4"), 1);
    }

    #[tokio::test]
    async fn test_listener_sees_no_events_before_registration_completes() {
        let (connection, link) = text_link();
        // the device reports the pin while the start command is in flight
        connection.set_responder(Arc::new(|bytes: &[u8]| {
            if bytes.starts_with(b"alp://srla/2") {
                vec![b"alp://ared/2/5".to_vec()]
            } else {
                Vec::new()
            }
        }));
        let (events, listener) = collect_events();

        link.add_event_listener(Some(Pin::analog(2)), listener)
            .await
            .unwrap();
        assert!(events.lock().is_empty());

        connection.inject(b"alp://ared/2/6");
        assert_eq!(events.lock().len(), 1);
        assert_eq!(events.lock()[0].value, PinValue::Analog(6));
    }

    #[tokio::test]
    async fn test_add_waiting_on_close_is_rejected() {
        let (connection, link) = text_link();
        let link = Arc::new(link);

        // hold the counts the way close() does while it sends stops
        let counts = link.listening.lock().await;
        let adding = link.clone();
        let task = tokio::spawn(async move {
            adding
                .add_event_listener(Some(Pin::digital(5)), |_| Ok(()))
                .await
        });
        tokio::task::yield_now().await;
        link.closed.store(true, Ordering::SeqCst);
        drop(counts);

        assert!(matches!(task.await.unwrap(), Err(LinkError::Closed)));
        assert_eq!(connection.count_written("srld/5"), 0);
        assert!(link.listening_pins().await.is_empty());
        assert_eq!(link.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_events_respect_filter() {
        let (connection, link) = text_link();
        let (filtered, filtered_sink) = collect_events();
        let (all, all_sink) = collect_events();

        link.add_event_listener(Some(Pin::digital(3)), filtered_sink)
            .await
            .unwrap();
        link.add_event_listener(None, all_sink).await.unwrap();

        connection.inject(b"alp://dred/3/1");
        connection.inject(b"alp://ared/1/512");

        assert_eq!(
            *filtered.lock(),
            vec![PinEvent {
                pin: Pin::digital(3),
                value: PinValue::Digital(true)
            }]
        );
        assert_eq!(all.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_failing_listener_does_not_stop_others() {
        let (connection, link) = text_link();
        let (events, sink) = collect_events();

        link.add_event_listener(None, |_| Err(anyhow::anyhow!("listener error")))
            .await
            .unwrap();
        link.add_event_listener(None, |_| panic!("listener panic"))
            .await
            .unwrap();
        link.add_event_listener(None, sink).await.unwrap();

        connection.inject(b"alp://ared/0/7");
        assert_eq!(events.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_undecodable_frames_are_dropped() {
        let (connection, link) = text_link();
        let (events, sink) = collect_events();
        link.add_event_listener(None, sink).await.unwrap();

        connection.inject(b"garbage");
        connection.inject(b"alp://dred/3/7");
        connection.inject(b"alp://dred/3/0");

        assert_eq!(events.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_request_receives_reply() {
        let (connection, link) = text_link();
        connection.set_responder(DeviceSimulator::text());

        let reply = link
            .request(Command::StartListening(Pin::analog(5)))
            .await
            .unwrap()
            .await
            .unwrap();
        assert_eq!(reply.id, 1);
        assert!(reply.ok);
        assert_eq!(link.pending_replies(), 0);
    }

    #[tokio::test]
    async fn test_reply_and_custom_listeners() {
        let (connection, link) = text_link();
        let replies = Arc::new(AtomicUsize::new(0));
        let customs = Arc::new(SyncMutex::new(Vec::new()));

        let counter = replies.clone();
        link.add_reply_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let sink = customs.clone();
        link.add_custom_listener(move |payload| {
            sink.lock().push(payload.to_vec());
            Ok(())
        });

        connection.inject(b"alp://rply/ok?id=42");
        connection.inject(b"alp://cust/temp/21");

        assert_eq!(replies.load(Ordering::SeqCst), 1);
        assert_eq!(*customs.lock(), vec![vec!["temp".to_string(), "21".to_string()]]);
    }

    #[tokio::test]
    async fn test_connection_state_listener() {
        let (connection, link) = text_link();
        let states = Arc::new(SyncMutex::new(Vec::new()));
        let sink = states.clone();
        link.add_connection_listener(move |state| {
            sink.lock().push(state);
            Ok(())
        });

        connection.simulate_lost();
        connection.simulate_reconnected();
        link.close().await.unwrap();

        assert_eq!(
            *states.lock(),
            vec![
                ConnectionState::Lost,
                ConnectionState::Connected,
                ConnectionState::Closed
            ]
        );
    }

    #[tokio::test]
    async fn test_close_stops_listening_and_rejects_commands() {
        let (connection, link) = text_link();
        link.add_event_listener(Some(Pin::analog(1)), |_| Ok(()))
            .await
            .unwrap();
        link.add_event_listener(Some(Pin::digital(2)), |_| Ok(()))
            .await
            .unwrap();

        link.close().await.unwrap();
        link.close().await.unwrap();

        assert_eq!(connection.count_written("spla/1"), 1);
        assert_eq!(connection.count_written("spld/2"), 1);
        assert_eq!(connection.close_calls(), 1);
        assert_eq!(connection.listener_count(), 0);
        assert_eq!(link.listener_count(), 0);
        assert!(matches!(
            link.switch_digital_pin(Pin::digital(2), true).await,
            Err(LinkError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_from_config_unknown_protocol() {
        let connection = Arc::new(MockConnection::new());
        let result = Link::from_config(connection, LinkConfig::with_protocol("nope"));
        assert!(matches!(result, Err(LinkError::UnknownProtocol(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_ready_any_message() {
        let (connection, link) = text_link();
        let link = Arc::new(link);

        let waiting = link.clone();
        let handle = tokio::spawn(async move {
            waiting
                .wait_for_ready(Duration::from_secs(5), ReadyMode::AnyMessage)
                .await
        });

        tokio::time::sleep(Duration::from_millis(1200)).await;
        connection.inject(b"not even a frame");
        assert!(handle.await.unwrap());
        assert_eq!(connection.count_written("notn/0"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_ready_only_ignores_other_frames() {
        let (connection, link) = text_link();
        let link = Arc::new(link);

        let waiting = link.clone();
        let handle = tokio::spawn(async move {
            waiting
                .wait_for_ready(Duration::from_secs(2), ReadyMode::ReadyOnly)
                .await
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        connection.inject(b"alp://ared/0/1");
        tokio::time::sleep(Duration::from_millis(100)).await;
        connection.inject(b"alp://ready/");
        assert!(handle.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_ready_times_out() {
        let (connection, link) = text_link();
        connection.fail_writes(true);

        let start = Instant::now();
        let ready = link
            .wait_for_ready(Duration::from_secs(2), ReadyMode::AnyMessage)
            .await;
        assert!(!ready);
        assert!(start.elapsed() >= Duration::from_secs(2));
    }
}
