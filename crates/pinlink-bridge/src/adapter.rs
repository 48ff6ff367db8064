//! Bus adapter
//!
//! Translates bus messages into link commands and link pin events into bus
//! publications.
//!
//! ## Bus → device
//!
//! | topic | payload | effect |
//! |-------|---------|--------|
//! | analog write | decimal `u32` | switch analog pin |
//! | digital write | `true`/`false` or `1`/`0` | switch digital pin |
//! | analog/digital control | `true`/`false` | listen/unlisten the pin |
//!
//! Control topics are only honored when the control channel is enabled.
//! Malformed payloads are dropped without a command.
//!
//! ## Device → bus
//!
//! Events of listened pins are published on the read topic of the pin with
//! the canonical payload (`1`/`0` or decimal). Analog events pass through
//! the [`FloodController`] first.

use pinlink_core::{Link, ListenerId, Pin, PinEvent, PinKind, PinValue};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::flood::{FloodController, Offer};

/// Callback for publishing messages to the bus
pub type PublishCallback =
    Arc<dyn Fn(String, Vec<u8>) -> std::result::Result<(), String> + Send + Sync>;

/// Bridge statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeStats {
    /// Bus messages handled
    pub messages_received: u64,
    /// Pin commands sent to the device
    pub commands_issued: u64,
    /// Listen/unlisten requests applied
    pub control_changes: u64,
    /// Publications accepted by the bus
    pub publications: u64,
    /// Publications the bus refused
    pub publish_failures: u64,
    /// Analog readings dropped by the tolerance filter
    pub suppressed: u64,
    /// Values published from aggregation ticks
    pub aggregated: u64,
    /// Bus messages dropped for malformed topics or payloads
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct StatsCounters {
    messages_received: AtomicU64,
    commands_issued: AtomicU64,
    control_changes: AtomicU64,
    publications: AtomicU64,
    publish_failures: AtomicU64,
    suppressed: AtomicU64,
    aggregated: AtomicU64,
    dropped: AtomicU64,
}

impl StatsCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> BridgeStats {
        BridgeStats {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            commands_issued: self.commands_issued.load(Ordering::Relaxed),
            control_changes: self.control_changes.load(Ordering::Relaxed),
            publications: self.publications.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
            aggregated: self.aggregated.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// What [`BusAdapter::handle_message`] did with a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    /// A pin command was sent
    Command,
    /// A pin was listened or unlistened
    Control,
    /// The topic matched but the message was malformed
    Dropped,
    /// The topic is not a bridge command topic
    Ignored,
}

/// Bidirectional translation between a link and a bus
pub struct BusAdapter {
    link: Arc<Link>,
    config: BridgeConfig,
    publisher: PublishCallback,
    flood: FloodController,
    /// Pins this adapter listens on, with its registration
    listeners: Mutex<HashMap<Pin, ListenerId>>,
    stats: StatsCounters,
    myself: Weak<BusAdapter>,
}

impl BusAdapter {
    /// Create an adapter publishing through `publisher`
    pub fn new(
        link: Arc<Link>,
        config: BridgeConfig,
        flood: FloodController,
        publisher: PublishCallback,
    ) -> Arc<Self> {
        Arc::new_cyclic(|myself| Self {
            link,
            config,
            publisher,
            flood,
            listeners: Mutex::new(HashMap::new()),
            stats: StatsCounters::default(),
            myself: myself.clone(),
        })
    }

    /// The compiled topic patterns
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// The flood controller
    pub fn flood(&self) -> &FloodController {
        &self.flood
    }

    /// Current statistics
    pub fn stats(&self) -> BridgeStats {
        self.stats.snapshot()
    }

    /// Handle one bus message
    ///
    /// Malformed messages on bridge topics are dropped and reported as
    /// [`Handled::Dropped`]; only link failures are errors.
    pub async fn handle_message(&self, topic: &str, payload: &[u8]) -> Result<Handled> {
        StatsCounters::bump(&self.stats.messages_received);
        let handled = self.dispatch(topic, payload).await?;
        match handled {
            Handled::Command => StatsCounters::bump(&self.stats.commands_issued),
            Handled::Control => StatsCounters::bump(&self.stats.control_changes),
            Handled::Dropped => StatsCounters::bump(&self.stats.dropped),
            Handled::Ignored => trace!(topic, "Ignoring non-bridge topic"),
        }
        Ok(handled)
    }

    async fn dispatch(&self, topic: &str, payload: &[u8]) -> Result<Handled> {
        let Ok(text) = std::str::from_utf8(payload) else {
            debug!(topic, "Dropping non-UTF-8 payload");
            return Ok(self.classify_unreadable(topic));
        };
        let text = text.trim();

        if let Some(number) = self.config.write_pattern(PinKind::Analog).capture(topic) {
            let (Some(number), Ok(value)) = (number, text.parse::<u32>()) else {
                debug!(topic, payload = text, "Dropping malformed analog write");
                return Ok(Handled::Dropped);
            };
            self.link.switch_analog_pin(Pin::analog(number), value).await?;
            debug!(topic, value, "Switched analog pin");
            return Ok(Handled::Command);
        }

        if let Some(number) = self.config.write_pattern(PinKind::Digital).capture(topic) {
            let (Some(number), Some(value)) = (number, parse_bool(text)) else {
                debug!(topic, payload = text, "Dropping malformed digital write");
                return Ok(Handled::Dropped);
            };
            self.link.switch_digital_pin(Pin::digital(number), value).await?;
            debug!(topic, value, "Switched digital pin");
            return Ok(Handled::Command);
        }

        if self.config.control_channel() {
            for kind in [PinKind::Analog, PinKind::Digital] {
                let Some(pattern) = self.config.control_pattern(kind) else {
                    continue;
                };
                let Some(number) = pattern.capture(topic) else {
                    continue;
                };
                let (Some(number), Some(listen)) = (number, parse_control(text)) else {
                    debug!(topic, payload = text, "Dropping malformed control message");
                    return Ok(Handled::Dropped);
                };
                let pin = Pin::new(kind, number);
                if listen {
                    self.listen(pin).await?;
                } else {
                    self.unlisten(pin).await?;
                }
                return Ok(Handled::Control);
            }
        }

        Ok(Handled::Ignored)
    }

    fn classify_unreadable(&self, topic: &str) -> Handled {
        let write = [PinKind::Analog, PinKind::Digital]
            .into_iter()
            .any(|kind| self.config.write_pattern(kind).capture(topic).is_some());
        let control = self.config.control_channel()
            && [PinKind::Analog, PinKind::Digital].into_iter().any(|kind| {
                self.config
                    .control_pattern(kind)
                    .is_some_and(|p| p.capture(topic).is_some())
            });
        if write || control {
            Handled::Dropped
        } else {
            Handled::Ignored
        }
    }

    /// Listen on `pin` and publish its events
    ///
    /// Listening twice on one pin is a no-op.
    pub async fn listen(&self, pin: Pin) -> Result<()> {
        let mut listeners = self.listeners.lock().await;
        if listeners.contains_key(&pin) {
            return Ok(());
        }
        let adapter = self.myself.clone();
        let id = self
            .link
            .add_event_listener(Some(pin), move |event| match adapter.upgrade() {
                Some(adapter) => adapter.on_pin_event(event),
                None => Ok(()),
            })
            .await?;
        listeners.insert(pin, id);
        info!(pin = %pin, "Bridge listening");
        Ok(())
    }

    /// Stop publishing events of `pin`
    pub async fn unlisten(&self, pin: Pin) -> Result<()> {
        let Some(id) = self.listeners.lock().await.remove(&pin) else {
            return Ok(());
        };
        self.link.remove_listener(id).await?;
        info!(pin = %pin, "Bridge stopped listening");
        Ok(())
    }

    /// Pins this adapter listens on
    pub async fn listened_pins(&self) -> Vec<Pin> {
        let mut pins: Vec<Pin> = self.listeners.lock().await.keys().copied().collect();
        pins.sort_by_key(|pin| (pin.kind().letter(), pin.number()));
        pins
    }

    /// Remove every listener this adapter registered
    pub async fn detach(&self) {
        let registrations: Vec<(Pin, ListenerId)> = self.listeners.lock().await.drain().collect();
        for (pin, id) in registrations {
            if let Err(e) = self.link.remove_listener(id).await {
                warn!(pin = %pin, error = %e, "Failed to remove bridge listener");
            }
        }
    }

    /// Publish the values reduced by an aggregation tick
    pub fn flush(&self) -> usize {
        let reduced = self.flood.tick();
        let count = reduced.len();
        for (pin, value) in reduced {
            if self.publish(pin, &PinValue::Analog(value)).is_ok() {
                StatsCounters::bump(&self.stats.aggregated);
            }
        }
        count
    }

    fn on_pin_event(&self, event: &PinEvent) -> anyhow::Result<()> {
        match event.value {
            PinValue::Analog(value) => match self.flood.offer(event.pin, value) {
                Offer::Emit(value) => self.publish(event.pin, &PinValue::Analog(value))?,
                Offer::Suppressed => StatsCounters::bump(&self.stats.suppressed),
                Offer::Buffered => {}
            },
            PinValue::Digital(_) => self.publish(event.pin, &event.value)?,
        }
        Ok(())
    }

    fn publish(&self, pin: Pin, value: &PinValue) -> Result<()> {
        let topic = self.config.read_topic(pin);
        let payload = value.to_payload().into_bytes();
        match (self.publisher)(topic.clone(), payload) {
            Ok(()) => {
                trace!(topic = %topic, value = %value, "Published pin state");
                StatsCounters::bump(&self.stats.publications);
                Ok(())
            }
            Err(reason) => {
                warn!(topic = %topic, error = %reason, "Publish failed");
                StatsCounters::bump(&self.stats.publish_failures);
                Err(BridgeError::PublishFailed { topic, reason })
            }
        }
    }
}

impl std::fmt::Debug for BusAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusAdapter")
            .field("prefix", &self.config.topic_prefix())
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

fn parse_bool(text: &str) -> Option<bool> {
    match text {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

fn parse_control(text: &str) -> Option<bool> {
    match text {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}
