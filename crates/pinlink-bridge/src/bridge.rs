//! PinBridge - Bus bridge service
//!
//! This module provides the service that owns a [`BusAdapter`] and drives
//! it. It handles:
//!
//! - Bus → device: messages delivered through the [`BridgeHandle`]
//! - Device → bus: pin events published by the adapter's listeners
//! - Aggregation ticks on the configured interval
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                        PinBridge                          │
//! ├───────────────────────────────────────────────────────────┤
//! │                                                           │
//! │  ┌───────────┐    ┌──────────────────┐    ┌───────────┐   │
//! │  │ Link      │◄──►│ BusAdapter       │◄──►│ Bus       │   │
//! │  │ (device)  │    │ BridgeConfig     │    │ (publish) │   │
//! │  └───────────┘    │ FloodController  │    └───────────┘   │
//! │                   └──────────────────┘                    │
//! │                            ▲                              │
//! │                   ┌────────┴────────┐                     │
//! │                   │ BridgeHandle rx │◄── deliver(topic)   │
//! │                   │ tick interval   │                     │
//! │                   └─────────────────┘                     │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! let settings = BridgeSettingsBuilder::new().topic_prefix("lab").build();
//! let (bridge, handle) = PinBridge::new(link, &settings, publish)?;
//! tokio::spawn(bridge.run());
//!
//! handle.deliver("lab/D13/value/set", b"true".to_vec()).await?;
//! ```

use pinlink_core::Link;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::adapter::{BridgeStats, BusAdapter, Handled, PublishCallback};
use crate::config::{BridgeConfig, BridgeSettings};
use crate::error::{BridgeError, Result};
use crate::flood::FloodController;

/// A message received from the bus
#[derive(Debug, Clone)]
pub struct BusMessage {
    /// Topic the message was received on
    pub topic: String,
    /// Message payload
    pub payload: Vec<u8>,
}

/// Commands that can be sent to the bridge
#[derive(Debug)]
pub enum BridgeCommand {
    /// Handle a bus message
    Deliver(BusMessage),
    /// Handle a bus message and report the outcome
    DeliverAndReport(BusMessage, oneshot::Sender<Result<Handled>>),
    /// Get bridge statistics
    GetStats(oneshot::Sender<BridgeStats>),
    /// Shutdown the bridge
    Shutdown,
}

/// Handle for controlling the PinBridge
#[derive(Clone, Debug)]
pub struct BridgeHandle {
    command_tx: mpsc::Sender<BridgeCommand>,
}

impl BridgeHandle {
    /// Hand a bus message to the bridge
    pub async fn deliver(&self, topic: impl Into<String>, payload: Vec<u8>) -> Result<()> {
        let message = BusMessage {
            topic: topic.into(),
            payload,
        };
        self.command_tx
            .send(BridgeCommand::Deliver(message))
            .await
            .map_err(|_| BridgeError::NotRunning)
    }

    /// Hand a bus message to the bridge and wait until it is handled
    pub async fn deliver_and_wait(
        &self,
        topic: impl Into<String>,
        payload: Vec<u8>,
    ) -> Result<Handled> {
        let message = BusMessage {
            topic: topic.into(),
            payload,
        };
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(BridgeCommand::DeliverAndReport(message, tx))
            .await
            .map_err(|_| BridgeError::NotRunning)?;
        rx.await.map_err(|_| BridgeError::ChannelClosed)?
    }

    /// Get bridge statistics
    pub async fn stats(&self) -> Result<BridgeStats> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(BridgeCommand::GetStats(tx))
            .await
            .map_err(|_| BridgeError::NotRunning)?;
        rx.await.map_err(|_| BridgeError::ChannelClosed)
    }

    /// Shutdown the bridge
    pub async fn shutdown(&self) -> Result<()> {
        self.command_tx
            .send(BridgeCommand::Shutdown)
            .await
            .map_err(|_| BridgeError::NotRunning)
    }

    /// Check whether the bridge service is gone
    pub fn is_closed(&self) -> bool {
        self.command_tx.is_closed()
    }
}

/// Bridge service connecting a device link to a publish/subscribe bus
pub struct PinBridge {
    /// Topic and pin translation
    adapter: Arc<BusAdapter>,
    /// Command receiver
    command_rx: mpsc::Receiver<BridgeCommand>,
    /// Settings the bridge was built from
    settings: BridgeSettings,
}

impl PinBridge {
    /// Create a new bridge over `link` publishing through `publish`
    pub fn new(
        link: Arc<Link>,
        settings: &BridgeSettings,
        publish: PublishCallback,
    ) -> Result<(Self, BridgeHandle)> {
        settings.validate()?;
        let config = BridgeConfig::from_settings(settings)?;
        let flood = FloodController::new(&settings.flood);
        let adapter = BusAdapter::new(link, config, flood, publish);

        let (command_tx, command_rx) = mpsc::channel(256);
        let handle = BridgeHandle { command_tx };

        let bridge = Self {
            adapter,
            command_rx,
            settings: settings.clone(),
        };
        Ok((bridge, handle))
    }

    /// The adapter driven by this bridge
    pub fn adapter(&self) -> &Arc<BusAdapter> {
        &self.adapter
    }

    /// Run the bridge service
    ///
    /// Listens on the startup pins, then handles delivered bus messages and
    /// aggregation ticks until shutdown or until every handle is dropped.
    /// On exit the adapter's listeners are removed; the link stays open.
    pub async fn run(mut self) -> Result<()> {
        info!(
            prefix = self.adapter.config().topic_prefix(),
            "Starting bridge service"
        );

        for pin in self.settings.startup_pins() {
            self.adapter.listen(pin).await?;
        }

        let interval = self.adapter.flood().interval();
        let mut ticker = tokio::time::interval(interval.unwrap_or(Duration::from_secs(3600)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(BridgeCommand::Deliver(message)) => {
                            if let Err(e) = self.handle(&message).await {
                                warn!(topic = %message.topic, error = %e, "Error handling bus message");
                            }
                        }
                        Some(BridgeCommand::DeliverAndReport(message, tx)) => {
                            let _ = tx.send(self.handle(&message).await);
                        }
                        Some(BridgeCommand::GetStats(tx)) => {
                            let _ = tx.send(self.adapter.stats());
                        }
                        Some(BridgeCommand::Shutdown) => {
                            info!("Bridge shutdown requested");
                            break;
                        }
                        None => {
                            debug!("All bridge handles dropped");
                            break;
                        }
                    }
                }

                _ = ticker.tick(), if interval.is_some() => {
                    let published = self.adapter.flush();
                    if published > 0 {
                        trace!(published, "Aggregation tick");
                    }
                }
            }
        }

        self.adapter.flush();
        self.adapter.detach().await;

        let stats = self.adapter.stats();
        info!(
            received = stats.messages_received,
            commands = stats.commands_issued,
            publications = stats.publications,
            "Bridge stopped"
        );
        Ok(())
    }

    async fn handle(&self, message: &BusMessage) -> Result<Handled> {
        trace!(topic = %message.topic, size = message.payload.len(), "Bus message");
        self.adapter
            .handle_message(&message.topic, &message.payload)
            .await
    }
}

impl std::fmt::Debug for PinBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinBridge")
            .field("adapter", &self.adapter)
            .field("startup_pins", &self.settings.startup_pins())
            .finish()
    }
}
