//! MQTT bus
//!
//! Connects a [`PinBridge`] to an MQTT broker with `rumqttc`: incoming
//! publishes under the topic prefix are delivered to the bridge, pin
//! publications go out through the client.
//!
//! The subscription is renewed on every connection acknowledgement, so the
//! bus keeps working across broker reconnects.

use pinlink_core::Link;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::adapter::PublishCallback;
use crate::bridge::{BridgeHandle, PinBridge};
use crate::config::{BridgeConfig, BridgeSettings, MqttConfig};
use crate::error::Result;

/// Delay before polling again after a connection error
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// MQTT client and event loop for one bridge
pub struct MqttBus {
    client: AsyncClient,
    eventloop: EventLoop,
    subscription: String,
    retained: bool,
}

impl MqttBus {
    /// Create a client for `config`, subscribing to the topics of `bridge`
    ///
    /// Nothing is sent until [`run`](Self::run) polls the event loop.
    pub fn new(config: &MqttConfig, bridge: &BridgeConfig, retained: bool) -> Self {
        let mut options = MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
        options.set_keep_alive(config.keep_alive);
        let (client, eventloop) = AsyncClient::new(options, 64);

        Self {
            client,
            eventloop,
            subscription: bridge.subscription(),
            retained,
        }
    }

    /// Topic filter the bus subscribes to
    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    /// Publish callback for the bridge
    pub fn publisher(&self) -> PublishCallback {
        let client = self.client.clone();
        let retained = self.retained;
        Arc::new(move |topic, payload| {
            client
                .try_publish(topic, QoS::AtLeastOnce, retained, payload)
                .map_err(|e| e.to_string())
        })
    }

    /// Poll the broker and feed incoming messages to the bridge
    ///
    /// Returns when the bridge is gone.
    pub async fn run(mut self, handle: BridgeHandle) -> Result<()> {
        info!(subscription = %self.subscription, "Starting MQTT bus");
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Connected to MQTT broker");
                    self.client
                        .try_subscribe(self.subscription.clone(), QoS::AtLeastOnce)?;
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    debug!(topic = %publish.topic, size = publish.payload.len(), "MQTT message");
                    if handle
                        .deliver(publish.topic.clone(), publish.payload.to_vec())
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    if handle.is_closed() {
                        break;
                    }
                    warn!(error = %e, "MQTT connection error");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }

        info!("Bridge stopped, disconnecting from MQTT broker");
        if let Err(e) = self.client.try_disconnect() {
            debug!(error = %e, "MQTT disconnect failed");
        }
        Ok(())
    }
}

impl std::fmt::Debug for MqttBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttBus")
            .field("subscription", &self.subscription)
            .field("retained", &self.retained)
            .finish()
    }
}

/// Build a bridge over `link` wired to an MQTT broker
///
/// Spawn `bridge.run()` and `bus.run(handle)` to start both directions.
pub fn mqtt_bridge(
    link: Arc<Link>,
    settings: &BridgeSettings,
    mqtt: &MqttConfig,
) -> Result<(PinBridge, BridgeHandle, MqttBus)> {
    let config = BridgeConfig::from_settings(settings)?;
    let bus = MqttBus::new(mqtt, &config, settings.retained);
    let (bridge, handle) = PinBridge::new(link, settings, bus.publisher())?;
    Ok((bridge, handle, bus))
}
