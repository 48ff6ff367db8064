//! Pinlink Bridge - Publish/subscribe bus bridge for device links
//!
//! This crate mirrors the pins of a [`pinlink_core::Link`] onto a topic tree
//! of a publish/subscribe bus such as MQTT, so that bus clients can switch
//! pins and follow their state without knowing the wire protocol.
//!
//! # Topics
//!
//! With the prefix `home/devices/ardulink/`:
//!
//! | direction | default layout | compact layout |
//! |-----------|----------------|----------------|
//! | bus → device | `.../D13/value/set` | `.../D13/set` |
//! | device → bus | `.../A0/value/get` | `.../A0` |
//! | control | `.../system/listening/A0` | same |
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use pinlink_bridge::{BridgeSettingsBuilder, MqttConfig, mqtt_bridge};
//!
//! let settings = BridgeSettingsBuilder::new()
//!     .topic_prefix("lab")
//!     .control_channel(true)
//!     .tolerance(3)
//!     .listen(Pin::analog(0))
//!     .build();
//!
//! let (bridge, handle, bus) = mqtt_bridge(link, &settings, &MqttConfig::default())?;
//! tokio::spawn(bridge.run());
//! bus.run(handle).await?;
//! ```
//!
//! # Features
//!
//! - `mqtt` - MQTT bus backed by `rumqttc`

#![warn(missing_docs)]

pub mod adapter;
pub mod bridge;
pub mod config;
pub mod error;
pub mod flood;
#[cfg(feature = "mqtt")]
pub mod mqtt;

pub use adapter::{BridgeStats, BusAdapter, Handled, PublishCallback};
pub use bridge::{BridgeCommand, BridgeHandle, BusMessage, PinBridge};
pub use config::{
    AggregationConfig, AggregationStrategy, BridgeConfig, BridgeSettings, BridgeSettingsBuilder,
    FloodConfig, MqttConfig, TopicPattern, TopicPatterns,
};
pub use error::{BridgeError, Result};
pub use flood::{Aggregator, FloodController, Offer, ToleranceFilter};

#[cfg(feature = "mqtt")]
pub use mqtt::{mqtt_bridge, MqttBus};

/// Version of the pinlink-bridge crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
