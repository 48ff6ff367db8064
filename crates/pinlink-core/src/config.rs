//! Link configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::protocol::TEXT_PROTOCOL_NAME;

/// What counts as "the device is up" while waiting for it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadyMode {
    /// Any inbound frame, decodable or not
    #[default]
    AnyMessage,
    /// Only a decoded ready message
    ReadyOnly,
}

/// Configuration for a [`Link`](crate::link::Link)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Registry name of the wire protocol
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Delay between probes while waiting for the device
    #[serde(with = "humantime_serde", default = "default_probe_interval")]
    pub probe_interval: Duration,
    /// Overall time to wait for the device
    #[serde(with = "humantime_serde", default = "default_ready_timeout")]
    pub ready_timeout: Duration,
    /// Which inbound traffic ends the wait
    #[serde(default)]
    pub ready_mode: ReadyMode,
}

fn default_protocol() -> String {
    TEXT_PROTOCOL_NAME.to_string()
}

fn default_probe_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_ready_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            protocol: default_protocol(),
            probe_interval: default_probe_interval(),
            ready_timeout: default_ready_timeout(),
            ready_mode: ReadyMode::default(),
        }
    }
}

impl LinkConfig {
    /// Config for the named protocol with default timings
    pub fn with_protocol(protocol: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            ..Default::default()
        }
    }
}

/// Duration as a human readable string ("500ms", "10s")
pub mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    /// Serialize as a humantime string
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        humantime::format_duration(*duration)
            .to_string()
            .serialize(serializer)
    }

    /// Parse a humantime string
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
