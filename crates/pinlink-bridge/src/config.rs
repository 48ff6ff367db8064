//! Bridge configuration
//!
//! Two layers:
//!
//! - [`BridgeSettings`] is the serializable configuration (prefix, flags,
//!   flood control, startup pins), built by hand or with
//!   [`BridgeSettingsBuilder`]
//! - [`BridgeConfig`] holds the compiled topic patterns derived from it

use pinlink_core::config::humantime_serde;
use pinlink_core::{Pin, PinKind};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::{BridgeError, Result};

/// Default topic prefix
pub const DEFAULT_TOPIC_PREFIX: &str = "home/devices/ardulink/";

/// Default upper bound of analog readings
pub const DEFAULT_MAX_VALUE: u32 = 1023;

/// Default MQTT port
pub const DEFAULT_MQTT_PORT: u16 = 1883;

// ============================================================================
// Topic Patterns
// ============================================================================

/// A topic regex with exactly one capture group for the pin number
#[derive(Clone)]
pub struct TopicPattern {
    source: String,
    regex: Regex,
}

impl TopicPattern {
    /// Compile a pattern; the whole topic must match
    pub fn new(source: impl Into<String>) -> Result<Self> {
        let source = source.into();
        let regex = Regex::new(&format!("^(?:{})$", source)).map_err(|e| {
            BridgeError::InvalidPattern {
                pattern: source.clone(),
                reason: e.to_string(),
            }
        })?;
        if regex.captures_len() != 2 {
            return Err(BridgeError::InvalidPattern {
                pattern: source,
                reason: "pattern needs exactly one capture group".to_string(),
            });
        }
        Ok(Self { source, regex })
    }

    /// The pattern as written
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Pin number captured from `topic`, if the topic matches
    ///
    /// `Some(None)` means the topic matched but the capture is not a number.
    pub fn capture(&self, topic: &str) -> Option<Option<u32>> {
        let captures = self.regex.captures(topic)?;
        Some(captures.get(1).and_then(|m| m.as_str().parse().ok()))
    }

    /// Concrete topic for pin `number`
    ///
    /// Replaces the capture group with the number and drops regex escapes.
    /// Patterns with alternations outside the group do not render to a
    /// single topic; read patterns should be literal apart from the group.
    pub fn render(&self, number: u32) -> String {
        let mut out = String::with_capacity(self.source.len());
        let mut chars = self.source.chars().peekable();
        let mut depth = 0usize;
        let mut replaced = false;

        while let Some(c) = chars.next() {
            match c {
                '\\' => {
                    if let Some(escaped) = chars.next() {
                        if depth == 0 {
                            out.push(escaped);
                        }
                    }
                }
                '(' if !replaced && chars.peek() != Some(&'?') => {
                    if depth == 0 {
                        out.push_str(&number.to_string());
                    }
                    depth += 1;
                }
                ')' if depth > 0 => {
                    depth -= 1;
                    if depth == 0 {
                        replaced = true;
                    }
                }
                _ if depth > 0 => {}
                _ => out.push(c),
            }
        }
        out
    }
}

impl fmt::Debug for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TopicPattern").field(&self.source).finish()
    }
}

/// Pattern sources for every topic family
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicPatterns {
    /// Analog pin publications
    pub analog_read: String,
    /// Digital pin publications
    pub digital_read: String,
    /// Analog pin commands
    pub analog_write: String,
    /// Digital pin commands
    pub digital_write: String,
    /// Remote listen/unlisten for analog pins
    pub analog_control: Option<String>,
    /// Remote listen/unlisten for digital pins
    pub digital_control: Option<String>,
}

impl TopicPatterns {
    /// The explicit pattern set for `prefix`
    pub fn for_prefix(prefix: &str) -> Self {
        let p = regex::escape(&normalize_prefix(prefix));
        Self {
            analog_read: format!(r"{}A(\d+)/value/get", p),
            digital_read: format!(r"{}D(\d+)/value/get", p),
            analog_write: format!(r"{}A(\d+)/value/set", p),
            digital_write: format!(r"{}D(\d+)/value/set", p),
            analog_control: Some(format!(r"{}system/listening/A(\d+)", p)),
            digital_control: Some(format!(r"{}system/listening/D(\d+)", p)),
        }
    }

    /// Denser variant: writes on `.../A3/set`, reads on `.../A3`
    ///
    /// Control patterns are kept as they are.
    pub fn compact(&self) -> Self {
        let write = |s: &str| s.replace("/value/set", "/set");
        let read = |s: &str| s.strip_suffix("/value/get").unwrap_or(s).to_string();
        Self {
            analog_read: read(&self.analog_read),
            digital_read: read(&self.digital_read),
            analog_write: write(&self.analog_write),
            digital_write: write(&self.digital_write),
            analog_control: self.analog_control.clone(),
            digital_control: self.digital_control.clone(),
        }
    }
}

/// Normalize a prefix to end in `/` (empty stays empty)
pub fn normalize_prefix(prefix: &str) -> String {
    if prefix.is_empty() || prefix.ends_with('/') {
        prefix.to_string()
    } else {
        format!("{}/", prefix)
    }
}

/// Compiled topic patterns of a bridge
///
/// Immutable after construction; [`BridgeConfig::compact`] derives a new one.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    topic_prefix: String,
    control_channel: bool,
    analog_read: TopicPattern,
    digital_read: TopicPattern,
    analog_write: TopicPattern,
    digital_write: TopicPattern,
    analog_control: Option<TopicPattern>,
    digital_control: Option<TopicPattern>,
    patterns: TopicPatterns,
}

impl BridgeConfig {
    /// Default patterns for `prefix`, control channel disabled
    pub fn new(prefix: &str) -> Result<Self> {
        Self::from_patterns(prefix, TopicPatterns::for_prefix(prefix))
    }

    /// Compile an explicit pattern set
    pub fn from_patterns(prefix: &str, patterns: TopicPatterns) -> Result<Self> {
        let optional = |source: &Option<String>| source.as_deref().map(TopicPattern::new).transpose();
        Ok(Self {
            topic_prefix: normalize_prefix(prefix),
            control_channel: false,
            analog_read: TopicPattern::new(patterns.analog_read.clone())?,
            digital_read: TopicPattern::new(patterns.digital_read.clone())?,
            analog_write: TopicPattern::new(patterns.analog_write.clone())?,
            digital_write: TopicPattern::new(patterns.digital_write.clone())?,
            analog_control: optional(&patterns.analog_control)?,
            digital_control: optional(&patterns.digital_control)?,
            patterns,
        })
    }

    /// Compile the patterns described by `settings`
    pub fn from_settings(settings: &BridgeSettings) -> Result<Self> {
        let patterns = settings
            .patterns
            .clone()
            .unwrap_or_else(|| TopicPatterns::for_prefix(&settings.topic_prefix));
        let config = Self::from_patterns(&settings.topic_prefix, patterns)?
            .with_control_channel(settings.control_channel);
        if settings.compact {
            config.compact()
        } else {
            Ok(config)
        }
    }

    /// Enable or disable the control channel
    pub fn with_control_channel(mut self, enabled: bool) -> Self {
        self.control_channel = enabled;
        self
    }

    /// Derive the compact pattern set from this one
    pub fn compact(&self) -> Result<Self> {
        Ok(Self::from_patterns(&self.topic_prefix, self.patterns.compact())?
            .with_control_channel(self.control_channel))
    }

    /// Topic prefix, ending in `/`
    pub fn topic_prefix(&self) -> &str {
        &self.topic_prefix
    }

    /// Whether control topics are honored
    pub fn control_channel(&self) -> bool {
        self.control_channel
    }

    /// Pattern sources
    pub fn patterns(&self) -> &TopicPatterns {
        &self.patterns
    }

    /// Read pattern for a pin kind
    pub fn read_pattern(&self, kind: PinKind) -> &TopicPattern {
        match kind {
            PinKind::Analog => &self.analog_read,
            PinKind::Digital => &self.digital_read,
        }
    }

    /// Write pattern for a pin kind
    pub fn write_pattern(&self, kind: PinKind) -> &TopicPattern {
        match kind {
            PinKind::Analog => &self.analog_write,
            PinKind::Digital => &self.digital_write,
        }
    }

    /// Control pattern for a pin kind, if one is configured
    pub fn control_pattern(&self, kind: PinKind) -> Option<&TopicPattern> {
        match kind {
            PinKind::Analog => self.analog_control.as_ref(),
            PinKind::Digital => self.digital_control.as_ref(),
        }
    }

    /// Topic on which the state of `pin` is published
    pub fn read_topic(&self, pin: Pin) -> String {
        self.read_pattern(pin.kind()).render(pin.number())
    }

    /// Topic commanding `pin`
    pub fn write_topic(&self, pin: Pin) -> String {
        self.write_pattern(pin.kind()).render(pin.number())
    }

    /// Subscription filter covering every bridge topic
    pub fn subscription(&self) -> String {
        format!("{}#", self.topic_prefix)
    }
}

// ============================================================================
// Flood Control
// ============================================================================

/// How an aggregation bucket is reduced on each tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationStrategy {
    /// Publish the last sample
    #[default]
    LastWins,
    /// Publish the truncated mean
    Average,
}

/// Time-sliced aggregation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    /// Bucket reduction
    #[serde(default)]
    pub strategy: AggregationStrategy,
    /// Tick interval
    #[serde(with = "humantime_serde", default = "default_aggregation_interval")]
    pub interval: Duration,
}

fn default_aggregation_interval() -> Duration {
    Duration::from_millis(250)
}

/// Analog flood control settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FloodConfig {
    /// Suppress changes within this distance of the last published value
    #[serde(default)]
    pub tolerance: Option<u32>,
    /// Largest analog value the device reports
    #[serde(default = "default_max_value")]
    pub max_value: u32,
    /// Publish one reduced value per interval
    #[serde(default)]
    pub aggregation: Option<AggregationConfig>,
}

fn default_max_value() -> u32 {
    DEFAULT_MAX_VALUE
}

impl Default for FloodConfig {
    fn default() -> Self {
        Self {
            tolerance: None,
            max_value: DEFAULT_MAX_VALUE,
            aggregation: None,
        }
    }
}

// ============================================================================
// Bridge Settings
// ============================================================================

/// Serializable bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeSettings {
    /// Prefix of every bridge topic
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    /// Honor remote listen/unlisten topics
    #[serde(default)]
    pub control_channel: bool,
    /// Use the compact topic layout
    #[serde(default)]
    pub compact: bool,
    /// Explicit patterns instead of the ones derived from the prefix
    #[serde(default)]
    pub patterns: Option<TopicPatterns>,
    /// Analog flood control
    #[serde(default)]
    pub flood: FloodConfig,
    /// Analog pins listened to when the bridge starts
    #[serde(default)]
    pub listen_analog: Vec<u32>,
    /// Digital pins listened to when the bridge starts
    #[serde(default)]
    pub listen_digital: Vec<u32>,
    /// Publish with the retained flag
    #[serde(default)]
    pub retained: bool,
}

fn default_topic_prefix() -> String {
    DEFAULT_TOPIC_PREFIX.to_string()
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            topic_prefix: default_topic_prefix(),
            control_channel: false,
            compact: false,
            patterns: None,
            flood: FloodConfig::default(),
            listen_analog: Vec::new(),
            listen_digital: Vec::new(),
            retained: false,
        }
    }
}

impl BridgeSettings {
    /// Pins to listen on at startup
    pub fn startup_pins(&self) -> Vec<Pin> {
        self.listen_analog
            .iter()
            .map(|n| Pin::analog(*n))
            .chain(self.listen_digital.iter().map(|n| Pin::digital(*n)))
            .collect()
    }

    /// Check settings that serde cannot
    pub fn validate(&self) -> Result<()> {
        if let Some(tolerance) = self.flood.tolerance {
            if tolerance >= self.flood.max_value {
                return Err(BridgeError::InvalidConfig(format!(
                    "tolerance {} must be below max value {}",
                    tolerance, self.flood.max_value
                )));
            }
        }
        if let Some(aggregation) = &self.flood.aggregation {
            if aggregation.interval.is_zero() {
                return Err(BridgeError::InvalidConfig(
                    "aggregation interval must be positive".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Builder for BridgeSettings
#[derive(Debug, Default)]
pub struct BridgeSettingsBuilder {
    settings: BridgeSettings,
}

impl BridgeSettingsBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the topic prefix
    pub fn topic_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.settings.topic_prefix = prefix.into();
        self
    }

    /// Enable or disable the control channel
    pub fn control_channel(mut self, enabled: bool) -> Self {
        self.settings.control_channel = enabled;
        self
    }

    /// Use the compact topic layout
    pub fn compact(mut self, enabled: bool) -> Self {
        self.settings.compact = enabled;
        self
    }

    /// Use explicit topic patterns
    pub fn patterns(mut self, patterns: TopicPatterns) -> Self {
        self.settings.patterns = Some(patterns);
        self
    }

    /// Suppress analog changes within `tolerance`
    pub fn tolerance(mut self, tolerance: u32) -> Self {
        self.settings.flood.tolerance = Some(tolerance);
        self
    }

    /// Set the largest analog value
    pub fn max_value(mut self, max_value: u32) -> Self {
        self.settings.flood.max_value = max_value;
        self
    }

    /// Aggregate analog readings per interval
    pub fn aggregate(mut self, strategy: AggregationStrategy, interval: Duration) -> Self {
        self.settings.flood.aggregation = Some(AggregationConfig { strategy, interval });
        self
    }

    /// Listen on a pin when the bridge starts
    pub fn listen(mut self, pin: Pin) -> Self {
        match pin.kind() {
            PinKind::Analog => self.settings.listen_analog.push(pin.number()),
            PinKind::Digital => self.settings.listen_digital.push(pin.number()),
        }
        self
    }

    /// Publish with the retained flag
    pub fn retained(mut self, retained: bool) -> Self {
        self.settings.retained = retained;
        self
    }

    /// Build the settings
    pub fn build(self) -> BridgeSettings {
        self.settings
    }
}

// ============================================================================
// MQTT
// ============================================================================

/// MQTT broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker host
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    /// Broker port
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    /// Client id, random when not given
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Keep-alive interval
    #[serde(with = "humantime_serde", default = "default_keep_alive")]
    pub keep_alive: Duration,
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    DEFAULT_MQTT_PORT
}

fn default_client_id() -> String {
    format!("pinlink-{}", uuid::Uuid::new_v4().simple())
}

fn default_keep_alive() -> Duration {
    Duration::from_secs(30)
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            client_id: default_client_id(),
            keep_alive: default_keep_alive(),
        }
    }
}
