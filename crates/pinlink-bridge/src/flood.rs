//! Analog flood control
//!
//! Analog pins can report a new reading on every sample, far more often than
//! a bus consumer needs. Two filters sit between analog pin events and the
//! publish call:
//!
//! - [`ToleranceFilter`] drops readings that moved less than the tolerance
//!   since the last published value, except near the ends of the range
//! - [`Aggregator`] buffers readings and publishes one reduced value per pin
//!   on every tick
//!
//! [`FloodController`] chains them; the tolerance filter runs first.

use parking_lot::Mutex;
use pinlink_core::Pin;
use std::collections::HashMap;
use std::time::Duration;
use tracing::trace;

use crate::config::{AggregationStrategy, FloodConfig};

/// Suppresses readings within a tolerance of the last emitted value
#[derive(Debug)]
pub struct ToleranceFilter {
    tolerance: u32,
    max_value: u32,
    last_emitted: HashMap<Pin, u32>,
}

impl ToleranceFilter {
    /// Filter with tolerance `t` over readings in `0..=max_value`
    pub fn new(tolerance: u32, max_value: u32) -> Self {
        Self {
            tolerance,
            max_value,
            last_emitted: HashMap::new(),
        }
    }

    /// Decide whether `value` is emitted
    ///
    /// The first reading per pin is always emitted, as is any reading within
    /// the tolerance of either end of the range. Suppressed readings leave
    /// the last emitted value unchanged.
    pub fn accept(&mut self, pin: Pin, value: u32) -> bool {
        let t = self.tolerance;
        let emit = match self.last_emitted.get(&pin) {
            None => true,
            Some(&last) => {
                value <= t || value >= self.max_value.saturating_sub(t) || value.abs_diff(last) > t
            }
        };
        if emit {
            self.last_emitted.insert(pin, value);
        }
        emit
    }
}

/// Buffers readings per pin and reduces them on each tick
#[derive(Debug)]
pub struct Aggregator {
    strategy: AggregationStrategy,
    buckets: Mutex<HashMap<Pin, Vec<u32>>>,
}

impl Aggregator {
    /// Create an aggregator reducing with `strategy`
    pub fn new(strategy: AggregationStrategy) -> Self {
        Self {
            strategy,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Append a reading to its pin's bucket
    pub fn add(&self, pin: Pin, value: u32) {
        self.buckets.lock().entry(pin).or_default().push(value);
    }

    /// Reduce and clear every non-empty bucket
    ///
    /// Returns one value per pin, ordered by pin.
    pub fn tick(&self) -> Vec<(Pin, u32)> {
        let drained: Vec<(Pin, Vec<u32>)> = self.buckets.lock().drain().collect();
        let mut reduced: Vec<(Pin, u32)> = drained
            .into_iter()
            .filter_map(|(pin, samples)| reduce(self.strategy, &samples).map(|v| (pin, v)))
            .collect();
        reduced.sort_by_key(|(pin, _)| (pin.kind().letter(), pin.number()));
        reduced
    }

    /// Number of readings waiting for the next tick
    pub fn buffered(&self) -> usize {
        self.buckets.lock().values().map(Vec::len).sum()
    }
}

fn reduce(strategy: AggregationStrategy, samples: &[u32]) -> Option<u32> {
    match strategy {
        AggregationStrategy::LastWins => samples.last().copied(),
        AggregationStrategy::Average => {
            if samples.is_empty() {
                return None;
            }
            let sum: u64 = samples.iter().map(|v| u64::from(*v)).sum();
            Some((sum / samples.len() as u64) as u32)
        }
    }
}

/// What happened to an offered reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    /// Publish this value now
    Emit(u32),
    /// Dropped by the tolerance filter
    Suppressed,
    /// Held for the next tick
    Buffered,
}

/// Tolerance filter and aggregator, each optional
#[derive(Debug)]
pub struct FloodController {
    tolerance: Option<Mutex<ToleranceFilter>>,
    aggregator: Option<Aggregator>,
    interval: Option<Duration>,
}

impl FloodController {
    /// Build the filters `config` enables
    pub fn new(config: &FloodConfig) -> Self {
        Self {
            tolerance: config
                .tolerance
                .map(|t| Mutex::new(ToleranceFilter::new(t, config.max_value))),
            aggregator: config
                .aggregation
                .as_ref()
                .map(|a| Aggregator::new(a.strategy)),
            interval: config.aggregation.as_ref().map(|a| a.interval),
        }
    }

    /// Controller that lets everything through
    pub fn passthrough() -> Self {
        Self::new(&FloodConfig::default())
    }

    /// Run an analog reading through the filters
    pub fn offer(&self, pin: Pin, value: u32) -> Offer {
        if let Some(filter) = &self.tolerance {
            if !filter.lock().accept(pin, value) {
                trace!(pin = %pin, value, "Reading within tolerance, suppressed");
                return Offer::Suppressed;
            }
        }
        match &self.aggregator {
            Some(aggregator) => {
                aggregator.add(pin, value);
                Offer::Buffered
            }
            None => Offer::Emit(value),
        }
    }

    /// Reduce buffered readings; empty without an aggregator
    pub fn tick(&self) -> Vec<(Pin, u32)> {
        self.aggregator
            .as_ref()
            .map(Aggregator::tick)
            .unwrap_or_default()
    }

    /// Tick interval, if aggregating
    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }
}
