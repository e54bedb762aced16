use std::{
    collections::HashMap,
    fmt::Display,
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
};

use parking_lot::RwLock;

/// Traffic direction, in the engine's counter-naming convention.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Uplink,
    Downlink,
}

impl Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Uplink => write!(f, "uplink"),
            Direction::Downlink => write!(f, "downlink"),
        }
    }
}

/// The conventional name of an outbound traffic counter.
pub fn traffic_counter_name(tag: &str, direction: Direction) -> String {
    format!("outbound>>>{tag}>>>traffic>>>{direction}")
}

/// The engine's registry of named traffic counters. Engines increment;
/// the controller drains.
#[derive(Default)]
pub struct StatsRegistry {
    counters: RwLock<HashMap<String, Arc<AtomicI64>>>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The counter with the given name, created on first use.
    pub fn counter(&self, name: &str) -> Arc<AtomicI64> {
        if let Some(counter) = self.counters.read().get(name) {
            return counter.clone();
        }
        self.counters
            .write()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    pub fn add(&self, name: &str, delta: i64) {
        self.counter(name).fetch_add(delta, Ordering::Relaxed);
    }

    /// Atomically reads a counter and resets it to zero. A counter that does
    /// not exist reads as 0 and is not created.
    pub fn read_and_reset(&self, name: &str) -> i64 {
        match self.counters.read().get(name) {
            Some(counter) => counter.swap(0, Ordering::AcqRel),
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_name_convention() {
        assert_eq!(
            traffic_counter_name("proxy", Direction::Uplink),
            "outbound>>>proxy>>>traffic>>>uplink"
        );
        assert_eq!(
            traffic_counter_name("proxy", Direction::Downlink),
            "outbound>>>proxy>>>traffic>>>downlink"
        );
    }

    #[test]
    fn read_and_reset_drains() {
        let stats = StatsRegistry::new();
        stats.add("outbound>>>proxy>>>traffic>>>uplink", 100);
        stats.add("outbound>>>proxy>>>traffic>>>uplink", 23);
        assert_eq!(stats.read_and_reset("outbound>>>proxy>>>traffic>>>uplink"), 123);
        assert_eq!(stats.read_and_reset("outbound>>>proxy>>>traffic>>>uplink"), 0);
    }

    #[test]
    fn absent_counter_reads_zero_without_side_effects() {
        let stats = StatsRegistry::new();
        assert_eq!(stats.read_and_reset("outbound>>>nope>>>traffic>>>uplink"), 0);
        assert!(stats.counters.read().is_empty());
    }
}
