//! Fault probability configuration.

use super::faults::{storage, transport, ALL_FAULTS};
use std::collections::HashMap;

/// Per-fault probabilities plus a global switch and multiplier
#[derive(Debug, Clone)]
pub struct FaultConfig {
    /// Master switch; when false nothing fires
    pub enabled: bool,
    /// Scales every probability (explicit and configured)
    pub global_multiplier: f64,
    probabilities: HashMap<String, f64>,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl FaultConfig {
    /// Enabled, with no configured faults. Explicit-probability checks fire.
    pub fn new() -> Self {
        FaultConfig {
            enabled: true,
            global_multiplier: 1.0,
            probabilities: HashMap::new(),
        }
    }

    /// Nothing fires, not even explicit-probability checks
    pub fn disabled() -> Self {
        FaultConfig {
            enabled: false,
            ..Self::new()
        }
    }

    /// Roughly 1% failure on every known fault
    pub fn moderate() -> Self {
        let mut config = Self::new();
        for fault in ALL_FAULTS {
            config.set(fault, 0.01);
        }
        config
    }

    /// Aggressive settings for stress runs
    pub fn chaos() -> Self {
        let mut config = Self::moderate();
        config.set(storage::PUT_FAIL, 0.05);
        config.set(storage::PARTIAL_WRITE, 0.02);
        config.set(storage::RENAME_FAIL, 0.05);
        config.set(transport::DROP, 0.10);
        config.set(transport::TIMEOUT, 0.05);
        config
    }

    pub fn set(&mut self, fault_id: &str, probability: f64) {
        self.probabilities
            .insert(fault_id.to_string(), probability.clamp(0.0, 1.0));
    }

    pub fn with(mut self, fault_id: &str, probability: f64) -> Self {
        self.set(fault_id, probability);
        self
    }

    /// Effective probability for a fault (0.0 when disabled or unknown)
    pub fn get(&self, fault_id: &str) -> f64 {
        if !self.enabled {
            return 0.0;
        }
        let base = self.probabilities.get(fault_id).copied().unwrap_or(0.0);
        (base * self.global_multiplier).clamp(0.0, 1.0)
    }
}
