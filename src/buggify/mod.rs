//! BUGGIFY - Deterministic Fault Injection
//!
//! Every fallible decision point in the simulated storage and transport
//! layers is a potential fault site. Whether a fault fires is decided by
//! a caller-supplied RNG, so a seeded run replays the same faults.
//!
//! # Usage
//!
//! ```ignore
//! // Configured probability for the fault id
//! if buggify!(rng, faults::storage::PUT_FAIL) {
//!     return Err(simulated_error());
//! }
//!
//! // Explicit probability override
//! if buggify!(rng, faults::transport::DROP, 0.10) {
//!     return Err(TransportError::Dropped);
//! }
//! ```
//!
//! Configuration and statistics are thread-local. Tests that rely on
//! fault injection should run on a current-thread runtime or set the
//! config on every worker thread.

pub mod config;
pub mod faults;

pub use config::FaultConfig;
pub use faults::ALL_FAULTS;

use std::cell::RefCell;
use std::collections::HashMap;

/// Statistics tracking for fault injection
#[derive(Debug, Clone, Default)]
pub struct BuggifyStats {
    /// Number of times each fault was checked
    pub checks: HashMap<String, u64>,
    /// Number of times each fault was triggered
    pub triggers: HashMap<String, u64>,
}

impl BuggifyStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_check(&mut self, fault_id: &str) {
        *self.checks.entry(fault_id.to_string()).or_insert(0) += 1;
    }

    pub fn record_trigger(&mut self, fault_id: &str) {
        *self.triggers.entry(fault_id.to_string()).or_insert(0) += 1;
    }

    pub fn trigger_count(&self, fault_id: &str) -> u64 {
        self.triggers.get(fault_id).copied().unwrap_or(0)
    }

    pub fn trigger_rate(&self, fault_id: &str) -> f64 {
        let checks = self.checks.get(fault_id).copied().unwrap_or(0);
        if checks == 0 {
            0.0
        } else {
            self.trigger_count(fault_id) as f64 / checks as f64
        }
    }

    pub fn summary(&self) -> String {
        let mut sorted_faults: Vec<_> = self.checks.keys().collect();
        sorted_faults.sort();

        let mut lines = vec!["BUGGIFY Statistics:".to_string()];
        for fault_id in sorted_faults {
            let checks = self.checks.get(fault_id).copied().unwrap_or(0);
            lines.push(format!(
                "  {}: {}/{} ({:.2}%)",
                fault_id,
                self.trigger_count(fault_id),
                checks,
                self.trigger_rate(fault_id) * 100.0
            ));
        }
        lines.join("\n")
    }
}

thread_local! {
    static BUGGIFY_CONTEXT: RefCell<BuggifyContext> = RefCell::new(BuggifyContext::default());
}

/// Per-thread buggify context
#[derive(Debug, Default)]
pub struct BuggifyContext {
    pub config: FaultConfig,
    pub stats: BuggifyStats,
    /// When true, all buggify calls return false (for critical sections)
    pub suppressed: bool,
}

/// Set the buggify configuration for the current thread
pub fn set_config(config: FaultConfig) {
    BUGGIFY_CONTEXT.with(|ctx| {
        ctx.borrow_mut().config = config;
    });
}

/// Get current buggify stats for the thread
pub fn get_stats() -> BuggifyStats {
    BUGGIFY_CONTEXT.with(|ctx| ctx.borrow().stats.clone())
}

/// Reset stats for the current thread
pub fn reset_stats() {
    BUGGIFY_CONTEXT.with(|ctx| {
        ctx.borrow_mut().stats = BuggifyStats::new();
    });
}

/// Suppresses buggify on this thread until dropped
pub struct BuggifySuppressor {
    previous: bool,
}

impl BuggifySuppressor {
    pub fn new() -> Self {
        let previous = BUGGIFY_CONTEXT.with(|ctx| {
            let mut ctx = ctx.borrow_mut();
            std::mem::replace(&mut ctx.suppressed, true)
        });
        BuggifySuppressor { previous }
    }
}

impl Default for BuggifySuppressor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BuggifySuppressor {
    fn drop(&mut self) {
        let previous = self.previous;
        BUGGIFY_CONTEXT.with(|ctx| {
            ctx.borrow_mut().suppressed = previous;
        });
    }
}

fn roll<R: crate::io::Rng>(rng: &mut R, probability: f64) -> bool {
    let random_value = rng.gen_range(0, 1_000_000) as f64 / 1_000_000.0;
    random_value < probability.clamp(0.0, 1.0)
}

/// Core buggify check - uses the configured probability for `fault_id`
#[inline]
pub fn should_buggify<R: crate::io::Rng>(rng: &mut R, fault_id: &str) -> bool {
    BUGGIFY_CONTEXT.with(|ctx| {
        let mut ctx = ctx.borrow_mut();
        ctx.stats.record_check(fault_id);

        if ctx.suppressed {
            return false;
        }

        let prob = ctx.config.get(fault_id);
        if prob <= 0.0 {
            return false;
        }

        let triggered = roll(rng, prob);
        if triggered {
            ctx.stats.record_trigger(fault_id);
        }
        triggered
    })
}

/// Buggify check with an explicit probability (still honours `enabled`)
#[inline]
pub fn should_buggify_with_prob<R: crate::io::Rng>(
    rng: &mut R,
    fault_id: &str,
    probability: f64,
) -> bool {
    BUGGIFY_CONTEXT.with(|ctx| {
        let mut ctx = ctx.borrow_mut();
        ctx.stats.record_check(fault_id);

        if ctx.suppressed || !ctx.config.enabled || probability <= 0.0 {
            return false;
        }

        let triggered = roll(rng, probability * ctx.config.global_multiplier);
        if triggered {
            ctx.stats.record_trigger(fault_id);
        }
        triggered
    })
}

/// BUGGIFY macro - the main interface for fault injection
#[macro_export]
macro_rules! buggify {
    ($rng:expr, $fault_id:expr) => {
        $crate::buggify::should_buggify($rng, $fault_id)
    };
    ($rng:expr, $fault_id:expr, $prob:expr) => {
        $crate::buggify::should_buggify_with_prob($rng, $fault_id, $prob)
    };
}

/// Suppress all buggify calls within a scope
#[macro_export]
macro_rules! suppress_buggify {
    () => {
        $crate::buggify::BuggifySuppressor::new()
    };
}
