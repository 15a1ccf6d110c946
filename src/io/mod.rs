//! Randomness Abstraction
//!
//! Every random decision in the crate (fault injection, DST workloads)
//! goes through the `Rng` trait so a simulation run can be replayed
//! exactly from its seed.
//!
//! - `ProductionRng`: thread-local entropy, for real deployments
//! - `SimulatedRng`: seeded ChaCha8, for deterministic simulation

pub mod simulation;

pub use simulation::SimulatedRng;

/// Source of randomness used by fault injection and workload generation
pub trait Rng: Send + 'static {
    /// Next raw 64-bit value
    fn next_u64(&mut self) -> u64;

    /// Returns true with the given probability (clamped to 0.0..=1.0)
    fn gen_bool(&mut self, probability: f64) -> bool;

    /// Uniform value in `min..max` (returns `min` when the range is empty)
    fn gen_range(&mut self, min: u64, max: u64) -> u64;

    /// Shuffle a slice in place
    fn shuffle<T>(&mut self, slice: &mut [T]);
}

/// Non-deterministic RNG backed by `rand::thread_rng`
#[derive(Debug, Default, Clone, Copy)]
pub struct ProductionRng;

impl ProductionRng {
    pub fn new() -> Self {
        ProductionRng
    }
}

impl Rng for ProductionRng {
    fn next_u64(&mut self) -> u64 {
        use rand::RngCore;
        rand::thread_rng().next_u64()
    }

    fn gen_bool(&mut self, probability: f64) -> bool {
        use rand::Rng as _;
        rand::thread_rng().gen_bool(probability.clamp(0.0, 1.0))
    }

    fn gen_range(&mut self, min: u64, max: u64) -> u64 {
        use rand::Rng as _;
        if min >= max {
            return min;
        }
        rand::thread_rng().gen_range(min..max)
    }

    fn shuffle<T>(&mut self, slice: &mut [T]) {
        use rand::seq::SliceRandom;
        slice.shuffle(&mut rand::thread_rng());
    }
}
