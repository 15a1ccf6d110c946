//! Simulated Object Store with Fault Injection
//!
//! DST-compatible wrapper that injects faults using buggify. Faults are
//! drawn from a seeded RNG, so a run is reproducible from its seed.
//! The fault configuration can be swapped at runtime, which lets tests
//! break the store for exactly one operation (e.g. a commit) and heal it.

use crate::buggify::faults::storage as faults;
use crate::io::Rng;
use crate::storage::{ObjectMeta, ObjectStore, StoreFuture};
use parking_lot::Mutex;
use std::io::{Error as IoError, ErrorKind};
use std::sync::Arc;

/// Fault probabilities for the simulated store
#[derive(Debug, Clone)]
pub struct SimulatedStoreConfig {
    /// Probability of PUT operation failure
    pub put_fail_prob: f64,
    /// Probability of GET operation failure
    pub get_fail_prob: f64,
    /// Probability of GET returning corrupted data
    pub get_corrupt_prob: f64,
    /// Probability of operation timeout
    pub timeout_prob: f64,
    /// Probability that a PUT silently persists a truncated object
    pub partial_write_prob: f64,
    /// Probability of DELETE failure
    pub delete_fail_prob: f64,
    /// Probability of RENAME failure
    pub rename_fail_prob: f64,
    /// Simulated latency range in microseconds (min, max)
    pub latency_range_us: (u64, u64),
}

impl Default for SimulatedStoreConfig {
    fn default() -> Self {
        SimulatedStoreConfig {
            put_fail_prob: 0.01,
            get_fail_prob: 0.01,
            get_corrupt_prob: 0.001,
            timeout_prob: 0.005,
            partial_write_prob: 0.005,
            delete_fail_prob: 0.01,
            rename_fail_prob: 0.01,
            latency_range_us: (0, 0),
        }
    }
}

impl SimulatedStoreConfig {
    /// High chaos configuration for stress testing
    pub fn high_chaos() -> Self {
        SimulatedStoreConfig {
            put_fail_prob: 0.05,
            get_fail_prob: 0.05,
            get_corrupt_prob: 0.0,
            timeout_prob: 0.02,
            partial_write_prob: 0.02,
            delete_fail_prob: 0.05,
            rename_fail_prob: 0.05,
            latency_range_us: (0, 200),
        }
    }

    /// No faults - for baseline testing
    pub fn no_faults() -> Self {
        SimulatedStoreConfig {
            put_fail_prob: 0.0,
            get_fail_prob: 0.0,
            get_corrupt_prob: 0.0,
            timeout_prob: 0.0,
            partial_write_prob: 0.0,
            delete_fail_prob: 0.0,
            rename_fail_prob: 0.0,
            latency_range_us: (0, 0),
        }
    }

    /// Every write path fails (put and rename); reads still work
    pub fn writes_fail() -> Self {
        SimulatedStoreConfig {
            put_fail_prob: 1.0,
            rename_fail_prob: 1.0,
            ..Self::no_faults()
        }
    }
}

/// Statistics for fault injection
#[derive(Debug, Clone, Default)]
pub struct SimulatedStoreStats {
    pub put_attempts: u64,
    pub put_failures: u64,
    pub get_attempts: u64,
    pub get_failures: u64,
    pub get_corruptions: u64,
    pub delete_attempts: u64,
    pub delete_failures: u64,
    pub rename_attempts: u64,
    pub rename_failures: u64,
    pub timeouts: u64,
    pub partial_writes: u64,
}

struct SimulatedStoreInner<R: Rng> {
    rng: R,
    config: SimulatedStoreConfig,
    stats: SimulatedStoreStats,
}

/// Simulated object store that wraps another store and injects faults
pub struct SimulatedObjectStore<S: ObjectStore + Clone, R: Rng> {
    inner_store: S,
    state: Arc<Mutex<SimulatedStoreInner<R>>>,
}

impl<S: ObjectStore + Clone, R: Rng> Clone for SimulatedObjectStore<S, R> {
    fn clone(&self) -> Self {
        SimulatedObjectStore {
            inner_store: self.inner_store.clone(),
            state: self.state.clone(),
        }
    }
}

impl<S: ObjectStore + Clone, R: Rng> SimulatedObjectStore<S, R> {
    pub fn new(inner_store: S, rng: R, config: SimulatedStoreConfig) -> Self {
        SimulatedObjectStore {
            inner_store,
            state: Arc::new(Mutex::new(SimulatedStoreInner {
                rng,
                config,
                stats: SimulatedStoreStats::default(),
            })),
        }
    }

    /// The wrapped store (faults bypassed)
    pub fn inner(&self) -> &S {
        &self.inner_store
    }

    /// Replace the fault configuration; shared by all clones
    pub fn set_config(&self, config: SimulatedStoreConfig) {
        self.state.lock().config = config;
    }

    pub fn stats(&self) -> SimulatedStoreStats {
        self.state.lock().stats.clone()
    }

    pub fn reset_stats(&self) {
        self.state.lock().stats = SimulatedStoreStats::default();
    }

    /// Roll for a fault; `prob` selects the probability from the config
    fn roll(&self, fault_id: &str, prob: impl FnOnce(&SimulatedStoreConfig) -> f64) -> bool {
        let mut s = self.state.lock();
        let p = prob(&s.config);
        crate::buggify!(&mut s.rng, fault_id, p)
    }

    fn check_timeout(&self) -> Result<(), IoError> {
        if self.roll(faults::TIMEOUT, |c| c.timeout_prob) {
            self.state.lock().stats.timeouts += 1;
            return Err(IoError::new(ErrorKind::TimedOut, "simulated timeout"));
        }
        Ok(())
    }

    async fn simulate_latency(&self) {
        let latency_us = {
            let mut s = self.state.lock();
            let (min, max) = s.config.latency_range_us;
            if max > min {
                s.rng.gen_range(min, max)
            } else {
                min
            }
        };
        if latency_us > 0 {
            tokio::time::sleep(std::time::Duration::from_micros(latency_us)).await;
        }
    }
}

impl<S: ObjectStore + Clone, R: Rng> ObjectStore for SimulatedObjectStore<S, R> {
    fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.state.lock().stats.put_attempts += 1;
            self.check_timeout()?;

            if self.roll(faults::PUT_FAIL, |c| c.put_fail_prob) {
                self.state.lock().stats.put_failures += 1;
                return Err(IoError::new(ErrorKind::Other, "simulated put failure"));
            }

            let truncated_len = if data.len() > 1
                && self.roll(faults::PARTIAL_WRITE, |c| c.partial_write_prob)
            {
                let mut s = self.state.lock();
                s.stats.partial_writes += 1;
                Some(s.rng.gen_range(1, data.len() as u64) as usize)
            } else {
                None
            };

            self.simulate_latency().await;

            match truncated_len {
                Some(len) => self.inner_store.put(key, &data[..len]).await,
                None => self.inner_store.put(key, data).await,
            }
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<u8>> {
        Box::pin(async move {
            self.state.lock().stats.get_attempts += 1;
            self.check_timeout()?;

            if self.roll(faults::GET_FAIL, |c| c.get_fail_prob) {
                self.state.lock().stats.get_failures += 1;
                return Err(IoError::new(ErrorKind::Other, "simulated get failure"));
            }

            self.simulate_latency().await;
            let mut data = self.inner_store.get(key).await?;

            if !data.is_empty() && self.roll(faults::GET_CORRUPT, |c| c.get_corrupt_prob) {
                let mut s = self.state.lock();
                s.stats.get_corruptions += 1;
                let idx = s.rng.gen_range(0, data.len() as u64) as usize;
                data[idx] ^= 0xFF;
            }

            Ok(data)
        })
    }

    fn exists<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        self.inner_store.exists(key)
    }

    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.state.lock().stats.delete_attempts += 1;
            if self.roll(faults::DELETE_FAIL, |c| c.delete_fail_prob) {
                self.state.lock().stats.delete_failures += 1;
                return Err(IoError::new(ErrorKind::Other, "simulated delete failure"));
            }
            self.inner_store.delete(key).await
        })
    }

    fn list<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<ObjectMeta>> {
        self.inner_store.list(prefix)
    }

    fn rename<'a>(&'a self, from: &'a str, to: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.state.lock().stats.rename_attempts += 1;
            if self.roll(faults::RENAME_FAIL, |c| c.rename_fail_prob) {
                self.state.lock().stats.rename_failures += 1;
                return Err(IoError::new(ErrorKind::Other, "simulated rename failure"));
            }
            self.inner_store.rename(from, to).await
        })
    }

    fn head<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ObjectMeta> {
        self.inner_store.head(key)
    }
}
