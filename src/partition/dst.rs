//! Deterministic Simulation Testing for partitions
//!
//! Shadow-state harness: a seeded workload drives one partition through
//! appends, commits, reads, crash/reopen cycles and replication to a set
//! of in-process replicas, over a fault-injecting store and transport.
//! The shadow model tracks which records are committed; every observable
//! state is checked against it.
//!
//! ```text
//! for seed in 0..N {
//!     let mut harness = PartitionDSTHarness::new(PartitionDSTConfig::chaos(seed)).await;
//!     harness.run(500).await;
//!     harness.check_invariants().await;   // violations carry the seed
//! }
//! ```
//!
//! Runs are single-threaded and all simulated latencies are zero, so a
//! seed fully determines the fault schedule.

use super::key::Sha1Digest;
use super::partition::{Partition, PartitionOptions};
use super::snapshot::PartitionSnapshot;
use crate::buggify::{self, FaultConfig};
use crate::config::{ReplicationConfig, WriterConfig};
use crate::error::PartitionError;
use crate::io::{Rng, SimulatedRng};
use crate::replication::{
    InMemoryTransport, ReplicaEndpoint, ReplicaId, ReplicaReceiver, ReplicationScheme,
    SimulatedTransport, SimulatedTransportConfig, SimulatedTransportStats, StaticReplicationScheme,
    Transport,
};
use crate::storage::{InMemoryObjectStore, SimulatedObjectStore, SimulatedStoreConfig, SimulatedStoreStats};
use crate::table::{FieldType, Record, Schema, Table, TableConfig};
use futures::TryStreamExt;
use std::sync::Arc;

const STORAGE_PATH: &str = "dst";
const REPLICA_PATH: &str = "replica";

#[derive(Debug, Clone)]
pub struct PartitionDSTConfig {
    pub seed: u64,
    pub store_config: SimulatedStoreConfig,
    pub transport_config: SimulatedTransportConfig,
    /// Remote replicas (ids 2..=replicas+1; the source is replica 1)
    pub replicas: usize,
    pub max_records_per_file: usize,
    pub commit_probability: f64,
    pub read_probability: f64,
    pub replicate_probability: f64,
    pub crash_probability: f64,
    /// Share of appends carrying a schema-incompatible record
    pub invalid_record_probability: f64,
}

impl Default for PartitionDSTConfig {
    fn default() -> Self {
        PartitionDSTConfig {
            seed: 0,
            store_config: deterministic(SimulatedStoreConfig::default()),
            transport_config: deterministic_transport(SimulatedTransportConfig::default()),
            replicas: 3,
            max_records_per_file: 8,
            commit_probability: 0.15,
            read_probability: 0.05,
            replicate_probability: 0.08,
            crash_probability: 0.02,
            invalid_record_probability: 0.05,
        }
    }
}

impl PartitionDSTConfig {
    pub fn new(seed: u64) -> Self {
        PartitionDSTConfig {
            seed,
            ..Default::default()
        }
    }

    /// No faults
    pub fn calm(seed: u64) -> Self {
        PartitionDSTConfig {
            seed,
            store_config: SimulatedStoreConfig::no_faults(),
            transport_config: SimulatedTransportConfig::no_faults(),
            crash_probability: 0.0,
            ..Default::default()
        }
    }

    pub fn moderate(seed: u64) -> Self {
        Self::new(seed)
    }

    /// Aggressive storage and network faults, frequent crashes
    pub fn chaos(seed: u64) -> Self {
        PartitionDSTConfig {
            seed,
            store_config: deterministic(SimulatedStoreConfig::high_chaos()),
            transport_config: deterministic_transport(SimulatedTransportConfig::high_chaos()),
            crash_probability: 0.05,
            ..Default::default()
        }
    }
}

fn deterministic(mut config: SimulatedStoreConfig) -> SimulatedStoreConfig {
    config.latency_range_us = (0, 0);
    config
}

fn deterministic_transport(mut config: SimulatedTransportConfig) -> SimulatedTransportConfig {
    config.delay_range_us = (0, 0);
    config
}

#[derive(Debug, Clone, PartialEq)]
pub enum PartitionOperation {
    Append { time: u64, valid: bool },
    Commit,
    Read,
    Replicate,
    CrashReopen,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OperationOutcome {
    Success,
    /// Expected under fault injection
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct RecordedOperation {
    pub id: u64,
    pub operation: PartitionOperation,
    pub outcome: OperationOutcome,
}

/// Workload generator
pub struct PartitionWorkload {
    rng: SimulatedRng,
    config: PartitionDSTConfig,
    clock: u64,
}

impl PartitionWorkload {
    pub fn new(config: PartitionDSTConfig) -> Self {
        PartitionWorkload {
            rng: SimulatedRng::new(config.seed),
            config,
            clock: 0,
        }
    }

    pub fn next_operation(&mut self) -> PartitionOperation {
        let roll = self.rng.next_u64() as f64 / u64::MAX as f64;
        let c = &self.config;

        let mut threshold = c.crash_probability;
        if roll < threshold {
            return PartitionOperation::CrashReopen;
        }
        threshold += c.replicate_probability;
        if roll < threshold {
            return PartitionOperation::Replicate;
        }
        threshold += c.read_probability;
        if roll < threshold {
            return PartitionOperation::Read;
        }
        threshold += c.commit_probability;
        if roll < threshold {
            return PartitionOperation::Commit;
        }

        self.clock += self.rng.gen_range(1, 1_000);
        let valid = !self.rng.gen_bool(self.config.invalid_record_probability);
        PartitionOperation::Append {
            time: self.clock,
            valid,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PartitionDSTResult {
    pub seed: u64,
    pub total_operations: u64,
    pub successful_operations: u64,
    pub failed_operations: u64,
    pub commits: u64,
    pub crashes: u64,
    pub replications: u64,
    pub records_committed: u64,
    pub store_stats: SimulatedStoreStats,
    pub transport_stats: SimulatedTransportStats,
    pub invariant_violations: Vec<String>,
    pub history: Vec<RecordedOperation>,
}

impl PartitionDSTResult {
    pub fn new(seed: u64) -> Self {
        PartitionDSTResult {
            seed,
            total_operations: 0,
            successful_operations: 0,
            failed_operations: 0,
            commits: 0,
            crashes: 0,
            replications: 0,
            records_committed: 0,
            store_stats: SimulatedStoreStats::default(),
            transport_stats: SimulatedTransportStats::default(),
            invariant_violations: Vec::new(),
            history: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.invariant_violations.is_empty()
    }

    fn violation(&mut self, message: String) {
        self.invariant_violations
            .push(format!("[seed {}] {}", self.seed, message));
    }

    pub fn summary(&self) -> String {
        format!(
            "Seed {}: {} ops ({} ok, {} failed), {} commits, {} records, {} crashes, {} replications, {} violations",
            self.seed,
            self.total_operations,
            self.successful_operations,
            self.failed_operations,
            self.commits,
            self.records_committed,
            self.crashes,
            self.replications,
            self.invariant_violations.len()
        )
    }
}

type DSTStore = SimulatedObjectStore<InMemoryObjectStore, SimulatedRng>;
type DSTTransport = SimulatedTransport<InMemoryTransport, SimulatedRng>;

pub struct PartitionDSTHarness {
    config: PartitionDSTConfig,
    store: DSTStore,
    table: Arc<Table>,
    hash: Sha1Digest,
    options: PartitionOptions,
    partition: Option<Partition<DSTStore>>,
    transport: Arc<DSTTransport>,
    scheme: Arc<dyn ReplicationScheme>,
    receivers: Vec<Arc<ReplicaReceiver<InMemoryObjectStore>>>,
    workload: PartitionWorkload,
    result: PartitionDSTResult,
    /// Shadow state: committed records in commit order
    committed: Vec<Record>,
    /// Shadow state: records in the writer buffer
    buffered: Vec<Record>,
    last_head: Option<Arc<PartitionSnapshot>>,
}

impl PartitionDSTHarness {
    pub async fn new(config: PartitionDSTConfig) -> Self {
        buggify::set_config(FaultConfig::new());
        let store = SimulatedObjectStore::new(
            InMemoryObjectStore::new(),
            SimulatedRng::new(config.seed.wrapping_add(1)),
            config.store_config.clone(),
        );
        let transport = Arc::new(SimulatedTransport::new(
            InMemoryTransport::new(),
            SimulatedRng::new(config.seed.wrapping_add(2)),
            config.transport_config.clone(),
        ));

        let mut endpoints = vec![ReplicaEndpoint::new(1, "local")];
        let mut receivers = Vec::with_capacity(config.replicas);
        for i in 0..config.replicas as u64 {
            let id = ReplicaId::new(i + 2);
            let receiver = Arc::new(ReplicaReceiver::new(id, InMemoryObjectStore::new(), REPLICA_PATH));
            transport.inner().register(id, receiver.clone());
            receivers.push(receiver);
            endpoints.push(ReplicaEndpoint::new(id.0, format!("replica-{}", id)));
        }
        let scheme: Arc<dyn ReplicationScheme> =
            Arc::new(StaticReplicationScheme::with_majority(endpoints));

        let table = Arc::new(Table::new(
            "dst",
            "metrics",
            Schema::new(1).required_field("v", FieldType::Int),
            TableConfig::default(),
        ));
        let options = PartitionOptions {
            writer: WriterConfig {
                max_records_per_file: config.max_records_per_file,
                ..Default::default()
            },
            replication: ReplicationConfig {
                local_replica_id: Some(ReplicaId::new(1)),
                request_timeout_ms: 1_000,
                max_files_per_cycle: 0,
            },
            verify_on_reopen: false,
        };

        let mut harness = PartitionDSTHarness {
            workload: PartitionWorkload::new(config.clone()),
            result: PartitionDSTResult::new(config.seed),
            hash: Sha1Digest::of(&config.seed.to_be_bytes()),
            config,
            store,
            table,
            options,
            partition: None,
            transport,
            scheme,
            receivers,
            committed: Vec::new(),
            buffered: Vec::new(),
            last_head: None,
        };

        let created = {
            let _quiet = crate::suppress_buggify!();
            Partition::create(
                harness.store.clone(),
                harness.table.clone(),
                harness.hash,
                STORAGE_PATH,
                harness.options.clone(),
            )
            .await
        };
        match created {
            Ok(p) => {
                harness.last_head = Some(p.get_snapshot());
                harness.partition = Some(p);
            }
            Err(e) => harness.result.violation(format!("create failed without faults: {}", e)),
        }
        harness
    }

    pub async fn run(&mut self, operations: usize) {
        for _ in 0..operations {
            let op = self.workload.next_operation();
            self.execute(op).await;
        }
    }

    async fn execute(&mut self, op: PartitionOperation) {
        self.result.total_operations += 1;
        let outcome = match &op {
            PartitionOperation::Append { time, valid } => self.execute_append(*time, *valid).await,
            PartitionOperation::Commit => self.execute_commit().await,
            PartitionOperation::Read => self.execute_read().await,
            PartitionOperation::Replicate => self.execute_replicate().await,
            PartitionOperation::CrashReopen => self.execute_crash_reopen().await,
        };

        match outcome {
            OperationOutcome::Success => self.result.successful_operations += 1,
            OperationOutcome::Failed(_) => self.result.failed_operations += 1,
        }
        self.check_head();
        self.result.history.push(RecordedOperation {
            id: self.result.total_operations,
            operation: op,
            outcome,
        });
    }

    async fn execute_append(&mut self, time: u64, valid: bool) -> OperationOutcome {
        let Some(partition) = &self.partition else {
            return OperationOutcome::Failed("no partition".into());
        };
        let writer = match partition.get_writer().await {
            Ok(w) => w,
            Err(e) => return OperationOutcome::Failed(e.to_string()),
        };

        let record = if valid {
            Record::new(time).with("v", time as i64)
        } else {
            Record::new(time).with("v", "not an int")
        };
        match (writer.append(record.clone()), valid) {
            (Ok(()), true) => {
                self.buffered.push(record);
                OperationOutcome::Success
            }
            (Err(PartitionError::SchemaMismatch { .. }), false) => {
                OperationOutcome::Failed("schema mismatch".into())
            }
            (result, _) => {
                self.result.violation(format!("append(valid={}) returned {:?}", valid, result));
                OperationOutcome::Failed("unexpected append result".into())
            }
        }
    }

    async fn execute_commit(&mut self) -> OperationOutcome {
        let Some(partition) = &self.partition else {
            return OperationOutcome::Failed("no partition".into());
        };
        let writer = match partition.get_writer().await {
            Ok(w) => w,
            Err(e) => return OperationOutcome::Failed(e.to_string()),
        };
        let before = partition.get_snapshot();

        match writer.commit().await {
            Ok(snapshot) => {
                self.result.commits += 1;
                self.committed.append(&mut self.buffered);
                self.result.records_committed = self.committed.len() as u64;
                if snapshot.record_count() != self.committed.len() as u64 {
                    self.result.violation(format!(
                        "head holds {} records, model {}",
                        snapshot.record_count(),
                        self.committed.len()
                    ));
                }
                OperationOutcome::Success
            }
            Err(e @ PartitionError::CommitIo(_)) => {
                let after = partition.get_snapshot();
                if !Arc::ptr_eq(&before, &after) {
                    self.result.violation(format!("failed commit moved the head: {}", e));
                }
                if writer.buffered_len() != self.buffered.len() {
                    self.result.violation(format!(
                        "failed commit left {} buffered, model {}",
                        writer.buffered_len(),
                        self.buffered.len()
                    ));
                }
                OperationOutcome::Failed(e.to_string())
            }
            Err(e) => {
                self.result.violation(format!("commit returned unexpected error: {}", e));
                OperationOutcome::Failed(e.to_string())
            }
        }
    }

    async fn execute_read(&mut self) -> OperationOutcome {
        let Some(partition) = &self.partition else {
            return OperationOutcome::Failed("no partition".into());
        };
        let reader = partition.get_reader();
        let expected = self.committed.clone();
        match reader.scan().try_collect::<Vec<Record>>().await {
            Ok(records) => {
                if records != expected {
                    self.result.violation(format!(
                        "scan returned {} records, model has {}",
                        records.len(),
                        expected.len()
                    ));
                }
                OperationOutcome::Success
            }
            // Injected read faults surface as ReadIo or as checksum failures
            Err(e) => OperationOutcome::Failed(e.to_string()),
        }
    }

    async fn execute_replicate(&mut self) -> OperationOutcome {
        let Some(partition) = &self.partition else {
            return OperationOutcome::Failed("no partition".into());
        };
        self.result.replications += 1;
        let transport: Arc<dyn Transport> = self.transport.clone();
        let strategy = partition.get_replication_strategy(self.scheme.clone(), transport);

        let report = match strategy.replicate().await {
            Ok(report) => report,
            Err(e) => {
                self.result.violation(format!("static scheme rejected: {}", e));
                return OperationOutcome::Failed(e.to_string());
            }
        };

        let last = report.last_file_id;
        for outcome in &report.outcomes {
            if outcome.is_acked() && outcome.watermark != last {
                self.result.violation(format!(
                    "replica {} acked with watermark {:?}, head ends at {:?}",
                    outcome.replica, outcome.watermark, last
                ));
            }
        }
        for receiver in &self.receivers {
            let held = receiver.watermark(partition.key()).await;
            if held > last {
                self.result.violation(format!(
                    "replica {} holds file {:?} beyond head {:?}",
                    receiver.id(),
                    held,
                    last
                ));
            }
        }

        if report.failures().next().is_some() {
            OperationOutcome::Failed(format!("{} replicas failed", report.failures().count()))
        } else {
            OperationOutcome::Success
        }
    }

    async fn execute_crash_reopen(&mut self) -> OperationOutcome {
        self.result.crashes += 1;
        // Buffered records die with the process
        self.partition = None;
        self.buffered.clear();

        for _ in 0..3 {
            if let Ok(p) = self.reopen().await {
                self.partition = Some(p);
                return self.check_reopened();
            }
        }

        let retried = {
            let _quiet = crate::suppress_buggify!();
            self.reopen().await
        };
        match retried {
            Ok(p) => {
                self.partition = Some(p);
                self.check_reopened()
            }
            Err(e) => {
                self.result.violation(format!("reopen failed without faults: {}", e));
                OperationOutcome::Failed(e.to_string())
            }
        }
    }

    async fn reopen(&self) -> crate::error::Result<Partition<DSTStore>> {
        Partition::reopen(
            self.store.clone(),
            self.table.clone(),
            self.hash,
            STORAGE_PATH,
            self.options.clone(),
        )
        .await
    }

    fn check_reopened(&mut self) -> OperationOutcome {
        let Some(partition) = &self.partition else {
            return OperationOutcome::Failed("no partition".into());
        };
        let head = partition.get_snapshot();
        if let Some(last) = &self.last_head {
            if head.manifest() != last.manifest() {
                self.result.violation(format!(
                    "reopen produced sequence {}, expected {}",
                    head.sequence(),
                    last.sequence()
                ));
            }
        }
        OperationOutcome::Success
    }

    /// Append-only growth and monotonic sequence across every observed head
    fn check_head(&mut self) {
        let Some(partition) = &self.partition else {
            return;
        };
        let head = partition.get_snapshot();
        if let Some(last) = &self.last_head {
            if head.sequence() < last.sequence() {
                self.result.violation(format!(
                    "head sequence went backwards: {} -> {}",
                    last.sequence(),
                    head.sequence()
                ));
            }
            if !head.is_superset_of(last) {
                self.result.violation(format!(
                    "head {} dropped files of head {}",
                    head.sequence(),
                    last.sequence()
                ));
            }
        }
        self.last_head = Some(head);
    }

    /// Final checks, run with faults suppressed: flush, fully replicate, and
    /// compare every replica with the model
    pub async fn check_invariants(&mut self) {
        let _quiet = crate::suppress_buggify!();

        if self.partition.is_none() {
            self.execute_crash_reopen().await;
        }
        if !self.buffered.is_empty() {
            self.execute_commit().await;
        }
        if let Some(partition) = &self.partition {
            let transport: Arc<dyn Transport> = self.transport.clone();
            let strategy = partition.get_replication_strategy(self.scheme.clone(), transport);
            match strategy.replicate().await {
                Ok(report) if report.acked_count() == self.receivers.len() => {}
                Ok(report) => {
                    let failures: Vec<String> =
                        report.failures().map(|(r, e)| format!("{}: {}", r, e)).collect();
                    self.result.violation(format!("final replication incomplete: {:?}", failures));
                }
                Err(e) => self.result.violation(format!("final replication failed: {}", e)),
            }
        }

        self.check_replicas().await;
        self.check_durable_state().await;

        self.result.store_stats = self.store.stats();
        self.result.transport_stats = self.transport.stats();
    }

    async fn check_replicas(&mut self) {
        if self.committed.is_empty() {
            // A replica that never received a file has no partition on disk
            return;
        }
        for receiver in self.receivers.clone() {
            let reopened = Partition::reopen(
                receiver.store().clone(),
                self.table.clone(),
                self.hash,
                REPLICA_PATH,
                PartitionOptions {
                    verify_on_reopen: true,
                    ..Default::default()
                },
            )
            .await;

            match reopened {
                Ok(replica) => match replica.get_reader().collect_all().await {
                    Ok(records) if records == self.committed => {}
                    Ok(records) => self.result.violation(format!(
                        "replica {} has {} records, model {}",
                        receiver.id(),
                        records.len(),
                        self.committed.len()
                    )),
                    Err(e) => self.result.violation(format!("replica {} unreadable: {}", receiver.id(), e)),
                },
                Err(e) => self.result.violation(format!("replica {} cannot reopen: {}", receiver.id(), e)),
            }
        }
    }

    async fn check_durable_state(&mut self) {
        match self.reopen().await {
            Ok(p) => match p.get_reader().collect_all().await {
                Ok(records) if records == self.committed => {}
                Ok(records) => self.result.violation(format!(
                    "durable state has {} records, model {}",
                    records.len(),
                    self.committed.len()
                )),
                Err(e) => self.result.violation(format!("durable state unreadable: {}", e)),
            },
            Err(e) => self.result.violation(format!("durable state cannot reopen: {}", e)),
        }
    }

    pub fn result(&self) -> &PartitionDSTResult {
        &self.result
    }

    pub fn into_result(self) -> PartitionDSTResult {
        self.result
    }
}

/// Run a batch of DST tests with different seeds
pub async fn run_dst_batch(
    base_seed: u64,
    count: usize,
    ops_per_run: usize,
    config_fn: impl Fn(u64) -> PartitionDSTConfig,
) -> Vec<PartitionDSTResult> {
    let mut results = Vec::with_capacity(count);
    for i in 0..count {
        let config = config_fn(base_seed + i as u64);
        let mut harness = PartitionDSTHarness::new(config).await;
        harness.run(ops_per_run).await;
        harness.check_invariants().await;
        results.push(harness.into_result());
    }
    results
}

/// Summary of batch results
pub fn summarize_batch(results: &[PartitionDSTResult]) -> String {
    let total = results.len();
    let passed = results.iter().filter(|r| r.is_success()).count();
    let failed_seeds: Vec<u64> = results
        .iter()
        .filter(|r| !r.is_success())
        .map(|r| r.seed)
        .collect();

    let total_ops: u64 = results.iter().map(|r| r.total_operations).sum();
    let total_commits: u64 = results.iter().map(|r| r.commits).sum();
    let total_crashes: u64 = results.iter().map(|r| r.crashes).sum();

    let mut summary = format!(
        "Batch: {}/{} passed, {} total ops, {} commits, {} crashes",
        passed, total, total_ops, total_commits, total_crashes
    );
    if !failed_seeds.is_empty() {
        summary.push_str(&format!("\nFailed seeds: {:?}", failed_seeds));
    }
    summary
}
