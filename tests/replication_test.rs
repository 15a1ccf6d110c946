//! Replication integration tests
//!
//! A source partition pushes to in-process replicas over an in-memory
//! transport. The simulated transport wrapper lets a test cut a single
//! replica off, drop acknowledgments, or heal the network between cycles.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tsdb_partition::buggify::{self, FaultConfig};
use tsdb_partition::io::SimulatedRng;
use tsdb_partition::replication::{
    ReplicaStatus, SimulatedTransport, SimulatedTransportConfig, WatermarkTable,
};
use tsdb_partition::{
    FieldType, HashRingReplicationScheme, InMemoryObjectStore, InMemoryTransport,
    LeaderFollowerScheme, ObjectStore, Partition, PartitionError, PartitionOptions, Record,
    ReplicaEndpoint, ReplicaId, ReplicaReceiver, ReplicationScheme, Schema, Sha1Digest,
    StaticReplicationScheme, Table, TableConfig, Transport,
};

const SOURCE_PATH: &str = "source";
const REPLICA_PATH: &str = "replica";
const LOCAL: u64 = 1;

type NetTransport = SimulatedTransport<InMemoryTransport, SimulatedRng>;

fn table() -> Arc<Table> {
    Arc::new(Table::new(
        "telemetry",
        "mem",
        Schema::new(1).required_field("bytes", FieldType::UInt),
        TableConfig::default(),
    ))
}

fn hash() -> Sha1Digest {
    Sha1Digest::of(b"replicated")
}

fn options() -> PartitionOptions {
    let mut options = PartitionOptions::default();
    options.writer.max_records_per_file = 5;
    options.replication.local_replica_id = Some(ReplicaId::new(LOCAL));
    options
}

struct Cluster {
    store: InMemoryObjectStore,
    source: Partition<InMemoryObjectStore>,
    transport: Arc<NetTransport>,
    receivers: Vec<Arc<ReplicaReceiver<InMemoryObjectStore>>>,
}

impl Cluster {
    async fn new(replicas: &[u64], partition_options: PartitionOptions) -> Self {
        buggify::set_config(FaultConfig::new());
        let store = InMemoryObjectStore::new();
        let source = Partition::create(store.clone(), table(), hash(), SOURCE_PATH, partition_options)
            .await
            .unwrap();
        let transport = Arc::new(SimulatedTransport::new(
            InMemoryTransport::new(),
            SimulatedRng::new(17),
            SimulatedTransportConfig::no_faults(),
        ));

        let mut receivers = Vec::new();
        for &id in replicas {
            let receiver = Arc::new(ReplicaReceiver::new(
                ReplicaId::new(id),
                InMemoryObjectStore::new(),
                REPLICA_PATH,
            ));
            transport.inner().register(ReplicaId::new(id), receiver.clone());
            receivers.push(receiver);
        }

        Cluster {
            store,
            source,
            transport,
            receivers,
        }
    }

    fn static_scheme(&self) -> Arc<dyn ReplicationScheme> {
        let mut endpoints = vec![ReplicaEndpoint::new(LOCAL, "local")];
        endpoints.extend(
            self.receivers
                .iter()
                .map(|r| ReplicaEndpoint::new(r.id().0, format!("node-{}", r.id()))),
        );
        Arc::new(StaticReplicationScheme::with_majority(endpoints))
    }

    fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    async fn write(&self, times: std::ops::Range<u64>) {
        let writer = self.source.get_writer().await.unwrap();
        writer
            .append_all(times.map(|t| Record::new(t).with("bytes", t * 64)))
            .unwrap();
        writer.commit().await.unwrap();
    }

    fn receiver(&self, id: u64) -> &Arc<ReplicaReceiver<InMemoryObjectStore>> {
        self.receivers
            .iter()
            .find(|r| r.id() == ReplicaId::new(id))
            .unwrap()
    }
}

// =============================================================================
// Happy path
// =============================================================================

#[tokio::test]
async fn test_replicate_is_idempotent() {
    let cluster = Cluster::new(&[2, 3, 4], options()).await;
    cluster.write(0..12).await;
    let strategy = cluster
        .source
        .get_replication_strategy(cluster.static_scheme(), cluster.transport());

    let first = strategy.replicate().await.unwrap();
    assert_eq!(first.acked_count(), 3);
    assert!(first.quorum_reached());
    assert_eq!(first.last_file_id, Some(3));
    for outcome in &first.outcomes {
        assert_eq!(outcome.files_sent, 3);
        assert_eq!(outcome.watermark, Some(3));
    }
    assert!(first.bytes_sent() > 0);

    let second = strategy.replicate().await.unwrap();
    assert_eq!(second.acked_count(), 3);
    assert_eq!(second.bytes_sent(), 0);
    assert_eq!(second.files_sent(), 0);
    for receiver in &cluster.receivers {
        assert_eq!(receiver.stats().applied, 3);
        assert_eq!(receiver.stats().duplicates, 0);
    }
}

#[tokio::test]
async fn test_empty_partition_replicates_nothing() {
    let cluster = Cluster::new(&[2, 3], options()).await;
    let report = cluster
        .source
        .get_replication_strategy(cluster.static_scheme(), cluster.transport())
        .replicate()
        .await
        .unwrap();

    assert_eq!(report.last_file_id, None);
    assert_eq!(report.acked_count(), 2);
    assert_eq!(report.files_sent(), 0);
}

#[tokio::test]
async fn test_incremental_delta() {
    let cluster = Cluster::new(&[2, 3], options()).await;
    let strategy = cluster
        .source
        .get_replication_strategy(cluster.static_scheme(), cluster.transport());

    cluster.write(0..10).await;
    strategy.replicate().await.unwrap();

    cluster.write(10..13).await;
    let report = strategy.replicate().await.unwrap();
    assert_eq!(report.last_file_id, Some(3));
    for outcome in &report.outcomes {
        assert_eq!(outcome.files_sent, 1);
        assert_eq!(outcome.watermark, Some(3));
    }
}

#[tokio::test]
async fn test_replica_reopens_as_partition() {
    let cluster = Cluster::new(&[2], options()).await;
    cluster.write(0..23).await;
    cluster
        .source
        .get_replication_strategy(cluster.static_scheme(), cluster.transport())
        .replicate()
        .await
        .unwrap();

    let replica = Partition::reopen(
        cluster.receiver(2).store().clone(),
        table(),
        hash(),
        REPLICA_PATH,
        PartitionOptions {
            verify_on_reopen: true,
            ..PartitionOptions::default()
        },
    )
    .await
    .unwrap();

    let expected = cluster.source.get_reader().collect_all().await.unwrap();
    assert_eq!(replica.get_reader().collect_all().await.unwrap(), expected);
    assert_eq!(replica.get_snapshot().files().len(), cluster.source.get_snapshot().files().len());
}

// =============================================================================
// Partial failure and quorum
// =============================================================================

#[tokio::test]
async fn test_one_replica_down() {
    let cluster = Cluster::new(&[2, 3, 4], options()).await;
    cluster.write(0..10).await;
    let strategy = cluster
        .source
        .get_replication_strategy(cluster.static_scheme(), cluster.transport());

    cluster.transport.fail_endpoint(ReplicaId::new(3));
    let report = strategy.replicate().await.unwrap();

    // 4 copies, majority 3, local copy counts: 2 remote acks needed
    assert_eq!(report.scheme_quorum, 3);
    assert_eq!(report.required_acks, 2);
    assert!(report.quorum_reached());
    assert!(report.outcome(ReplicaId::new(2)).unwrap().is_acked());
    assert!(report.outcome(ReplicaId::new(4)).unwrap().is_acked());

    let failures: Vec<_> = report.failures().collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, ReplicaId::new(3));
    assert!(matches!(failures[0].1, PartitionError::ReplicationTransport { .. }));
    assert_eq!(failures[0].1.replica(), Some(ReplicaId::new(3)));

    cluster.transport.heal(ReplicaId::new(3));
    let healed = strategy.replicate().await.unwrap();
    assert_eq!(healed.acked_count(), 3);
    assert_eq!(healed.outcome(ReplicaId::new(3)).unwrap().files_sent, 2);
    assert_eq!(healed.outcome(ReplicaId::new(2)).unwrap().files_sent, 0);
}

#[tokio::test]
async fn test_below_quorum_is_reported_not_raised() {
    let cluster = Cluster::new(&[2, 3, 4], options()).await;
    cluster.write(0..3).await;
    cluster.transport.fail_endpoint(ReplicaId::new(2));
    cluster.transport.fail_endpoint(ReplicaId::new(3));

    let report = cluster
        .source
        .get_replication_strategy(cluster.static_scheme(), cluster.transport())
        .replicate()
        .await
        .unwrap();

    assert_eq!(report.acked_count(), 1);
    assert!(report.is_degraded());
    assert_eq!(report.failures().count(), 2);
}

#[tokio::test]
async fn test_lost_acks_are_deduplicated() {
    let cluster = Cluster::new(&[2, 3], options()).await;
    cluster.write(0..15).await;
    let strategy = cluster
        .source
        .get_replication_strategy(cluster.static_scheme(), cluster.transport());

    cluster.transport.set_config(SimulatedTransportConfig {
        ack_loss_prob: 1.0,
        ..SimulatedTransportConfig::no_faults()
    });
    let lossy = strategy.replicate().await.unwrap();
    assert_eq!(lossy.acked_count(), 0);
    for receiver in &cluster.receivers {
        assert_eq!(receiver.stats().applied, 1);
    }

    cluster.transport.set_config(SimulatedTransportConfig::no_faults());
    let report = strategy.replicate().await.unwrap();
    assert_eq!(report.acked_count(), 2);
    for receiver in &cluster.receivers {
        let stats = receiver.stats();
        assert_eq!(stats.applied, 3);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(receiver.watermark(cluster.source.key()).await, Some(3));
    }
}

// =============================================================================
// Progress control
// =============================================================================

#[tokio::test]
async fn test_cancelled_cycle_resumes() {
    let cluster = Cluster::new(&[2, 3], options()).await;
    cluster.write(0..10).await;
    let strategy = cluster
        .source
        .get_replication_strategy(cluster.static_scheme(), cluster.transport());

    let cancel = CancellationToken::new();
    cancel.cancel();
    let cancelled = strategy.replicate_with_cancel(&cancel).await.unwrap();
    for outcome in &cancelled.outcomes {
        assert!(matches!(outcome.status, ReplicaStatus::Cancelled));
        assert_eq!(outcome.files_sent, 0);
    }
    assert!(cancelled.is_degraded());

    let resumed = strategy.replicate().await.unwrap();
    assert_eq!(resumed.acked_count(), 2);
    assert_eq!(resumed.files_sent(), 4);
}

#[tokio::test]
async fn test_bounded_cycles_make_progress() {
    let mut opts = options();
    opts.replication.max_files_per_cycle = 2;
    let cluster = Cluster::new(&[2], opts).await;
    cluster.write(0..25).await;
    let strategy = cluster
        .source
        .get_replication_strategy(cluster.static_scheme(), cluster.transport());

    let mut watermarks = Vec::new();
    loop {
        let report = strategy.replicate().await.unwrap();
        let outcome = report.outcome(ReplicaId::new(2)).unwrap();
        watermarks.push(outcome.watermark);
        if outcome.is_acked() {
            break;
        }
        assert!(matches!(outcome.status, ReplicaStatus::Behind));
    }
    assert_eq!(watermarks, vec![Some(2), Some(4), Some(5)]);
}

// =============================================================================
// Watermark recovery
// =============================================================================

#[tokio::test]
async fn test_watermarks_survive_reopen() {
    let cluster = Cluster::new(&[2, 3], options()).await;
    cluster.write(0..10).await;
    cluster
        .source
        .get_replication_strategy(cluster.static_scheme(), cluster.transport())
        .replicate()
        .await
        .unwrap();

    let reopened = Partition::reopen(cluster.store.clone(), table(), hash(), SOURCE_PATH, options())
        .await
        .unwrap();
    assert_eq!(reopened.watermarks().get(ReplicaId::new(2)), Some(2));

    let report = reopened
        .get_replication_strategy(cluster.static_scheme(), cluster.transport())
        .replicate()
        .await
        .unwrap();
    assert_eq!(report.acked_count(), 2);
    assert_eq!(report.bytes_sent(), 0);
}

#[tokio::test]
async fn test_lost_watermarks_resync_from_replica() {
    let cluster = Cluster::new(&[2], options()).await;
    cluster.write(0..15).await;
    cluster
        .source
        .get_replication_strategy(cluster.static_scheme(), cluster.transport())
        .replicate()
        .await
        .unwrap();

    let watermark_key = cluster.source.layout().watermarks();
    cluster.store.delete(&watermark_key).await.unwrap();
    let loaded = WatermarkTable::load(&cluster.store, &watermark_key).await.unwrap();
    assert!(loaded.snapshot().is_empty());

    let reopened = Partition::reopen(cluster.store.clone(), table(), hash(), SOURCE_PATH, options())
        .await
        .unwrap();
    let report = reopened
        .get_replication_strategy(cluster.static_scheme(), cluster.transport())
        .replicate()
        .await
        .unwrap();

    // File 1 is offered, recognised as a duplicate, and the replica's
    // watermark jumps the source straight to the end
    let outcome = report.outcome(ReplicaId::new(2)).unwrap();
    assert!(outcome.is_acked());
    assert_eq!(outcome.files_sent, 1);
    assert_eq!(outcome.watermark, Some(3));
    assert_eq!(cluster.receiver(2).stats().duplicates, 1);
}

#[tokio::test]
async fn test_rebuilt_replica_gets_full_resync() {
    let cluster = Cluster::new(&[2], options()).await;
    cluster.write(0..10).await;
    let strategy = cluster
        .source
        .get_replication_strategy(cluster.static_scheme(), cluster.transport());
    strategy.replicate().await.unwrap();

    // Replica 2 loses its disk and comes back empty
    let fresh = Arc::new(ReplicaReceiver::new(
        ReplicaId::new(2),
        InMemoryObjectStore::new(),
        REPLICA_PATH,
    ));
    cluster.transport.inner().unregister(ReplicaId::new(2));
    cluster.transport.inner().register(ReplicaId::new(2), fresh.clone());

    cluster.write(10..12).await;
    let report = strategy.replicate().await.unwrap();
    let outcome = report.outcome(ReplicaId::new(2)).unwrap();
    assert!(outcome.is_acked(), "{:?}", outcome.status);
    assert_eq!(outcome.files_sent, 3);
    assert_eq!(fresh.watermark(cluster.source.key()).await, Some(3));
}

// =============================================================================
// Schemes
// =============================================================================

#[tokio::test]
async fn test_unsatisfiable_scheme() {
    let cluster = Cluster::new(&[2], options()).await;
    cluster.write(0..3).await;

    let scheme: Arc<dyn ReplicationScheme> = Arc::new(StaticReplicationScheme::new(
        vec![ReplicaEndpoint::new(LOCAL, "local"), ReplicaEndpoint::new(2, "node-2")],
        3,
    ));
    let err = cluster
        .source
        .get_replication_strategy(scheme, cluster.transport())
        .replicate()
        .await
        .unwrap_err();
    assert!(matches!(err, PartitionError::InvalidReplicationScheme { .. }));

    let follower_driven: Arc<dyn ReplicationScheme> = Arc::new(LeaderFollowerScheme::new(
        ReplicaId::new(2),
        vec![ReplicaEndpoint::new(LOCAL, "local")],
        1,
    ));
    let err = cluster
        .source
        .get_replication_strategy(follower_driven, cluster.transport())
        .replicate()
        .await
        .unwrap_err();
    assert!(matches!(err, PartitionError::InvalidReplicationScheme { .. }));
    assert_eq!(cluster.receiver(2).stats().applied, 0);
}

#[tokio::test]
async fn test_leader_pushes_to_followers() {
    let cluster = Cluster::new(&[2, 3], options()).await;
    cluster.write(0..5).await;

    let scheme: Arc<dyn ReplicationScheme> = Arc::new(LeaderFollowerScheme::new(
        ReplicaId::new(LOCAL),
        vec![ReplicaEndpoint::new(2, "node-2"), ReplicaEndpoint::new(3, "node-3")],
        1,
    ));
    let report = cluster
        .source
        .get_replication_strategy(scheme, cluster.transport())
        .replicate()
        .await
        .unwrap();
    assert_eq!(report.scheme_quorum, 1);
    assert_eq!(report.required_acks, 1);
    assert_eq!(report.acked_count(), 2);
}

#[tokio::test]
async fn test_hash_ring_targets() {
    let cluster = Cluster::new(&[2, 3, 4, 5], options()).await;
    cluster.write(0..5).await;

    let endpoints = (1..=5)
        .map(|id| ReplicaEndpoint::new(id, format!("node-{}", id)))
        .collect();
    let scheme = Arc::new(HashRingReplicationScheme::new(endpoints, 3, 32));
    let mut expected: Vec<ReplicaId> = scheme
        .replicas_for(cluster.source.key())
        .into_iter()
        .map(|e| e.id)
        .filter(|id| *id != ReplicaId::new(LOCAL))
        .collect();
    expected.sort();

    let report = cluster
        .source
        .get_replication_strategy(scheme, cluster.transport())
        .replicate()
        .await
        .unwrap();
    let mut targeted: Vec<ReplicaId> = report.outcomes.iter().map(|o| o.replica).collect();
    targeted.sort();

    assert_eq!(targeted, expected);
    assert_eq!(report.acked_count(), expected.len());
    for receiver in &cluster.receivers {
        let held = receiver.watermark(cluster.source.key()).await;
        if expected.contains(&receiver.id()) {
            assert_eq!(held, Some(1));
        } else {
            assert_eq!(held, None);
        }
    }
}
