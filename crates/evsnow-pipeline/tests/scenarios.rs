//! End-to-end pipeline scenarios against the in-memory broker, ingest
//! service and checkpoint store.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use evsnow_connectors::checkpoint::{CheckpointKey, CheckpointStore};
use evsnow_connectors::ingest::IngestClient;
use evsnow_connectors::source::{EventHubSource, StartPosition};
use evsnow_connectors::testing::{
    InMemoryCheckpointStore, InMemoryEventHub, InMemoryIngestClient, ScriptedFailure,
};
use evsnow_pipeline::config::{BatchingConfig, MappingConfig, PipelineConfig, RetryConfig};
use evsnow_pipeline::orchestrator::{ExitStatus, Orchestrator};
use evsnow_pipeline::retry::ExponentialBackoff;
use evsnow_pipeline::stats::Health;
use evsnow_pipeline::supervisor::{MappingRuntime, MappingSupervisor};
use evsnow_pipeline::tracer::{RecordingTracer, Tracer};

fn mapping_config(hub: &str, table: &str, batch_size: usize) -> MappingConfig {
    MappingConfig {
        source_namespace: "ns.servicebus.windows.net".into(),
        source_hub: hub.into(),
        consumer_group: "$Default".into(),
        target_db: "RAW".into(),
        target_schema: "PUBLIC".into(),
        target_table: table.into(),
        pipe_name: format!("{table}_PIPE"),
        max_batch_size: Some(batch_size),
        max_wait_secs: None,
    }
}

fn pipeline_config(max_wait: Duration) -> PipelineConfig {
    PipelineConfig {
        batching: BatchingConfig {
            max_batch_size: 1000,
            max_wait,
        },
        poll_timeout: Duration::from_millis(20),
        ack_timeout: Duration::from_millis(200),
        save_timeout: Duration::from_millis(200),
        drain_deadline: Duration::from_secs(5),
        start_position: StartPosition::Earliest,
        retry: RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        },
        ..PipelineConfig::default()
    }
}

struct TestMapping {
    hub: Arc<InMemoryEventHub>,
    client: Arc<InMemoryIngestClient>,
    store: Arc<InMemoryCheckpointStore>,
    mapping: MappingConfig,
    tracer: Arc<RecordingTracer>,
}

impl TestMapping {
    fn new(hub_name: &str, table: &str, partitions: &[&str], batch_size: usize) -> Self {
        Self {
            hub: Arc::new(InMemoryEventHub::with_partitions(partitions)),
            client: Arc::new(InMemoryIngestClient::new()),
            store: Arc::new(InMemoryCheckpointStore::new()),
            mapping: mapping_config(hub_name, table, batch_size),
            tracer: RecordingTracer::shared(),
        }
    }

    fn supervisor(&self, config: &PipelineConfig) -> MappingSupervisor {
        MappingSupervisor::new(
            self.mapping.clone(),
            config.clone(),
            MappingRuntime {
                source: Arc::clone(&self.hub) as Arc<dyn EventHubSource>,
                client: Arc::clone(&self.client) as Arc<dyn IngestClient>,
                store: Arc::clone(&self.store) as Arc<dyn CheckpointStore>,
                client_id: "evsnow_test".into(),
            },
            Arc::new(ExponentialBackoff::new(config.retry)),
            Arc::clone(&self.tracer) as Arc<dyn Tracer>,
        )
    }

    fn key(&self, partition: &str) -> CheckpointKey {
        CheckpointKey::new(self.mapping.target_identity(), partition)
    }

    fn waterlevel(&self, partition: &str) -> Option<u64> {
        self.store.waterlevel(&self.key(partition))
    }
}

async fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) {
    let started = tokio::time::Instant::now();
    while started.elapsed() < deadline {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within {deadline:?}");
}

/// Scenario 1: one partition, five events, batch size three. The first
/// batch ingests on the size threshold, the remainder on shutdown flush;
/// the checkpoint moves none → 3 → 5.
#[tokio::test]
async fn single_partition_clean_run() {
    let config = pipeline_config(Duration::from_secs(10));
    let tm = TestMapping::new("telemetry", "EVENTS", &["0"], 3);
    tm.hub.push_sequences("0", 1..=5);
    assert_eq!(tm.waterlevel("0"), None);

    let cancel = CancellationToken::new();
    let task = tokio::spawn(tm.supervisor(&config).run(cancel.clone()));

    let (store, key) = (Arc::clone(&tm.store), tm.key("0"));
    wait_until(Duration::from_secs(2), move || {
        store.waterlevel(&key) == Some(3)
    })
    .await;
    assert_eq!(tm.client.service().acked_sequences("0"), vec![1, 2, 3]);

    cancel.cancel();
    task.await.unwrap().unwrap();

    assert_eq!(tm.waterlevel("0"), Some(5));
    assert_eq!(tm.client.service().acked_sequences("0"), vec![1, 2, 3, 4, 5]);
}

/// Scenario 2: two partitions, one hundred events each, both converge to
/// checkpoint 100. No cross-partition ordering is asserted.
#[tokio::test]
async fn multi_partition_fairness() {
    let config = pipeline_config(Duration::from_secs(10));
    let tm = TestMapping::new("telemetry", "EVENTS", &["0", "1"], 10);
    tm.hub.push_sequences("0", 1..=100);
    tm.hub.push_sequences("1", 1..=100);

    let cancel = CancellationToken::new();
    let task = tokio::spawn(tm.supervisor(&config).run(cancel.clone()));

    let (store, k0, k1) = (Arc::clone(&tm.store), tm.key("0"), tm.key("1"));
    wait_until(Duration::from_secs(5), move || {
        store.waterlevel(&k0) == Some(100) && store.waterlevel(&k1) == Some(100)
    })
    .await;

    cancel.cancel();
    task.await.unwrap().unwrap();

    for partition in ["0", "1"] {
        let seqs = tm.client.service().acked_sequences(partition);
        assert_eq!(seqs, (1..=100).collect::<Vec<_>>());
    }
}

/// Scenario 3: the first send fails transiently, the second succeeds.
/// Exactly one retry is recorded and the channel was reopened.
#[tokio::test]
async fn transient_ingest_error_retries_same_batch() {
    let config = pipeline_config(Duration::from_secs(10));
    let tm = TestMapping::new("telemetry", "EVENTS", &["0"], 3);
    tm.hub.push_sequences("0", 1..=3);
    tm.client
        .service()
        .fail_next_sends([ScriptedFailure::Transient("connection reset".into())]);

    let cancel = CancellationToken::new();
    let task = tokio::spawn(tm.supervisor(&config).run(cancel.clone()));

    let (store, key) = (Arc::clone(&tm.store), tm.key("0"));
    wait_until(Duration::from_secs(2), move || {
        store.waterlevel(&key) == Some(3)
    })
    .await;

    cancel.cancel();
    task.await.unwrap().unwrap();

    assert_eq!(tm.client.service().acked_sequences("0"), vec![1, 2, 3]);
    assert_eq!(tm.client.service().send_count(), 2);
    assert_eq!(tm.client.service().invalidate_count(), 1);
    assert_eq!(tm.tracer.counter("retries"), 1);
}

/// Scenario 4: the batch is durably acked but every checkpoint save fails,
/// so the run dies with the checkpoint still absent. The restart resumes
/// from the configured start and re-ingests the same events; duplicates
/// carry identical row ids and checkpoint monotonicity is preserved.
#[tokio::test]
async fn crash_between_ack_and_save_reingests() {
    let config = pipeline_config(Duration::from_secs(10));
    let tm = TestMapping::new("telemetry", "EVENTS", &["0"], 3);
    tm.hub.push_sequences("0", 1..=3);
    // Exactly the retry budget: every save of the first run fails, the
    // restarted run saves cleanly.
    tm.store
        .fail_next_saves((0..3).map(|i| format!("save failure {i}")));

    let cancel = CancellationToken::new();
    let err = tm.supervisor(&config).run(cancel).await.unwrap_err();
    assert!(err.to_string().contains("partition 0"));

    // Acked but never checkpointed: this is where restart duplicates come
    // from.
    assert_eq!(tm.client.service().acked_sequences("0"), vec![1, 2, 3]);
    assert_eq!(tm.waterlevel("0"), None);

    // Restart against the same store and ledger; start=earliest re-reads
    // the partition from the beginning.
    let cancel = CancellationToken::new();
    let task = tokio::spawn(tm.supervisor(&config).run(cancel.clone()));
    let (store, key) = (Arc::clone(&tm.store), tm.key("0"));
    wait_until(Duration::from_secs(2), move || {
        store.waterlevel(&key) == Some(3)
    })
    .await;
    cancel.cancel();
    task.await.unwrap().unwrap();

    let rows = tm.client.service().acked_rows();
    let seqs: Vec<u64> = rows.iter().map(|r| r.sequence_number).collect();
    assert_eq!(seqs, vec![1, 2, 3, 1, 2, 3]);
    // Re-ingest of the same event produces the same row id.
    assert_eq!(rows[0].row_id, rows[3].row_id);
    assert_eq!(rows[2].row_id, rows[5].row_id);
}

/// Scenario 5: two events buffered below the batch threshold are flushed,
/// acked and checkpointed during graceful shutdown.
#[tokio::test]
async fn graceful_shutdown_drains_in_flight() {
    let config = pipeline_config(Duration::from_secs(60));
    let tm = TestMapping::new("telemetry", "EVENTS", &["0"], 10);
    tm.hub.push_sequences("0", 1..=2);

    let cancel = CancellationToken::new();
    let task = tokio::spawn(tm.supervisor(&config).run(cancel.clone()));

    // Give the worker time to pull both events into its assembler; the
    // batch threshold (10) and max-wait (60 s) are far away, so nothing
    // ingests before the cancellation.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(tm.client.service().send_count(), 0);

    cancel.cancel();
    task.await.unwrap().unwrap();

    assert_eq!(tm.waterlevel("0"), Some(2));
    assert_eq!(tm.client.service().acked_sequences("0"), vec![1, 2]);
}

/// Scenario 6: one mapping's ingest client is permanently broken; the
/// other mapping keeps flowing. Health isolates the failure and the exit
/// status is 1.
#[tokio::test]
async fn permanent_error_isolates_mapping() {
    let config = pipeline_config(Duration::from_secs(10));

    let broken = TestMapping::new("telemetry-a", "EVENTS_A", &["0"], 3);
    broken
        .client
        .service()
        .fail_open(ScriptedFailure::Permanent("pipe deleted".into()));

    let healthy = TestMapping::new("telemetry-b", "EVENTS_B", &["0"], 3);
    healthy.hub.push_sequences("0", 1..=3);

    let mut orch = Orchestrator::new(config.clone());
    let sup_a = broken.supervisor(&config);
    let sup_b = healthy.supervisor(&config);
    let state_a = sup_a.state();
    let state_b = sup_b.state();
    orch.add_mapping(sup_a);
    orch.add_mapping(sup_b);

    let shutdown = orch.shutdown_token();
    let status = orch.status();
    let run = tokio::spawn(orch.run());

    let (store, key) = (Arc::clone(&healthy.store), healthy.key("0"));
    wait_until(Duration::from_secs(2), move || {
        store.waterlevel(&key) == Some(3)
    })
    .await;
    let sa = Arc::clone(&state_a);
    wait_until(Duration::from_secs(2), move || sa.health() == Health::Failed).await;
    assert_eq!(state_b.health(), Health::Healthy);
    assert_eq!(status.health(), Health::Failed);

    shutdown.cancel();
    let exit = run.await.unwrap();
    assert_eq!(exit, ExitStatus::MappingFailed);
    assert_eq!(exit.code(), 1);

    // The healthy mapping drained cleanly despite its sibling.
    assert_eq!(healthy.waterlevel("0"), Some(3));
    assert_eq!(state_b.health(), Health::Healthy);
}

/// Restart resumes from `waterlevel + 1`: nothing re-ingests and the
/// per-partition order spans the restart.
#[tokio::test]
async fn restart_resumes_from_checkpoint() {
    let config = pipeline_config(Duration::from_secs(10));
    let tm = TestMapping::new("telemetry", "EVENTS", &["0"], 3);
    tm.hub.push_sequences("0", 1..=3);

    let cancel = CancellationToken::new();
    let task = tokio::spawn(tm.supervisor(&config).run(cancel.clone()));
    let (store, key) = (Arc::clone(&tm.store), tm.key("0"));
    wait_until(Duration::from_secs(2), move || {
        store.waterlevel(&key) == Some(3)
    })
    .await;
    cancel.cancel();
    task.await.unwrap().unwrap();

    // Restart; the seeded checkpoint skips events 1-3 even though the
    // broker replays the partition from the beginning.
    tm.hub.push_sequences("0", 4..=6);
    let cancel = CancellationToken::new();
    let task = tokio::spawn(tm.supervisor(&config).run(cancel.clone()));
    let (store, key) = (Arc::clone(&tm.store), tm.key("0"));
    wait_until(Duration::from_secs(2), move || {
        store.waterlevel(&key) == Some(6)
    })
    .await;
    cancel.cancel();
    task.await.unwrap().unwrap();

    assert_eq!(
        tm.client.service().acked_sequences("0"),
        vec![1, 2, 3, 4, 5, 6]
    );
}

/// Receiving nothing for longer than `max_wait` must not flush: empty
/// flushes are no-ops and the checkpoint never appears.
#[tokio::test]
async fn idle_partition_never_flushes_empty() {
    let config = pipeline_config(Duration::from_millis(50));
    let tm = TestMapping::new("telemetry", "EVENTS", &["0"], 10);

    let cancel = CancellationToken::new();
    let task = tokio::spawn(tm.supervisor(&config).run(cancel.clone()));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(tm.client.service().send_count(), 0);

    cancel.cancel();
    task.await.unwrap().unwrap();
    assert_eq!(tm.waterlevel("0"), None);
}

/// A signal before workers start exits cleanly with no checkpoint rows.
#[tokio::test]
async fn cancellation_during_startup_is_clean() {
    let config = pipeline_config(Duration::from_secs(10));
    let tm = TestMapping::new("telemetry", "EVENTS", &["0"], 3);
    tm.hub.push_sequences("0", 1..=3);

    let mut orch = Orchestrator::new(config.clone());
    orch.add_mapping(tm.supervisor(&config));
    orch.shutdown_token().cancel();

    let exit = orch.run().await;
    assert_eq!(exit, ExitStatus::Clean);
    assert!(tm.store.entries().is_empty());
    assert_eq!(tm.client.service().send_count(), 0);
}
