//! Per-mapping state, stats and health.
//!
//! Counters on the hot path are lock-free atomics; control fields live
//! behind a `parking_lot` read-write lock. The supervisor and its workers
//! mutate, the orchestrator takes read-lock snapshots.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::worker::WorkerState;

/// Mapping health as reported to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    /// Running with every worker in `running` or `draining` (or cleanly
    /// closed).
    Healthy,
    /// Something is off (worker failed or startup incomplete) but the
    /// mapping has not been declared dead.
    Degraded,
    /// The mapping stopped on a non-recoverable error.
    Failed,
}

impl Health {
    /// The worse of two healths.
    #[must_use]
    pub fn worst(self, other: Self) -> Self {
        use Health::{Degraded, Failed, Healthy};
        match (self, other) {
            (Failed, _) | (_, Failed) => Failed,
            (Degraded, _) | (_, Degraded) => Degraded,
            (Healthy, Healthy) => Healthy,
        }
    }
}

impl std::fmt::Display for Health {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Lock-free counters for one mapping.
#[derive(Debug, Default)]
pub struct MappingStats {
    /// Events durably ingested.
    pub messages_ingested: AtomicU64,
    /// Batches durably ingested.
    pub batches_ingested: AtomicU64,
    /// Payload bytes durably ingested.
    pub bytes_ingested: AtomicU64,
    /// Retry attempts across all workers.
    pub retries: AtomicU64,
    /// Epoch millis of the last durable ingest, zero if never.
    pub last_ingest_at_ms: AtomicI64,
}

impl MappingStats {
    /// Records a durably ingested batch.
    pub fn record_batch(&self, events: u64, bytes: u64) {
        self.messages_ingested.fetch_add(events, Ordering::Relaxed);
        self.batches_ingested.fetch_add(1, Ordering::Relaxed);
        self.bytes_ingested.fetch_add(bytes, Ordering::Relaxed);
        self.last_ingest_at_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Records one retry attempt.
    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Default)]
struct PartitionInfo {
    state: Option<WorkerState>,
    last_sequence: Option<u64>,
    lag_ms: Option<i64>,
}

#[derive(Debug, Default)]
struct MappingInner {
    running: bool,
    started_at: Option<DateTime<Utc>>,
    failure: Option<String>,
    partitions: HashMap<String, PartitionInfo>,
}

/// Mutable per-mapping record shared between supervisor, workers and the
/// orchestrator.
#[derive(Debug)]
pub struct MappingState {
    key: String,
    stats: MappingStats,
    inner: RwLock<MappingInner>,
}

impl MappingState {
    /// Creates the state record for `key`.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            stats: MappingStats::default(),
            inner: RwLock::new(MappingInner::default()),
        }
    }

    /// The mapping key, `hub->db.schema.table`.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The counter block.
    #[must_use]
    pub fn stats(&self) -> &MappingStats {
        &self.stats
    }

    /// Flags the mapping as running; the first call stamps `started_at`.
    pub fn set_running(&self, running: bool) {
        let mut inner = self.inner.write();
        inner.running = running;
        if running && inner.started_at.is_none() {
            inner.started_at = Some(Utc::now());
        }
    }

    /// Publishes a worker's lifecycle state.
    pub fn set_worker_state(&self, partition_id: &str, state: WorkerState) {
        self.inner
            .write()
            .partitions
            .entry(partition_id.to_string())
            .or_default()
            .state = Some(state);
    }

    /// Publishes a worker's progress after a durable ingest.
    pub fn record_partition_progress(&self, partition_id: &str, last_sequence: u64, lag_ms: i64) {
        let mut inner = self.inner.write();
        let info = inner.partitions.entry(partition_id.to_string()).or_default();
        info.last_sequence = Some(last_sequence);
        info.lag_ms = Some(lag_ms);
    }

    /// Marks the mapping terminally failed.
    pub fn mark_failed(&self, reason: impl Into<String>) {
        let mut inner = self.inner.write();
        inner.running = false;
        inner.failure = Some(reason.into());
    }

    /// Current health per the worker-state rules.
    #[must_use]
    pub fn health(&self) -> Health {
        health_of(&self.inner.read())
    }

    /// Point-in-time copy for status output.
    #[must_use]
    pub fn snapshot(&self) -> MappingSnapshot {
        let inner = self.inner.read();
        let messages = self.stats.messages_ingested.load(Ordering::Relaxed);
        let runtime_seconds = inner
            .started_at
            .map(|t| (Utc::now() - t).num_milliseconds() as f64 / 1000.0);
        let messages_per_second = match runtime_seconds {
            Some(secs) if secs > 0.0 => Some(messages as f64 / secs),
            _ => None,
        };
        let last_ingest = self.stats.last_ingest_at_ms.load(Ordering::Relaxed);

        MappingSnapshot {
            mapping: self.key.clone(),
            running: inner.running,
            health: health_of(&inner),
            failure: inner.failure.clone(),
            started_at: inner.started_at,
            messages_ingested: messages,
            batches_ingested: self.stats.batches_ingested.load(Ordering::Relaxed),
            bytes_ingested: self.stats.bytes_ingested.load(Ordering::Relaxed),
            retries: self.stats.retries.load(Ordering::Relaxed),
            last_ingest_at_ms: (last_ingest != 0).then_some(last_ingest),
            runtime_seconds,
            messages_per_second,
            partitions: inner
                .partitions
                .iter()
                .map(|(id, p)| {
                    (
                        id.clone(),
                        PartitionSnapshot {
                            state: p.state,
                            last_sequence: p.last_sequence,
                            lag_ms: p.lag_ms,
                        },
                    )
                })
                .collect(),
        }
    }

}

fn health_of(inner: &MappingInner) -> Health {
    if inner.failure.is_some() {
        return Health::Failed;
    }
    let states: Vec<WorkerState> = inner.partitions.values().filter_map(|p| p.state).collect();
    if states.iter().any(|s| matches!(s, WorkerState::Failed)) {
        return Health::Degraded;
    }
    if states.is_empty() {
        // Nothing spawned yet.
        return Health::Degraded;
    }
    let all_settled = states.iter().all(|s| {
        matches!(
            s,
            WorkerState::Running | WorkerState::Draining | WorkerState::Closed
        )
    });
    if all_settled {
        Health::Healthy
    } else {
        Health::Degraded
    }
}

/// Serializable copy of one mapping's state.
#[derive(Debug, Clone, Serialize)]
pub struct MappingSnapshot {
    /// Mapping key.
    pub mapping: String,
    /// Whether the supervisor considers itself running.
    pub running: bool,
    /// Computed health.
    pub health: Health,
    /// Terminal failure description, if any.
    pub failure: Option<String>,
    /// When the mapping started.
    pub started_at: Option<DateTime<Utc>>,
    /// Events durably ingested.
    pub messages_ingested: u64,
    /// Batches durably ingested.
    pub batches_ingested: u64,
    /// Payload bytes durably ingested.
    pub bytes_ingested: u64,
    /// Retry attempts.
    pub retries: u64,
    /// Epoch millis of the last durable ingest.
    pub last_ingest_at_ms: Option<i64>,
    /// Seconds since start.
    pub runtime_seconds: Option<f64>,
    /// Derived throughput.
    pub messages_per_second: Option<f64>,
    /// Per-partition progress.
    pub partitions: HashMap<String, PartitionSnapshot>,
}

/// Serializable copy of one partition's progress.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PartitionSnapshot {
    /// Worker lifecycle state.
    pub state: Option<WorkerState>,
    /// Last durably ingested sequence.
    pub last_sequence: Option<u64>,
    /// Estimated lag: wall clock minus the enqueued time of the last
    /// ingested event, milliseconds.
    pub lag_ms: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_worst_ordering() {
        assert_eq!(Health::Healthy.worst(Health::Degraded), Health::Degraded);
        assert_eq!(Health::Degraded.worst(Health::Failed), Health::Failed);
        assert_eq!(Health::Healthy.worst(Health::Healthy), Health::Healthy);
    }

    #[test]
    fn test_health_rules() {
        let state = MappingState::new("hub->DB.S.T");
        // No workers yet.
        assert_eq!(state.health(), Health::Degraded);

        state.set_running(true);
        state.set_worker_state("0", WorkerState::Running);
        state.set_worker_state("1", WorkerState::Draining);
        assert_eq!(state.health(), Health::Healthy);

        state.set_worker_state("1", WorkerState::Failed);
        assert_eq!(state.health(), Health::Degraded);

        state.mark_failed("permanent ingest failure");
        assert_eq!(state.health(), Health::Failed);
    }

    #[test]
    fn test_clean_shutdown_stays_healthy() {
        let state = MappingState::new("hub->DB.S.T");
        state.set_running(true);
        state.set_worker_state("0", WorkerState::Running);
        state.set_worker_state("0", WorkerState::Closed);
        state.set_running(false);
        assert_eq!(state.health(), Health::Healthy);
    }

    #[test]
    fn test_snapshot_derives_throughput() {
        let state = MappingState::new("hub->DB.S.T");
        state.set_running(true);
        state.stats().record_batch(100, 4096);

        let snap = state.snapshot();
        assert_eq!(snap.messages_ingested, 100);
        assert_eq!(snap.batches_ingested, 1);
        assert_eq!(snap.bytes_ingested, 4096);
        assert!(snap.last_ingest_at_ms.is_some());
        assert!(snap.runtime_seconds.is_some());
    }

    #[test]
    fn test_partition_progress_recorded() {
        let state = MappingState::new("hub->DB.S.T");
        state.record_partition_progress("0", 42, 150);
        let snap = state.snapshot();
        assert_eq!(snap.partitions["0"].last_sequence, Some(42));
        assert_eq!(snap.partitions["0"].lag_ms, Some(150));
    }

    #[test]
    fn test_retry_counter() {
        let state = MappingState::new("hub->DB.S.T");
        state.stats().record_retry();
        state.stats().record_retry();
        assert_eq!(state.snapshot().retries, 2);
    }
}
