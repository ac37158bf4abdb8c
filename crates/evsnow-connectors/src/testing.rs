//! In-memory connector implementations for tests and harnesses.
//!
//! These back the pipeline crate's end-to-end scenarios: a scriptable
//! broker, an ingest service that records durably acked rows, and a
//! checkpoint store with injectable save failures.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::checkpoint::{
    CheckpointEntry, CheckpointKey, CheckpointMetadata, CheckpointStore, TargetIdentity,
};
use crate::error::ConnectorError;
use crate::event::{Event, PropertyMap};
use crate::ingest::{AckToken, IngestChannel, IngestClient, IngestRow};
use crate::source::{EventHubSource, PartitionReceiver, StartPosition};

/// Builds a minimal event for tests: JSON body carrying the sequence.
#[must_use]
pub fn test_event(partition_id: &str, sequence_number: u64) -> Event {
    Event {
        body: format!("{{\"seq\":{sequence_number}}}").into_bytes(),
        partition_id: partition_id.to_string(),
        sequence_number,
        offset: (sequence_number * 100).to_string(),
        enqueued_time: Utc::now(),
        properties: PropertyMap::new(),
        system_properties: PropertyMap::new(),
    }
}

/// A failure to inject into a scripted connector call.
#[derive(Debug, Clone)]
pub enum ScriptedFailure {
    /// Surfaces as [`ConnectorError::TransientNetwork`].
    Transient(String),
    /// Surfaces as [`ConnectorError::PermanentIngest`].
    Permanent(String),
}

impl ScriptedFailure {
    fn to_error(&self) -> ConnectorError {
        match self {
            Self::Transient(msg) => ConnectorError::TransientNetwork(msg.clone()),
            Self::Permanent(msg) => ConnectorError::PermanentIngest(msg.clone()),
        }
    }
}

// ── In-memory broker ────────────────────────────────────────────────

/// Scriptable in-memory event hub.
///
/// Events can be seeded before the pipeline starts or pushed while it
/// runs; receivers observe both.
#[derive(Default)]
pub struct InMemoryEventHub {
    partitions: Mutex<HashMap<String, Arc<Mutex<Vec<Event>>>>>,
    notifiers: Mutex<HashMap<String, Arc<Notify>>>,
}

impl InMemoryEventHub {
    /// Creates a hub with the given partition ids, all empty.
    #[must_use]
    pub fn with_partitions(ids: &[&str]) -> Self {
        let hub = Self::default();
        {
            let mut partitions = hub.partitions.lock();
            let mut notifiers = hub.notifiers.lock();
            for id in ids {
                partitions.insert((*id).to_string(), Arc::new(Mutex::new(Vec::new())));
                notifiers.insert((*id).to_string(), Arc::new(Notify::new()));
            }
        }
        hub
    }

    /// Appends an event to its partition's log, waking any receiver.
    ///
    /// # Panics
    ///
    /// Panics if the partition was not declared at construction.
    pub fn push(&self, event: Event) {
        let log = self
            .partitions
            .lock()
            .get(&event.partition_id)
            .cloned()
            .expect("unknown partition in test hub");
        log.lock().push(event.clone());
        if let Some(n) = self.notifiers.lock().get(&event.partition_id) {
            n.notify_waiters();
        }
    }

    /// Pushes `sequences` as test events onto `partition_id`.
    pub fn push_sequences(&self, partition_id: &str, sequences: impl IntoIterator<Item = u64>) {
        for seq in sequences {
            self.push(test_event(partition_id, seq));
        }
    }
}

struct InMemoryReceiver {
    log: Arc<Mutex<Vec<Event>>>,
    notify: Arc<Notify>,
    cursor: usize,
    min_exclusive: Option<u64>,
    closed: bool,
}

impl InMemoryReceiver {
    fn drain(&mut self, max_events: usize) -> Vec<Event> {
        let log = self.log.lock();
        let mut out = Vec::new();
        while self.cursor < log.len() && out.len() < max_events {
            let ev = &log[self.cursor];
            self.cursor += 1;
            if let Some(min) = self.min_exclusive {
                if ev.sequence_number <= min {
                    continue;
                }
            }
            out.push(ev.clone());
        }
        out
    }
}

#[async_trait]
impl PartitionReceiver for InMemoryReceiver {
    async fn recv_batch(
        &mut self,
        max_events: usize,
        max_wait: Duration,
    ) -> Result<Vec<Event>, ConnectorError> {
        if self.closed {
            return Ok(Vec::new());
        }
        let drained = self.drain(max_events);
        if !drained.is_empty() {
            return Ok(drained);
        }
        let notified = self.notify.notified();
        let _ = tokio::time::timeout(max_wait, notified).await;
        Ok(self.drain(max_events))
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}

#[async_trait]
impl EventHubSource for InMemoryEventHub {
    async fn partition_ids(&self) -> Result<Vec<String>, ConnectorError> {
        let mut ids: Vec<String> = self.partitions.lock().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn open_receiver(
        &self,
        partition_id: &str,
        position: StartPosition,
        _prefetch: usize,
    ) -> Result<Box<dyn PartitionReceiver>, ConnectorError> {
        let log = self
            .partitions
            .lock()
            .get(partition_id)
            .cloned()
            .ok_or_else(|| {
                ConnectorError::Configuration(format!("unknown partition '{partition_id}'"))
            })?;
        let notify = self
            .notifiers
            .lock()
            .get(partition_id)
            .cloned()
            .unwrap_or_default();

        let (cursor, min_exclusive) = match position {
            StartPosition::Earliest => (0, None),
            StartPosition::Latest => (log.lock().len(), None),
            StartPosition::After(seq) => (0, Some(seq)),
        };

        Ok(Box::new(InMemoryReceiver {
            log,
            notify,
            cursor,
            min_exclusive,
            closed: false,
        }))
    }
}

// ── In-memory ingest service ────────────────────────────────────────

#[derive(Default)]
struct IngestLedger {
    /// Rows in durable order, across all channels.
    rows: Vec<IngestRow>,
    /// Committed offset token per channel name.
    committed: HashMap<String, u64>,
}

/// Shared state of an [`InMemoryIngestClient`] and its channels.
#[derive(Default)]
pub struct IngestService {
    ledger: Mutex<IngestLedger>,
    fail_sends: Mutex<VecDeque<ScriptedFailure>>,
    fail_open: Mutex<Option<ScriptedFailure>>,
    hold_acks: AtomicBool,
    send_count: AtomicU64,
    open_count: AtomicU64,
    invalidate_count: AtomicU64,
}

impl IngestService {
    /// Queues failures returned by the next `send` calls, in order.
    pub fn fail_next_sends(&self, failures: impl IntoIterator<Item = ScriptedFailure>) {
        self.fail_sends.lock().extend(failures);
    }

    /// Makes every `open` fail with `failure` until cleared.
    pub fn fail_open(&self, failure: ScriptedFailure) {
        *self.fail_open.lock() = Some(failure);
    }

    /// When set, `wait_for_durable` times out instead of acking.
    pub fn hold_acks(&self, hold: bool) {
        self.hold_acks.store(hold, Ordering::SeqCst);
    }

    /// All durably acked rows, in ingest order.
    #[must_use]
    pub fn acked_rows(&self) -> Vec<IngestRow> {
        self.ledger.lock().rows.clone()
    }

    /// Durably acked sequence numbers for one partition, in ingest order.
    #[must_use]
    pub fn acked_sequences(&self, partition_id: &str) -> Vec<u64> {
        self.ledger
            .lock()
            .rows
            .iter()
            .filter(|r| r.partition_id == partition_id)
            .map(|r| r.sequence_number)
            .collect()
    }

    /// Number of `send` calls observed (including failed ones).
    #[must_use]
    pub fn send_count(&self) -> u64 {
        self.send_count.load(Ordering::SeqCst)
    }

    /// Number of `open` calls that reached the service.
    #[must_use]
    pub fn open_count(&self) -> u64 {
        self.open_count.load(Ordering::SeqCst)
    }

    /// Number of channel invalidations (transient-retry reopens).
    #[must_use]
    pub fn invalidate_count(&self) -> u64 {
        self.invalidate_count.load(Ordering::SeqCst)
    }
}

struct InMemoryChannel {
    name: String,
    service: Arc<IngestService>,
}

#[async_trait]
impl IngestChannel for InMemoryChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, rows: Vec<IngestRow>) -> Result<AckToken, ConnectorError> {
        self.service.send_count.fetch_add(1, Ordering::SeqCst);
        if let Some(failure) = self.service.fail_sends.lock().pop_front() {
            return Err(failure.to_error());
        }
        let Some(last) = rows.last() else {
            return Err(ConnectorError::Configuration(
                "refusing to send an empty batch".into(),
            ));
        };
        let ack = AckToken::for_sequence(last.sequence_number);

        // Rows only count as durable once the ack is released; a held ack
        // models rows sitting in the server's streaming buffer.
        if !self.service.hold_acks.load(Ordering::SeqCst) {
            let mut ledger = self.service.ledger.lock();
            ledger.committed.insert(self.name.clone(), last.sequence_number);
            ledger.rows.extend(rows);
        }
        Ok(ack)
    }

    async fn wait_for_durable(
        &self,
        token: &AckToken,
        deadline: Duration,
    ) -> Result<(), ConnectorError> {
        let target: u64 = token.0.parse().unwrap_or(0);
        let committed = self.service.ledger.lock().committed.get(&self.name).copied();
        if committed.is_some_and(|c| c >= target) {
            return Ok(());
        }
        // Acks are being held back; emulate the deadline lapsing.
        tokio::time::sleep(deadline).await;
        Err(ConnectorError::DurabilityTimeout {
            channel: self.name.clone(),
            elapsed: deadline,
        })
    }

    async fn close(&self) {}
}

/// In-memory [`IngestClient`] recording durably acked rows.
pub struct InMemoryIngestClient {
    service: Arc<IngestService>,
    channels: Mutex<HashMap<String, Arc<InMemoryChannel>>>,
}

impl InMemoryIngestClient {
    /// Creates a client over a fresh service ledger.
    #[must_use]
    pub fn new() -> Self {
        Self {
            service: Arc::new(IngestService::default()),
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// The shared service handle, for scripting and assertions.
    #[must_use]
    pub fn service(&self) -> Arc<IngestService> {
        Arc::clone(&self.service)
    }
}

impl Default for InMemoryIngestClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IngestClient for InMemoryIngestClient {
    async fn open(&self, partition_id: &str) -> Result<Arc<dyn IngestChannel>, ConnectorError> {
        self.service.open_count.fetch_add(1, Ordering::SeqCst);
        if let Some(failure) = self.service.fail_open.lock().as_ref() {
            return Err(failure.to_error());
        }
        let mut channels = self.channels.lock();
        let channel = channels
            .entry(partition_id.to_string())
            .or_insert_with(|| {
                Arc::new(InMemoryChannel {
                    name: format!("mem_{partition_id}"),
                    service: Arc::clone(&self.service),
                })
            });
        Ok(Arc::clone(channel) as Arc<dyn IngestChannel>)
    }

    async fn invalidate(&self, partition_id: &str) {
        self.service.invalidate_count.fetch_add(1, Ordering::SeqCst);
        self.channels.lock().remove(partition_id);
    }

    async fn close(&self) {
        self.channels.lock().clear();
    }
}

// ── In-memory checkpoint store ──────────────────────────────────────

/// In-memory [`CheckpointStore`] with injectable save failures.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    entries: Mutex<HashMap<CheckpointKey, CheckpointEntry>>,
    fail_next_saves: Mutex<VecDeque<String>>,
    save_count: AtomicU64,
    ensure_count: AtomicU64,
}

impl InMemoryCheckpointStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `messages.len()` save failures, consumed in order.
    pub fn fail_next_saves(&self, messages: impl IntoIterator<Item = String>) {
        self.fail_next_saves.lock().extend(messages);
    }

    /// The persisted waterlevel for `key`, if any.
    #[must_use]
    pub fn waterlevel(&self, key: &CheckpointKey) -> Option<u64> {
        self.entries.lock().get(key).map(|e| e.waterlevel)
    }

    /// Number of successful and failed save attempts.
    #[must_use]
    pub fn save_count(&self) -> u64 {
        self.save_count.load(Ordering::SeqCst)
    }

    /// Number of `ensure_table` calls.
    #[must_use]
    pub fn ensure_count(&self) -> u64 {
        self.ensure_count.load(Ordering::SeqCst)
    }

    /// Snapshot of every persisted entry.
    #[must_use]
    pub fn entries(&self) -> HashMap<CheckpointKey, CheckpointEntry> {
        self.entries.lock().clone()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn ensure_table(&self) -> Result<(), ConnectorError> {
        self.ensure_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn load_all(
        &self,
        target: &TargetIdentity,
    ) -> Result<HashMap<String, CheckpointEntry>, ConnectorError> {
        Ok(self
            .entries
            .lock()
            .iter()
            .filter(|(k, _)| &k.target == target)
            .map(|(k, v)| (k.partition_id.clone(), v.clone()))
            .collect())
    }

    async fn save(
        &self,
        key: &CheckpointKey,
        waterlevel: u64,
        metadata: &CheckpointMetadata,
    ) -> Result<(), ConnectorError> {
        self.save_count.fetch_add(1, Ordering::SeqCst);
        if let Some(msg) = self.fail_next_saves.lock().pop_front() {
            return Err(ConnectorError::CheckpointPersist(msg));
        }
        self.entries.lock().insert(
            key.clone(),
            CheckpointEntry {
                waterlevel,
                metadata: metadata.clone(),
            },
        );
        Ok(())
    }
}
