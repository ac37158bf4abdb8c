//! Per-partition ingestion worker.
//!
//! Each worker runs in its own tokio task with exclusive ownership of its
//! receiver, assembler and channel. The loop is sequential: receive,
//! assemble, send, wait for the durable ack, save the checkpoint. Exactly
//! one batch is in flight per partition, so the checkpoint can never pass
//! un-ingested data and per-partition order is preserved end to end.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use evsnow_connectors::checkpoint::{
    CheckpointEntry, CheckpointKey, CheckpointMetadata, CheckpointStore, TargetIdentity,
};
use evsnow_connectors::error::{ConnectorError, ErrorKind};
use evsnow_connectors::ingest::{IngestChannel, IngestClient, IngestRow};
use evsnow_connectors::source::{EventHubSource, PartitionReceiver, StartPosition};

use crate::batch::{AssemblyError, Batch, BatchAssembler};
use crate::config::{BatchingConfig, PipelineConfig};
use crate::retry::{Decision, RetryPolicy};
use crate::rows::batch_to_rows;
use crate::stats::MappingState;
use crate::tracer::Tracer;

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Reading the checkpoint and opening broker/ingest sessions.
    Initializing,
    /// Steady-state receive/assemble/ingest/checkpoint loop.
    Running,
    /// Cancellation observed; finishing the in-flight batch.
    Draining,
    /// Exited cleanly.
    Closed,
    /// Stopped on a non-recoverable error.
    Failed,
}

/// How a worker's retry budget ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The attempt budget ran out on a retryable error.
    GiveUp,
    /// The error was unrecoverable from the start.
    Fatal,
}

/// Terminal worker failure, surfaced to the supervisor.
#[derive(Debug)]
pub struct WorkerFailure {
    /// Partition the worker was driving.
    pub partition_id: String,
    /// Budget exhaustion vs. unrecoverable error.
    pub kind: FailureKind,
    /// Attempts made on the failing operation.
    pub attempts: u32,
    /// Last successfully checkpointed sequence, if any.
    pub last_checkpointed: Option<u64>,
    /// The final error.
    pub error: ConnectorError,
}

/// Everything a worker needs; assembled by the supervisor.
pub struct WorkerContext {
    /// Mapping key for logs.
    pub mapping_key: String,
    /// Checkpoint identity of the mapping.
    pub target: TargetIdentity,
    /// Partition this worker owns.
    pub partition_id: String,
    /// Effective batching bounds.
    pub batching: BatchingConfig,
    /// Engine configuration (timeouts, prefetch, start position).
    pub config: PipelineConfig,
    /// Checkpoint loaded at supervisor startup, if one existed.
    pub seed: Option<CheckpointEntry>,
    /// Ingest client name recorded in checkpoint metadata.
    pub client_id: String,
    /// Broker connection.
    pub source: Arc<dyn EventHubSource>,
    /// Ingest client shared across the mapping's workers.
    pub client: Arc<dyn IngestClient>,
    /// Shared checkpoint store.
    pub store: Arc<dyn CheckpointStore>,
    /// Retry policy.
    pub policy: Arc<dyn RetryPolicy>,
    /// Observability sink.
    pub tracer: Arc<dyn Tracer>,
    /// Shared mapping state for stats and worker-state publishing.
    pub state: Arc<MappingState>,
}

/// Drives one partition's receive → assemble → ingest → checkpoint loop.
pub struct PartitionWorker {
    ctx: WorkerContext,
    channel: Option<Arc<dyn IngestChannel>>,
    last_checkpointed: Option<u64>,
}

impl PartitionWorker {
    /// Spawns the worker on the runtime.
    #[must_use]
    pub fn spawn(
        ctx: WorkerContext,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<Result<(), WorkerFailure>> {
        let worker = Self {
            last_checkpointed: ctx.seed.as_ref().map(|e| e.waterlevel),
            channel: None,
            ctx,
        };
        tokio::spawn(worker.run(cancel))
    }

    async fn run(mut self, cancel: CancellationToken) -> Result<(), WorkerFailure> {
        self.set_state(WorkerState::Initializing);
        let result = self.run_inner(&cancel).await;

        match &result {
            Ok(()) => {
                self.set_state(WorkerState::Closed);
                info!(
                    mapping = %self.ctx.mapping_key,
                    partition = %self.ctx.partition_id,
                    checkpoint = ?self.last_checkpointed,
                    "partition worker closed"
                );
            }
            Err(f) => {
                self.set_state(WorkerState::Failed);
                error!(
                    mapping = %self.ctx.mapping_key,
                    partition = %f.partition_id,
                    kind = ?f.kind,
                    attempts = f.attempts,
                    last_sequence = ?f.last_checkpointed,
                    error = %f.error,
                    "partition worker failed"
                );
            }
        }

        if let Some(channel) = self.channel.take() {
            channel.close().await;
        }
        result
    }

    async fn run_inner(&mut self, cancel: &CancellationToken) -> Result<(), WorkerFailure> {
        let position = match &self.ctx.seed {
            Some(entry) => StartPosition::After(entry.waterlevel),
            None => self.ctx.config.start_position,
        };

        let Some(mut receiver) = self.open_receiver_with_retry(position, cancel).await? else {
            // Cancelled before the cursor opened; nothing to drain.
            return Ok(());
        };
        if !self.open_channel_with_retry(cancel).await? {
            receiver.close().await;
            return Ok(());
        }

        debug!(
            mapping = %self.ctx.mapping_key,
            partition = %self.ctx.partition_id,
            position = ?position,
            "partition worker started"
        );

        let mut assembler = BatchAssembler::new(
            self.ctx.partition_id.clone(),
            self.ctx.batching,
            self.last_checkpointed,
        );
        let mut recv_failures: u32 = 0;
        let recv_started = Instant::now();
        self.set_state(WorkerState::Running);

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let max_events = assembler.remaining_capacity();
            let wait = assembler
                .time_until_flush()
                .map_or(self.ctx.config.poll_timeout, |left| {
                    left.min(self.ctx.config.poll_timeout)
                });

            let received = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                r = receiver.recv_batch(max_events, wait) => r,
            };

            match received {
                Ok(events) => {
                    recv_failures = 0;
                    let mut ready = assembler.is_ready();
                    for event in events {
                        let became_ready = assembler
                            .add(event)
                            .map_err(|e| self.assembly_failure(&e))?;
                        ready = ready || became_ready;
                    }
                    if ready {
                        if let Some(batch) = assembler.take() {
                            self.ingest_batch(batch).await?;
                        }
                    }
                }
                Err(e) => {
                    recv_failures += 1;
                    let decision = self
                        .ctx
                        .policy
                        .classify(&e, recv_failures, recv_started.elapsed())
                        .await;
                    match decision {
                        Decision::RetryAfter(delay) => {
                            self.record_retry();
                            warn!(
                                partition = %self.ctx.partition_id,
                                attempt = recv_failures,
                                error = %e,
                                "broker receive failed, backing off"
                            );
                            tokio::select! {
                                biased;
                                () = cancel.cancelled() => break,
                                () = tokio::time::sleep(delay) => {}
                            }
                        }
                        Decision::GiveUp => {
                            return Err(self.failure(FailureKind::GiveUp, recv_failures, e))
                        }
                        Decision::Fatal => {
                            return Err(self.failure(FailureKind::Fatal, recv_failures, e))
                        }
                    }
                }
            }
        }

        // Drain: stop intake, flush what is buffered, checkpoint, close.
        self.set_state(WorkerState::Draining);
        receiver.close().await;
        if let Some(batch) = assembler.flush_if_nonempty() {
            debug!(
                partition = %self.ctx.partition_id,
                events = batch.len(),
                "draining in-flight batch"
            );
            self.ingest_batch(batch).await?;
        }
        Ok(())
    }

    /// Sends one batch until it is durably ingested *and* checkpointed, or
    /// the retry policy says stop.
    ///
    /// Once the durable ack has been seen, retries only repeat the
    /// checkpoint save; the batch is never resent past that point.
    async fn ingest_batch(&mut self, batch: Batch) -> Result<(), WorkerFailure> {
        let _span = self.ctx.tracer.span("ingest_batch");
        let rows = batch_to_rows(&batch, &self.ctx.target);
        let bytes = batch.payload_bytes();
        let started = Instant::now();
        let mut attempt: u32 = 0;
        let mut durable = false;

        loop {
            attempt += 1;
            match self.ingest_once(&batch, &rows, &mut durable).await {
                Ok(()) => {
                    self.last_checkpointed = Some(batch.last_sequence());
                    self.ctx
                        .state
                        .stats()
                        .record_batch(batch.len() as u64, bytes);
                    let lag_ms = (Utc::now() - batch.last_enqueued()).num_milliseconds();
                    self.ctx.state.record_partition_progress(
                        &self.ctx.partition_id,
                        batch.last_sequence(),
                        lag_ms,
                    );
                    self.ctx.tracer.counter_add("batches_ingested", 1);
                    self.ctx
                        .tracer
                        .counter_add("events_ingested", batch.len() as u64);
                    debug!(
                        partition = %self.ctx.partition_id,
                        events = batch.len(),
                        checkpoint = batch.last_sequence(),
                        "batch ingested and checkpointed"
                    );
                    return Ok(());
                }
                Err(e) => {
                    let decision = self
                        .ctx
                        .policy
                        .classify(&e, attempt, started.elapsed())
                        .await;
                    match decision {
                        Decision::RetryAfter(delay) => {
                            self.record_retry();
                            warn!(
                                partition = %self.ctx.partition_id,
                                attempt,
                                durable,
                                delay_ms = delay.as_millis() as u64,
                                error = %e,
                                "batch attempt failed, retrying"
                            );
                            // Ingest-path failures invalidate the channel so
                            // the resend goes through a fresh session.
                            if !durable
                                && matches!(
                                    e.kind(),
                                    ErrorKind::Transient | ErrorKind::DurabilityTimeout
                                )
                            {
                                self.ctx.client.invalidate(&self.ctx.partition_id).await;
                                self.channel = None;
                            }
                            tokio::time::sleep(delay).await;
                        }
                        Decision::GiveUp => {
                            return Err(self.failure(FailureKind::GiveUp, attempt, e))
                        }
                        Decision::Fatal => {
                            return Err(self.failure(FailureKind::Fatal, attempt, e))
                        }
                    }
                }
            }
        }
    }

    async fn ingest_once(
        &mut self,
        batch: &Batch,
        rows: &[IngestRow],
        durable: &mut bool,
    ) -> Result<(), ConnectorError> {
        if !*durable {
            let channel = self.ensure_channel().await?;
            let token = channel.send(rows.to_vec()).await?;
            channel
                .wait_for_durable(&token, self.ctx.config.ack_timeout)
                .await?;
            *durable = true;
        }
        self.save_checkpoint(batch).await
    }

    async fn ensure_channel(&mut self) -> Result<Arc<dyn IngestChannel>, ConnectorError> {
        if let Some(channel) = &self.channel {
            return Ok(Arc::clone(channel));
        }
        let channel = self.ctx.client.open(&self.ctx.partition_id).await?;
        self.channel = Some(Arc::clone(&channel));
        Ok(channel)
    }

    async fn save_checkpoint(&self, batch: &Batch) -> Result<(), ConnectorError> {
        let key = CheckpointKey::new(self.ctx.target.clone(), self.ctx.partition_id.clone());
        let metadata = CheckpointMetadata {
            offset: Some(batch.last_offset().to_string()),
            client_id: Some(self.ctx.client_id.clone()),
            batch_size: Some(batch.len()),
        };
        let save = self
            .ctx
            .store
            .save(&key, batch.last_sequence(), &metadata);
        match tokio::time::timeout(self.ctx.config.save_timeout, save).await {
            Ok(result) => {
                if result.is_ok() {
                    self.ctx.tracer.counter_add("checkpoint_saves", 1);
                }
                result
            }
            Err(_) => Err(ConnectorError::CheckpointPersist(format!(
                "save timed out after {:?}",
                self.ctx.config.save_timeout
            ))),
        }
    }

    /// Opens the broker cursor, retrying per policy. `Ok(None)` means
    /// cancellation arrived first.
    async fn open_receiver_with_retry(
        &mut self,
        position: StartPosition,
        cancel: &CancellationToken,
    ) -> Result<Option<Box<dyn PartitionReceiver>>, WorkerFailure> {
        let started = Instant::now();
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            attempt += 1;
            match self
                .ctx
                .source
                .open_receiver(&self.ctx.partition_id, position, self.ctx.config.prefetch)
                .await
            {
                Ok(receiver) => return Ok(Some(receiver)),
                Err(e) => match self.ctx.policy.classify(&e, attempt, started.elapsed()).await {
                    Decision::RetryAfter(delay) => {
                        self.record_retry();
                        warn!(
                            partition = %self.ctx.partition_id,
                            attempt,
                            error = %e,
                            "broker cursor open failed, retrying"
                        );
                        tokio::select! {
                            biased;
                            () = cancel.cancelled() => return Ok(None),
                            () = tokio::time::sleep(delay) => {}
                        }
                    }
                    Decision::GiveUp => {
                        return Err(self.failure(FailureKind::GiveUp, attempt, e))
                    }
                    Decision::Fatal => return Err(self.failure(FailureKind::Fatal, attempt, e)),
                },
            }
        }
    }

    /// Opens the ingest channel, retrying per policy. `Ok(false)` means
    /// cancellation arrived first.
    async fn open_channel_with_retry(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<bool, WorkerFailure> {
        let started = Instant::now();
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Ok(false);
            }
            attempt += 1;
            match self.ensure_channel().await {
                Ok(_) => return Ok(true),
                Err(e) => match self.ctx.policy.classify(&e, attempt, started.elapsed()).await {
                    Decision::RetryAfter(delay) => {
                        self.record_retry();
                        warn!(
                            partition = %self.ctx.partition_id,
                            attempt,
                            error = %e,
                            "ingest channel open failed, retrying"
                        );
                        tokio::select! {
                            biased;
                            () = cancel.cancelled() => return Ok(false),
                            () = tokio::time::sleep(delay) => {}
                        }
                    }
                    Decision::GiveUp => {
                        return Err(self.failure(FailureKind::GiveUp, attempt, e))
                    }
                    Decision::Fatal => return Err(self.failure(FailureKind::Fatal, attempt, e)),
                },
            }
        }
    }

    fn set_state(&self, state: WorkerState) {
        self.ctx
            .state
            .set_worker_state(&self.ctx.partition_id, state);
    }

    fn record_retry(&self) {
        self.ctx.state.stats().record_retry();
        self.ctx.tracer.counter_add("retries", 1);
    }

    fn failure(&self, kind: FailureKind, attempts: u32, error: ConnectorError) -> WorkerFailure {
        WorkerFailure {
            partition_id: self.ctx.partition_id.clone(),
            kind,
            attempts,
            last_checkpointed: self.last_checkpointed,
            error,
        }
    }

    fn assembly_failure(&self, error: &AssemblyError) -> WorkerFailure {
        WorkerFailure {
            partition_id: self.ctx.partition_id.clone(),
            kind: FailureKind::Fatal,
            attempts: 1,
            last_checkpointed: self.last_checkpointed,
            error: ConnectorError::PermanentIngest(error.to_string()),
        }
    }
}
