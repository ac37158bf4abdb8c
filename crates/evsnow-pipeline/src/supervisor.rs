//! Per-mapping supervisor.
//!
//! One supervisor per event-hub → table mapping: it verifies the control
//! table, enumerates broker partitions, seeds one [`PartitionWorker`] per
//! partition from the loaded checkpoints, and owns the mapping's ingest
//! client. A worker's non-recoverable failure cancels its siblings and
//! marks the mapping failed; other mappings are unaffected.

use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use evsnow_connectors::checkpoint::CheckpointStore;
use evsnow_connectors::ingest::IngestClient;
use evsnow_connectors::source::EventHubSource;

use crate::config::{MappingConfig, PipelineConfig};
use crate::error::PipelineError;
use crate::retry::RetryPolicy;
use crate::stats::MappingState;
use crate::tracer::Tracer;
use crate::worker::{PartitionWorker, WorkerContext, WorkerFailure};

/// External collaborators of one mapping, wired by the deployment.
pub struct MappingRuntime {
    /// Broker connection for the mapping's hub and consumer group.
    pub source: Arc<dyn EventHubSource>,
    /// Streaming ingest client bound to the mapping's PIPE.
    pub client: Arc<dyn IngestClient>,
    /// Shared checkpoint store.
    pub store: Arc<dyn CheckpointStore>,
    /// Ingest client name recorded in checkpoint metadata.
    pub client_id: String,
}

/// Supervises all partition workers of one mapping.
pub struct MappingSupervisor {
    mapping: MappingConfig,
    config: PipelineConfig,
    runtime: MappingRuntime,
    policy: Arc<dyn RetryPolicy>,
    tracer: Arc<dyn Tracer>,
    state: Arc<MappingState>,
}

impl MappingSupervisor {
    /// Creates a supervisor; nothing runs until [`MappingSupervisor::run`].
    #[must_use]
    pub fn new(
        mapping: MappingConfig,
        config: PipelineConfig,
        runtime: MappingRuntime,
        policy: Arc<dyn RetryPolicy>,
        tracer: Arc<dyn Tracer>,
    ) -> Self {
        let state = Arc::new(MappingState::new(mapping.key()));
        Self {
            mapping,
            config,
            runtime,
            policy,
            tracer,
            state,
        }
    }

    /// Shared state handle, read by the orchestrator.
    #[must_use]
    pub fn state(&self) -> Arc<MappingState> {
        Arc::clone(&self.state)
    }

    /// Runs the mapping until cancellation or a non-recoverable failure.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::MappingFailed`] when startup fails or any
    /// worker raises a fatal / give-up failure.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), PipelineError> {
        let key = self.mapping.key();
        info!(mapping = %key, "starting mapping");

        let result = self.run_inner(&cancel).await;

        self.runtime.client.close().await;
        match &result {
            Ok(()) => {
                self.state.set_running(false);
                info!(mapping = %key, "mapping stopped");
            }
            Err(e) => {
                self.state.mark_failed(e.to_string());
                warn!(mapping = %key, error = %e, "mapping failed");
            }
        }
        result
    }

    async fn run_inner(&self, cancel: &CancellationToken) -> Result<(), PipelineError> {
        let key = self.mapping.key();
        let target = self.mapping.target_identity();

        self.runtime
            .store
            .ensure_table()
            .await
            .map_err(|e| self.startup_error("control table", &e))?;

        let partitions = self
            .runtime
            .source
            .partition_ids()
            .await
            .map_err(|e| self.startup_error("partition discovery", &e))?;

        let mut checkpoints = self
            .runtime
            .store
            .load_all(&target)
            .await
            .map_err(|e| self.startup_error("checkpoint load", &e))?;

        info!(
            mapping = %key,
            partitions = partitions.len(),
            checkpoints = checkpoints.len(),
            "mapping discovered partitions"
        );

        let worker_cancel = cancel.child_token();
        let mut pending: FuturesUnordered<_> = partitions
            .iter()
            .map(|partition_id| {
                let ctx = WorkerContext {
                    mapping_key: key.clone(),
                    target: target.clone(),
                    partition_id: partition_id.clone(),
                    batching: self.mapping.batching(self.config.batching),
                    config: self.config.clone(),
                    seed: checkpoints.remove(partition_id),
                    client_id: self.runtime.client_id.clone(),
                    source: Arc::clone(&self.runtime.source),
                    client: Arc::clone(&self.runtime.client),
                    store: Arc::clone(&self.runtime.store),
                    policy: Arc::clone(&self.policy),
                    tracer: Arc::clone(&self.tracer),
                    state: Arc::clone(&self.state),
                };
                PartitionWorker::spawn(ctx, worker_cancel.clone())
            })
            .collect();

        self.state.set_running(true);

        // Await workers; the first non-recoverable failure cancels the rest
        // of this mapping's workers, which then drain and exit.
        let mut first_failure: Option<WorkerFailure> = None;
        while let Some(joined) = pending.next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(failure)) => {
                    if first_failure.is_none() {
                        self.tracer.event(
                            "worker_failed",
                            &[
                                ("mapping", key.clone()),
                                ("partition", failure.partition_id.clone()),
                            ],
                        );
                        worker_cancel.cancel();
                        first_failure = Some(failure);
                    }
                }
                Err(join_error) => {
                    warn!(mapping = %key, error = %join_error, "worker task join error");
                    if first_failure.is_none() {
                        worker_cancel.cancel();
                        first_failure = Some(WorkerFailure {
                            partition_id: "?".into(),
                            kind: crate::worker::FailureKind::Fatal,
                            attempts: 0,
                            last_checkpointed: None,
                            error: evsnow_connectors::error::ConnectorError::PermanentIngest(
                                format!("worker task ended abnormally: {join_error}"),
                            ),
                        });
                    }
                }
            }
        }

        if let Some(failure) = first_failure {
            return Err(PipelineError::MappingFailed {
                mapping: key,
                reason: format!(
                    "partition {} {:?} after {} attempts: {}",
                    failure.partition_id, failure.kind, failure.attempts, failure.error
                ),
            });
        }
        Ok(())
    }

    fn startup_error(
        &self,
        stage: &str,
        error: &evsnow_connectors::error::ConnectorError,
    ) -> PipelineError {
        PipelineError::MappingFailed {
            mapping: self.mapping.key(),
            reason: format!("{stage}: {error}"),
        }
    }
}
