//! Process-wide orchestrator.
//!
//! Owns every mapping supervisor, installs the signal handlers, and
//! coordinates ordered shutdown: cancel intake, let workers drain their
//! in-flight batches, bound the whole thing with the drain deadline.
//! Mappings are isolated; one failing never cancels the others.

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::PipelineConfig;
use crate::stats::{Health, MappingSnapshot, MappingState};
use crate::supervisor::MappingSupervisor;

/// Process exit status decided by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Every mapping drained cleanly.
    Clean,
    /// At least one mapping failed, or the drain deadline was exceeded.
    MappingFailed,
    /// Second signal forced the process down.
    Forced,
}

impl ExitStatus {
    /// The process exit code for this status.
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            Self::Clean => 0,
            Self::MappingFailed => 1,
            Self::Forced => 2,
        }
    }
}

/// Cloneable read handle over every mapping's state.
#[derive(Clone)]
pub struct StatusHandle {
    states: Vec<Arc<MappingState>>,
}

impl StatusHandle {
    /// Worst health across mappings; `Healthy` when there are none.
    #[must_use]
    pub fn health(&self) -> Health {
        self.states
            .iter()
            .map(|s| s.health())
            .fold(Health::Healthy, Health::worst)
    }

    /// Point-in-time snapshot of the whole pipeline.
    #[must_use]
    pub fn snapshot(&self) -> PipelineSnapshot {
        let mappings: Vec<MappingSnapshot> = self.states.iter().map(|s| s.snapshot()).collect();
        PipelineSnapshot {
            health: self.health(),
            messages_ingested: mappings.iter().map(|m| m.messages_ingested).sum(),
            batches_ingested: mappings.iter().map(|m| m.batches_ingested).sum(),
            bytes_ingested: mappings.iter().map(|m| m.bytes_ingested).sum(),
            retries: mappings.iter().map(|m| m.retries).sum(),
            mappings,
        }
    }
}

/// Serializable aggregate of every mapping.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineSnapshot {
    /// Worst per-mapping health.
    pub health: Health,
    /// Events ingested across mappings.
    pub messages_ingested: u64,
    /// Batches ingested across mappings.
    pub batches_ingested: u64,
    /// Payload bytes ingested across mappings.
    pub bytes_ingested: u64,
    /// Retries across mappings.
    pub retries: u64,
    /// Per-mapping detail.
    pub mappings: Vec<MappingSnapshot>,
}

/// Owns all mapping supervisors and the root cancellation token.
pub struct Orchestrator {
    config: PipelineConfig,
    supervisors: Vec<MappingSupervisor>,
    states: Vec<Arc<MappingState>>,
    root: CancellationToken,
}

impl Orchestrator {
    /// Creates an empty orchestrator.
    #[must_use]
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            supervisors: Vec::new(),
            states: Vec::new(),
            root: CancellationToken::new(),
        }
    }

    /// Registers a mapping supervisor.
    pub fn add_mapping(&mut self, supervisor: MappingSupervisor) {
        self.states.push(supervisor.state());
        self.supervisors.push(supervisor);
    }

    /// The root cancellation token; cancelling it initiates graceful
    /// shutdown exactly like the first signal does.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.root.clone()
    }

    /// Read handle usable during and after [`Orchestrator::run`].
    #[must_use]
    pub fn status(&self) -> StatusHandle {
        StatusHandle {
            states: self.states.clone(),
        }
    }

    /// Installs interrupt/termination handlers: first signal cancels the
    /// root token, a second signal of the same kind force-exits with
    /// [`ExitStatus::Forced`] and no further cleanup.
    ///
    /// # Errors
    ///
    /// Returns the OS error when signal registration fails.
    #[cfg(unix)]
    pub fn install_signal_handlers(&self) -> std::io::Result<()> {
        use tokio::signal::unix::{signal, SignalKind};

        let root = self.root.clone();
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;

        tokio::spawn(async move {
            let mut seen_interrupt = false;
            let mut seen_terminate = false;
            loop {
                tokio::select! {
                    _ = interrupt.recv() => {
                        if seen_interrupt {
                            force_exit("SIGINT");
                        }
                        seen_interrupt = true;
                        info!(signal = "SIGINT", "shutdown signal received, draining");
                        root.cancel();
                    }
                    _ = terminate.recv() => {
                        if seen_terminate {
                            force_exit("SIGTERM");
                        }
                        seen_terminate = true;
                        info!(signal = "SIGTERM", "shutdown signal received, draining");
                        root.cancel();
                    }
                }
            }
        });
        Ok(())
    }

    /// Installs a ctrl-c handler: first press cancels the root token, the
    /// second force-exits.
    ///
    /// # Errors
    ///
    /// Returns the OS error when handler registration fails.
    #[cfg(not(unix))]
    pub fn install_signal_handlers(&self) -> std::io::Result<()> {
        let root = self.root.clone();
        tokio::spawn(async move {
            let mut seen = false;
            loop {
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
                if seen {
                    force_exit("ctrl-c");
                }
                seen = true;
                info!(signal = "ctrl-c", "shutdown signal received, draining");
                root.cancel();
            }
        });
        Ok(())
    }

    /// Runs every mapping until shutdown, returning the exit status.
    ///
    /// Shutdown order per mapping: stop intake, drain in-flight batches,
    /// flush, checkpoint, close — all driven by cooperative cancellation.
    /// Supervisors still draining after the drain deadline are abandoned;
    /// their in-flight batches re-ingest on the next start.
    pub async fn run(self) -> ExitStatus {
        let root = self.root.clone();
        let status = self.status();
        let drain_deadline = self.config.drain_deadline;

        let mut abort_handles = Vec::with_capacity(self.supervisors.len());
        let mut tasks = Vec::with_capacity(self.supervisors.len());
        for supervisor in self.supervisors {
            let task = tokio::spawn(supervisor.run(root.child_token()));
            abort_handles.push(task.abort_handle());
            tasks.push(task);
        }
        info!(mappings = tasks.len(), "pipeline started");

        let mut gather = tokio::spawn(futures::future::join_all(tasks));
        let mut abandoned = false;
        let mut supervisor_failed = false;

        let results = tokio::select! {
            biased;
            () = root.cancelled() => {
                info!("draining all mappings");
                match tokio::time::timeout(drain_deadline, &mut gather).await {
                    Ok(joined) => joined.ok(),
                    Err(_) => {
                        warn!(
                            deadline_secs = drain_deadline.as_secs(),
                            "drain deadline exceeded, abandoning remaining mappings"
                        );
                        for handle in &abort_handles {
                            handle.abort();
                        }
                        gather.abort();
                        abandoned = true;
                        None
                    }
                }
            }
            joined = &mut gather => joined.ok(),
        };

        if let Some(results) = results {
            for result in results {
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        supervisor_failed = true;
                        error!(error = %e, "mapping ended in failure");
                    }
                    Err(join_error) => {
                        supervisor_failed = true;
                        error!(error = %join_error, "mapping task ended abnormally");
                    }
                }
            }
        }

        let any_failed =
            supervisor_failed || abandoned || status.health() == Health::Failed;
        let exit = if any_failed {
            ExitStatus::MappingFailed
        } else {
            ExitStatus::Clean
        };
        info!(exit_code = exit.code(), health = %status.health(), "pipeline stopped");
        exit
    }
}

fn force_exit(signal: &str) -> ! {
    error!(signal, "second shutdown signal, forcing exit");
    std::process::exit(ExitStatus::Forced.code());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_exit_codes() {
        assert_eq!(ExitStatus::Clean.code(), 0);
        assert_eq!(ExitStatus::MappingFailed.code(), 1);
        assert_eq!(ExitStatus::Forced.code(), 2);
    }

    #[tokio::test]
    async fn test_empty_orchestrator_exits_clean() {
        let orch = Orchestrator::new(PipelineConfig::default());
        let token = orch.shutdown_token();
        token.cancel();
        assert_eq!(orch.run().await, ExitStatus::Clean);
    }

    #[tokio::test]
    async fn test_status_handle_empty_is_healthy() {
        let orch = Orchestrator::new(PipelineConfig {
            drain_deadline: Duration::from_millis(100),
            ..PipelineConfig::default()
        });
        let status = orch.status();
        assert_eq!(status.health(), Health::Healthy);
        let snap = status.snapshot();
        assert_eq!(snap.messages_ingested, 0);
        assert!(snap.mappings.is_empty());
    }
}
