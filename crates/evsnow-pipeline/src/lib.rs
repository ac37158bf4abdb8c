//! # evsnow Pipeline
//!
//! Streaming ingestion engine moving Azure Event Hubs events into Snowflake
//! tables with at-least-once delivery and durable per-partition checkpoints.
//!
//! One [`orchestrator::Orchestrator`] owns N independent
//! [`supervisor::MappingSupervisor`]s; each supervisor runs one
//! [`worker::PartitionWorker`] task per broker partition. Workers assemble
//! bounded batches, stream them through a per-partition ingest channel, and
//! advance the checkpoint only after the durable ack.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

/// Pipeline and mapping configuration
pub mod config;

/// Pipeline error type
pub mod error;

/// Batch assembly under size and time bounds
pub mod batch;

/// Event to target-row conversion and row-id synthesis
pub mod rows;

/// Retry policy interface and default backoff
pub mod retry;

/// Per-mapping stats, state and health
pub mod stats;

/// Observability seam
pub mod tracer;

/// Per-partition ingestion worker
pub mod worker;

/// Per-mapping supervisor
pub mod supervisor;

/// Process-wide orchestrator
pub mod orchestrator;

pub use config::{BatchingConfig, MappingConfig, PipelineConfig, RetryConfig};
pub use error::PipelineError;
pub use orchestrator::{ExitStatus, Orchestrator};
pub use supervisor::{MappingRuntime, MappingSupervisor};
