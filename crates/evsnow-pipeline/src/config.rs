//! Pipeline and mapping configuration.
//!
//! All values are supplied by the external loader; nothing here reads the
//! environment. Durations are plain [`Duration`]s constructed by the loader.

use std::time::Duration;

use serde::Deserialize;

use evsnow_connectors::checkpoint::TargetIdentity;
use evsnow_connectors::source::StartPosition;

/// Batch assembly bounds for one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchingConfig {
    /// Events per batch before the assembler signals ready.
    pub max_batch_size: usize,

    /// Time from the first buffered event to a forced flush.
    pub max_wait: Duration,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 1000,
            max_wait: Duration::from_secs(60),
        }
    }
}

/// Default retry policy shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Attempts before a transient failure turns into give-up.
    pub max_attempts: u32,

    /// First backoff delay; doubles per attempt.
    pub base_delay: Duration,

    /// Backoff ceiling.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Engine-wide configuration shared by every mapping.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Default batching bounds (mappings may override).
    pub batching: BatchingConfig,

    /// Broker-side prefetch credit per partition.
    pub prefetch: usize,

    /// Cursor position when a partition has no checkpoint.
    pub start_position: StartPosition,

    /// Default retry policy shape.
    pub retry: RetryConfig,

    /// Graceful-shutdown bound; supervisors still draining past this are
    /// abandoned and their in-flight batches re-ingest on next start.
    pub drain_deadline: Duration,

    /// Durable-ack wait bound per batch.
    pub ack_timeout: Duration,

    /// Broker receive poll bound.
    pub poll_timeout: Duration,

    /// Checkpoint save bound.
    pub save_timeout: Duration,

    /// Hard bound on a retry-classifier call; the default decision applies
    /// on timeout.
    pub classifier_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batching: BatchingConfig::default(),
            prefetch: 300,
            start_position: StartPosition::Latest,
            retry: RetryConfig::default(),
            drain_deadline: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(30),
            poll_timeout: Duration::from_secs(2),
            save_timeout: Duration::from_secs(10),
            classifier_timeout: Duration::from_secs(10),
        }
    }
}

/// One event-hub → Snowflake-table mapping.
#[derive(Debug, Clone, Deserialize)]
pub struct MappingConfig {
    /// Event Hubs namespace, e.g. `myns.servicebus.windows.net`.
    pub source_namespace: String,
    /// Event hub name.
    pub source_hub: String,
    /// Consumer group this process owns.
    pub consumer_group: String,
    /// Target database.
    pub target_db: String,
    /// Target schema.
    pub target_schema: String,
    /// Target table.
    pub target_table: String,
    /// Streaming ingest PIPE name.
    pub pipe_name: String,
    /// Per-mapping batch size override.
    #[serde(default)]
    pub max_batch_size: Option<usize>,
    /// Per-mapping max-wait override, seconds.
    #[serde(default)]
    pub max_wait_secs: Option<u64>,
}

impl MappingConfig {
    /// Human-readable mapping key used in logs and stats.
    #[must_use]
    pub fn key(&self) -> String {
        format!(
            "{}->{}.{}.{}",
            self.source_hub, self.target_db, self.target_schema, self.target_table
        )
    }

    /// The checkpoint identity of this mapping.
    #[must_use]
    pub fn target_identity(&self) -> TargetIdentity {
        TargetIdentity {
            namespace: self.source_namespace.clone(),
            hub: self.source_hub.clone(),
            target_db: self.target_db.clone(),
            target_schema: self.target_schema.clone(),
            target_table: self.target_table.clone(),
        }
    }

    /// Effective batching bounds: mapping overrides on top of `defaults`.
    #[must_use]
    pub fn batching(&self, defaults: BatchingConfig) -> BatchingConfig {
        BatchingConfig {
            max_batch_size: self.max_batch_size.unwrap_or(defaults.max_batch_size),
            max_wait: self
                .max_wait_secs
                .map_or(defaults.max_wait, Duration::from_secs),
        }
    }
}
