//! Per-partition checkpoint types and store trait.
//!
//! A checkpoint records the highest sequence number for which every event
//! up to and including it has been durably ingested (the waterlevel). Rows
//! live in a Snowflake hybrid table keyed by the full mapping identity plus
//! partition id, and are written with upsert-by-key semantics.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ConnectorError;

/// Identity of the target a checkpoint tracks: one mapping, all partitions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetIdentity {
    /// Event Hubs namespace.
    pub namespace: String,
    /// Event hub name.
    pub hub: String,
    /// Target database.
    pub target_db: String,
    /// Target schema.
    pub target_schema: String,
    /// Target table.
    pub target_table: String,
}

/// Primary key of one checkpoint row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CheckpointKey {
    /// The mapping identity.
    pub target: TargetIdentity,
    /// Partition id within the hub.
    pub partition_id: String,
}

impl CheckpointKey {
    /// Builds the key for `partition_id` under `target`.
    #[must_use]
    pub fn new(target: TargetIdentity, partition_id: impl Into<String>) -> Self {
        Self {
            target,
            partition_id: partition_id.into(),
        }
    }
}

/// Free-form structured blob stored next to the waterlevel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Broker offset of the last event in the checkpointed batch.
    pub offset: Option<String>,
    /// Ingest client name that wrote the batch.
    pub client_id: Option<String>,
    /// Event count of the checkpointed batch.
    pub batch_size: Option<usize>,
}

/// One checkpoint row as read back from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointEntry {
    /// Sequence number of the last durably ingested event.
    pub waterlevel: u64,
    /// Metadata recorded with the last save.
    pub metadata: CheckpointMetadata,
}

/// Durable per-partition checkpoint storage.
///
/// Shared by reference across every worker of every mapping; safe for
/// concurrent saves on distinct keys. Saves on the same key serialize in
/// the database, last write wins.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Idempotently creates the control table and its schema.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::CheckpointPersist`] when the DDL fails.
    async fn ensure_table(&self) -> Result<(), ConnectorError>;

    /// Snapshot-reads the current checkpoint for every partition of
    /// `target`. Partitions never checkpointed are absent from the map.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::ControlTableMissing`] if the table was
    /// dropped mid-run, [`ConnectorError::CheckpointPersist`] for other
    /// SQL failures.
    async fn load_all(
        &self,
        target: &TargetIdentity,
    ) -> Result<HashMap<String, CheckpointEntry>, ConnectorError>;

    /// Atomically upserts the checkpoint row for `key`.
    ///
    /// On `Ok`, the checkpoint is durable. Idempotent for the same
    /// `(key, waterlevel)` pair.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::CheckpointPersist`]; the caller must treat
    /// the batch as not yet durable and retry.
    async fn save(
        &self,
        key: &CheckpointKey,
        waterlevel: u64,
        metadata: &CheckpointMetadata,
    ) -> Result<(), ConnectorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> TargetIdentity {
        TargetIdentity {
            namespace: "ns.servicebus.windows.net".into(),
            hub: "telemetry".into(),
            target_db: "RAW".into(),
            target_schema: "PUBLIC".into(),
            target_table: "EVENTS".into(),
        }
    }

    #[test]
    fn test_keys_differ_by_partition() {
        let a = CheckpointKey::new(target(), "0");
        let b = CheckpointKey::new(target(), "1");
        assert_ne!(a, b);
        assert_eq!(a, CheckpointKey::new(target(), "0"));
    }

    #[test]
    fn test_metadata_roundtrip() {
        let meta = CheckpointMetadata {
            offset: Some("1234".into()),
            client_id: Some("evsnow_ab12cd34".into()),
            batch_size: Some(500),
        };
        let json = serde_json::to_string(&meta).unwrap();
        let back: CheckpointMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(meta, back);
    }
}
