//! Checkpoint store backed by a Snowflake hybrid table.
//!
//! Hybrid tables give row-level locking and a real primary key, so the
//! per-partition upsert is a single `MERGE` that concurrent workers can
//! issue without blocking each other on distinct keys.

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::{debug, info};

use super::sql::{Binding, SqlApiError, SqlPool};
use super::ControlTableLocation;
use crate::checkpoint::{
    CheckpointEntry, CheckpointKey, CheckpointMetadata, CheckpointStore, TargetIdentity,
};
use crate::error::{validate_identifier, ConnectorError};

/// [`CheckpointStore`] implementation over the pooled SQL API.
pub struct SnowflakeCheckpointStore {
    pool: SqlPool,
    control: ControlTableLocation,
}

impl SnowflakeCheckpointStore {
    /// Creates a store writing to `control` through `pool`.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::InvalidIdentifier`] when the control table
    /// location contains unsafe identifiers.
    pub fn new(pool: SqlPool, control: ControlTableLocation) -> Result<Self, ConnectorError> {
        validate_identifier(&control.database)?;
        validate_identifier(&control.schema)?;
        validate_identifier(&control.table)?;
        Ok(Self { pool, control })
    }

    async fn session(&self) -> Result<deadpool::managed::Object<super::sql::SessionManager>, ConnectorError> {
        self.pool
            .get()
            .await
            .map_err(|e| ConnectorError::CheckpointPersist(format!("no SQL session: {e}")))
    }

    fn save_error(e: SqlApiError) -> ConnectorError {
        ConnectorError::CheckpointPersist(e.to_string())
    }

    fn load_error(e: SqlApiError) -> ConnectorError {
        if e.is_missing_object() {
            ConnectorError::ControlTableMissing(e.to_string())
        } else {
            ConnectorError::CheckpointPersist(e.to_string())
        }
    }
}

#[async_trait]
impl CheckpointStore for SnowflakeCheckpointStore {
    async fn ensure_table(&self) -> Result<(), ConnectorError> {
        let session = self.session().await?;

        let schema_ddl = format!(
            "CREATE SCHEMA IF NOT EXISTS {}.{}",
            self.control.database, self.control.schema
        );
        session
            .execute(&schema_ddl, &[])
            .await
            .map_err(Self::save_error)?;

        let table_ddl = format!(
            "CREATE HYBRID TABLE IF NOT EXISTS {} (\
             TS_INSERTED TIMESTAMP_LTZ DEFAULT CURRENT_TIMESTAMP(), \
             EVENTHUB_NAMESPACE VARCHAR(500), \
             EVENTHUB VARCHAR(200), \
             TARGET_DB VARCHAR(200), \
             TARGET_SCHEMA VARCHAR(200), \
             TARGET_TABLE VARCHAR(200), \
             WATERLEVEL NUMBER(38, 0), \
             PARTITION_ID VARCHAR(50) NOT NULL, \
             METADATA VARIANT, \
             PRIMARY KEY (EVENTHUB_NAMESPACE, EVENTHUB, TARGET_DB, TARGET_SCHEMA, \
             TARGET_TABLE, PARTITION_ID))",
            self.control.qualified()
        );
        session
            .execute(&table_ddl, &[])
            .await
            .map_err(Self::save_error)?;

        info!(table = %self.control.qualified(), "control table verified");
        Ok(())
    }

    async fn load_all(
        &self,
        target: &TargetIdentity,
    ) -> Result<HashMap<String, CheckpointEntry>, ConnectorError> {
        let session = self.session().await?;

        // Newest row per partition; older rows can linger if the table was
        // ever written without the primary key in place.
        let query = format!(
            "SELECT PARTITION_ID, WATERLEVEL, TO_JSON(METADATA) FROM {} \
             WHERE EVENTHUB_NAMESPACE = ? AND EVENTHUB = ? \
             AND TARGET_DB = ? AND TARGET_SCHEMA = ? AND TARGET_TABLE = ? \
             AND PARTITION_ID IS NOT NULL \
             QUALIFY ROW_NUMBER() OVER (PARTITION BY PARTITION_ID ORDER BY TS_INSERTED DESC) = 1",
            self.control.qualified()
        );
        let bindings = [
            Binding::Text(target.namespace.clone()),
            Binding::Text(target.hub.clone()),
            Binding::Text(target.target_db.clone()),
            Binding::Text(target.target_schema.clone()),
            Binding::Text(target.target_table.clone()),
        ];

        let result = session
            .execute(&query, &bindings)
            .await
            .map_err(Self::load_error)?;

        let mut checkpoints = HashMap::new();
        for row in result.rows {
            let (Some(partition), Some(level)) = (row.first().cloned().flatten(), row.get(1).cloned().flatten())
            else {
                continue;
            };
            let waterlevel: u64 = level.parse().map_err(|_| {
                ConnectorError::CheckpointPersist(format!(
                    "non-numeric waterlevel '{level}' for partition {partition}"
                ))
            })?;
            let metadata = row
                .get(2)
                .cloned()
                .flatten()
                .and_then(|raw| serde_json::from_str(&raw).ok())
                .unwrap_or_default();
            checkpoints.insert(partition, CheckpointEntry { waterlevel, metadata });
        }

        debug!(
            hub = %target.hub,
            partitions = checkpoints.len(),
            "loaded partition checkpoints"
        );
        Ok(checkpoints)
    }

    async fn save(
        &self,
        key: &CheckpointKey,
        waterlevel: u64,
        metadata: &CheckpointMetadata,
    ) -> Result<(), ConnectorError> {
        let session = self.session().await?;

        let merge = format!(
            "MERGE INTO {} AS target USING (SELECT \
             ? AS EVENTHUB_NAMESPACE, ? AS EVENTHUB, ? AS TARGET_DB, \
             ? AS TARGET_SCHEMA, ? AS TARGET_TABLE, ? AS PARTITION_ID, \
             ? AS WATERLEVEL, PARSE_JSON(?) AS METADATA, \
             CURRENT_TIMESTAMP() AS TS_INSERTED) AS source \
             ON target.EVENTHUB_NAMESPACE = source.EVENTHUB_NAMESPACE \
             AND target.EVENTHUB = source.EVENTHUB \
             AND target.TARGET_DB = source.TARGET_DB \
             AND target.TARGET_SCHEMA = source.TARGET_SCHEMA \
             AND target.TARGET_TABLE = source.TARGET_TABLE \
             AND target.PARTITION_ID = source.PARTITION_ID \
             WHEN MATCHED THEN UPDATE SET \
             target.WATERLEVEL = source.WATERLEVEL, \
             target.TS_INSERTED = source.TS_INSERTED, \
             target.METADATA = source.METADATA \
             WHEN NOT MATCHED THEN INSERT \
             (TS_INSERTED, EVENTHUB_NAMESPACE, EVENTHUB, TARGET_DB, TARGET_SCHEMA, \
             TARGET_TABLE, WATERLEVEL, PARTITION_ID, METADATA) VALUES \
             (source.TS_INSERTED, source.EVENTHUB_NAMESPACE, source.EVENTHUB, \
             source.TARGET_DB, source.TARGET_SCHEMA, source.TARGET_TABLE, \
             source.WATERLEVEL, source.PARTITION_ID, source.METADATA)",
            self.control.qualified()
        );

        let metadata_json = serde_json::to_string(metadata)
            .map_err(|e| ConnectorError::CheckpointPersist(format!("metadata encode: {e}")))?;
        let bindings = [
            Binding::Text(key.target.namespace.clone()),
            Binding::Text(key.target.hub.clone()),
            Binding::Text(key.target.target_db.clone()),
            Binding::Text(key.target.target_schema.clone()),
            Binding::Text(key.target.target_table.clone()),
            Binding::Text(key.partition_id.clone()),
            Binding::Number(waterlevel),
            Binding::Text(metadata_json),
        ];

        session
            .execute(&merge, &bindings)
            .await
            .map_err(Self::save_error)?;

        debug!(
            partition = %key.partition_id,
            waterlevel,
            "checkpoint merged"
        );
        Ok(())
    }
}
