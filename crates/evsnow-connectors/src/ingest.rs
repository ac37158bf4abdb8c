//! Streaming ingest client and channel traits.
//!
//! One [`IngestClient`] per mapping, one [`IngestChannel`] per partition.
//! `send` only enqueues into the server's streaming buffer; a batch counts
//! as ingested when [`IngestChannel::wait_for_durable`] returns `Ok` for
//! the token `send` handed back.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::ConnectorError;

/// Serializes a timestamp as timezone-naive UTC, e.g.
/// `2024-05-01T12:00:00.000000`.
fn naive_utc<S: serde::Serializer>(dt: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&dt.naive_utc().format("%Y-%m-%dT%H:%M:%S%.6f").to_string())
}

/// One row of the target table, serialized from a broker event.
#[derive(Debug, Clone, Serialize)]
pub struct IngestRow {
    /// Payload, parsed as JSON when possible, stored as a string otherwise.
    pub event_body: serde_json::Value,
    /// Source partition.
    pub partition_id: String,
    /// Broker sequence number.
    pub sequence_number: u64,
    /// Enqueued wall clock, UTC, rendered timezone-naive.
    #[serde(serialize_with = "naive_utc")]
    pub enqueued_time: DateTime<Utc>,
    /// Application properties as a JSON object.
    pub properties: serde_json::Value,
    /// Broker properties as a JSON object.
    pub system_properties: serde_json::Value,
    /// Deterministic row id for downstream deduplication.
    pub row_id: String,
}

/// Identifies a sent batch's position in the server's streaming buffer.
///
/// The inner token is the offset token registered with the server; for this
/// pipeline it is the last sequence number of the batch, rendered decimal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckToken(
    /// The server-side offset token.
    pub String,
);

impl AckToken {
    /// Builds the token for a batch ending at `last_sequence`.
    #[must_use]
    pub fn for_sequence(last_sequence: u64) -> Self {
        Self(last_sequence.to_string())
    }
}

/// A per-partition streaming session against the ingest service.
#[async_trait]
pub trait IngestChannel: Send + Sync {
    /// The server-side channel name, `<table>_<partition>_<suffix>`.
    fn name(&self) -> &str;

    /// Enqueues `rows` into the server's streaming buffer.
    ///
    /// Returns a token identifying the batch's position. Rows are **not**
    /// durable when this returns.
    ///
    /// # Errors
    ///
    /// [`ConnectorError::TransientNetwork`] for I/O and throttle failures
    /// (close and reopen the channel, resend the same batch);
    /// [`ConnectorError::PermanentIngest`] for schema or auth failures.
    async fn send(&self, rows: Vec<IngestRow>) -> Result<AckToken, ConnectorError>;

    /// Blocks until the server commits the batch behind `token` or the
    /// deadline lapses.
    ///
    /// # Errors
    ///
    /// [`ConnectorError::DurabilityTimeout`] when the deadline lapses,
    /// otherwise the same classification as [`IngestChannel::send`].
    async fn wait_for_durable(
        &self,
        token: &AckToken,
        deadline: Duration,
    ) -> Result<(), ConnectorError>;

    /// Flushes pending rows and closes the server-side channel.
    async fn close(&self);
}

/// A long-lived connection context bound to one account, user and PIPE.
///
/// Exclusively owns the channels opened under it; `open` is idempotent and
/// thread-safe so workers of one mapping can share the client by reference.
#[async_trait]
pub trait IngestClient: Send + Sync {
    /// Opens (or returns the already-open) channel for `partition_id`.
    ///
    /// # Errors
    ///
    /// [`ConnectorError::PermanentIngest`] when the PIPE is missing or the
    /// credentials are rejected; [`ConnectorError::TransientNetwork`]
    /// otherwise.
    async fn open(&self, partition_id: &str) -> Result<Arc<dyn IngestChannel>, ConnectorError>;

    /// Drops the cached channel for `partition_id`, closing it server-side.
    ///
    /// The next `open` for the partition starts a fresh session; used by
    /// workers to recover from transient send failures.
    async fn invalidate(&self, partition_id: &str);

    /// Closes every open channel, then the client itself.
    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_token_from_sequence() {
        assert_eq!(AckToken::for_sequence(42), AckToken("42".into()));
    }

    #[test]
    fn test_row_serializes_flat() {
        let row = IngestRow {
            event_body: serde_json::json!({"k": 1}),
            partition_id: "3".into(),
            sequence_number: 77,
            enqueued_time: Utc::now(),
            properties: serde_json::json!({}),
            system_properties: serde_json::json!({}),
            row_id: "abc".into(),
        };
        let v = serde_json::to_value(&row).unwrap();
        assert_eq!(v["partition_id"], "3");
        assert_eq!(v["sequence_number"], 77);
        assert_eq!(v["event_body"]["k"], 1);
    }

    #[test]
    fn test_enqueued_time_is_timezone_naive() {
        use chrono::TimeZone;
        let row = IngestRow {
            event_body: serde_json::json!(null),
            partition_id: "0".into(),
            sequence_number: 1,
            enqueued_time: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            properties: serde_json::json!({}),
            system_properties: serde_json::json!({}),
            row_id: "abc".into(),
        };
        let v = serde_json::to_value(&row).unwrap();
        let rendered = v["enqueued_time"].as_str().unwrap();
        assert_eq!(rendered, "2024-05-01T12:00:00.000000");
        assert!(!rendered.contains('Z'));
        assert!(!rendered.contains('+'));
    }
}
