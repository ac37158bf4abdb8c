//! Event Hubs source abstraction.
//!
//! The pipeline consumes the broker exclusively through [`EventHubSource`]
//! and [`PartitionReceiver`], so tests and harnesses can substitute the
//! in-memory implementations from [`crate::testing`].

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ConnectorError;
use crate::event::Event;

/// Where a partition cursor starts when no checkpoint exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartPosition {
    /// Begin at the oldest retained event.
    Earliest,
    /// Begin at the next event enqueued after the cursor opens.
    #[default]
    Latest,
    /// Begin strictly after the given sequence number (checkpoint resume).
    #[serde(skip)]
    After(u64),
}

/// A live read cursor over one partition.
///
/// Receivers are single-owner: the partition worker that opened the cursor
/// is the only caller. `recv_batch` returning an empty vector is normal --
/// it means the poll deadline lapsed with nothing to read.
#[async_trait]
pub trait PartitionReceiver: Send {
    /// Receives up to `max_events`, waiting at most `max_wait`.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::TransientNetwork`] on broker I/O failures;
    /// the worker retries per its policy.
    async fn recv_batch(
        &mut self,
        max_events: usize,
        max_wait: Duration,
    ) -> Result<Vec<Event>, ConnectorError>;

    /// Closes the cursor and releases broker resources.
    async fn close(&mut self);
}

/// A connection to one event hub within a consumer group.
#[async_trait]
pub trait EventHubSource: Send + Sync {
    /// Enumerates the hub's partition ids.
    ///
    /// Called once at supervisor startup; partition-set changes mid-run are
    /// not observed.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::TransientNetwork`] when the broker cannot
    /// be reached.
    async fn partition_ids(&self) -> Result<Vec<String>, ConnectorError>;

    /// Opens a read cursor over `partition_id` at `position`.
    ///
    /// `prefetch` is the broker-side read-ahead credit.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::TransientNetwork`] on connection failures
    /// and [`ConnectorError::Configuration`] for unknown partitions.
    async fn open_receiver(
        &self,
        partition_id: &str,
        position: StartPosition,
        prefetch: usize,
    ) -> Result<Box<dyn PartitionReceiver>, ConnectorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_start_position_is_latest() {
        assert_eq!(StartPosition::default(), StartPosition::Latest);
    }

    #[test]
    fn test_start_position_deserializes() {
        let p: StartPosition = serde_json::from_str("\"earliest\"").unwrap();
        assert_eq!(p, StartPosition::Earliest);
        let p: StartPosition = serde_json::from_str("\"latest\"").unwrap();
        assert_eq!(p, StartPosition::Latest);
    }
}
