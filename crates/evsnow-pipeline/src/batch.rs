//! Per-partition batch assembly under size and time bounds.
//!
//! One [`BatchAssembler`] per worker, single-owner. A batch becomes ready
//! when the buffer reaches `max_batch_size` events or the first buffered
//! event has been waiting for `max_wait`; shutdown flushes whatever is
//! buffered regardless of thresholds.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use evsnow_connectors::event::Event;

use crate::config::BatchingConfig;

/// Invariant violations raised by [`BatchAssembler::add`].
///
/// These indicate a broken broker contract or a caller bug; workers treat
/// them as fatal.
#[derive(Debug, thiserror::Error)]
pub enum AssemblyError {
    /// Event belongs to a different partition than the assembler.
    #[error("event for partition '{got}' fed to assembler for '{expected}'")]
    PartitionMismatch {
        /// Partition the assembler owns.
        expected: String,
        /// Partition carried by the event.
        got: String,
    },

    /// Sequence numbers must be strictly increasing within a partition.
    #[error("non-monotonic sequence {got} after {last} on partition '{partition}'")]
    NonMonotonicSequence {
        /// Partition the regression happened on.
        partition: String,
        /// Highest sequence seen so far.
        last: u64,
        /// Offending sequence.
        got: u64,
    },

    /// The caller added past `max_batch_size` without taking the batch.
    #[error("assembler for partition '{partition}' is full ({capacity} events)")]
    BufferFull {
        /// Partition the assembler owns.
        partition: String,
        /// Configured capacity.
        capacity: usize,
    },
}

/// An ordered run of events from one partition, ready for ingestion.
#[derive(Debug, Clone)]
pub struct Batch {
    events: Vec<Event>,
    partition_id: String,
    last_sequence: u64,
    first_enqueued: DateTime<Utc>,
    last_enqueued: DateTime<Utc>,
    assembled_at: Instant,
}

impl Batch {
    /// The events, in broker order.
    #[must_use]
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Partition every event belongs to.
    #[must_use]
    pub fn partition_id(&self) -> &str {
        &self.partition_id
    }

    /// Sequence of the last event; the candidate checkpoint.
    #[must_use]
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    /// Broker offset of the last event.
    #[must_use]
    pub fn last_offset(&self) -> &str {
        &self.events[self.events.len() - 1].offset
    }

    /// Event count; never zero.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Always `false`; batches are non-empty by construction.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Earliest enqueued timestamp in the batch.
    #[must_use]
    pub fn first_enqueued(&self) -> DateTime<Utc> {
        self.first_enqueued
    }

    /// Latest enqueued timestamp in the batch.
    #[must_use]
    pub fn last_enqueued(&self) -> DateTime<Utc> {
        self.last_enqueued
    }

    /// When assembly of this batch started.
    #[must_use]
    pub fn assembled_at(&self) -> Instant {
        self.assembled_at
    }

    /// Total payload bytes across events.
    #[must_use]
    pub fn payload_bytes(&self) -> u64 {
        self.events.iter().map(|e| e.body.len() as u64).sum()
    }
}

/// Accumulates one partition's events until a size or time threshold.
#[derive(Debug)]
pub struct BatchAssembler {
    partition_id: String,
    limits: BatchingConfig,
    buffer: Vec<Event>,
    opened_at: Option<Instant>,
    high_water: Option<u64>,
}

impl BatchAssembler {
    /// Creates an assembler for `partition_id`.
    ///
    /// `high_water` seeds the monotonicity check, typically from the
    /// partition's checkpoint.
    #[must_use]
    pub fn new(partition_id: impl Into<String>, limits: BatchingConfig, high_water: Option<u64>) -> Self {
        Self {
            partition_id: partition_id.into(),
            limits,
            buffer: Vec::new(),
            opened_at: None,
            high_water,
        }
    }

    /// Buffers `event`, returning `true` when the batch is ready to take.
    ///
    /// # Errors
    ///
    /// Returns [`AssemblyError`] when the event violates the partition,
    /// ordering or capacity invariants.
    pub fn add(&mut self, event: Event) -> Result<bool, AssemblyError> {
        if event.partition_id != self.partition_id {
            return Err(AssemblyError::PartitionMismatch {
                expected: self.partition_id.clone(),
                got: event.partition_id,
            });
        }
        if let Some(last) = self.high_water {
            if event.sequence_number <= last {
                return Err(AssemblyError::NonMonotonicSequence {
                    partition: self.partition_id.clone(),
                    last,
                    got: event.sequence_number,
                });
            }
        }
        if self.buffer.len() >= self.limits.max_batch_size {
            return Err(AssemblyError::BufferFull {
                partition: self.partition_id.clone(),
                capacity: self.limits.max_batch_size,
            });
        }

        if self.buffer.is_empty() {
            self.opened_at = Some(Instant::now());
        }
        self.high_water = Some(event.sequence_number);
        self.buffer.push(event);
        Ok(self.is_ready())
    }

    /// Whether the buffer has hit the size or age threshold.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        if self.buffer.len() >= self.limits.max_batch_size {
            return true;
        }
        self.opened_at
            .is_some_and(|t| t.elapsed() >= self.limits.max_wait)
    }

    /// Events the buffer can still hold.
    #[must_use]
    pub fn remaining_capacity(&self) -> usize {
        self.limits.max_batch_size.saturating_sub(self.buffer.len())
    }

    /// Time left until the age threshold forces a flush; `None` when empty.
    #[must_use]
    pub fn time_until_flush(&self) -> Option<Duration> {
        self.opened_at
            .map(|t| self.limits.max_wait.saturating_sub(t.elapsed()))
    }

    /// Number of buffered events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Removes and returns the buffered batch, resetting assembler state.
    ///
    /// Returns `None` when nothing is buffered; a second `take` in a row
    /// therefore returns `None`.
    pub fn take(&mut self) -> Option<Batch> {
        if self.buffer.is_empty() {
            return None;
        }
        let events = std::mem::take(&mut self.buffer);
        let assembled_at = self.opened_at.take().unwrap_or_else(Instant::now);

        let last_sequence = events[events.len() - 1].sequence_number;
        let first_enqueued = events
            .iter()
            .map(|e| e.enqueued_time)
            .min()
            .unwrap_or_else(Utc::now);
        let last_enqueued = events
            .iter()
            .map(|e| e.enqueued_time)
            .max()
            .unwrap_or_else(Utc::now);

        Some(Batch {
            partition_id: self.partition_id.clone(),
            last_sequence,
            first_enqueued,
            last_enqueued,
            assembled_at,
            events,
        })
    }

    /// Returns the buffered events regardless of thresholds; the shutdown
    /// flush. Empty buffer is a no-op.
    pub fn flush_if_nonempty(&mut self) -> Option<Batch> {
        self.take()
    }
}
