//! # evsnow Connectors
//!
//! External system connectors for streaming Azure Event Hubs data into
//! Snowflake: the broker source abstraction, the Snowpipe Streaming ingest
//! client, and the checkpoint store backed by a Snowflake hybrid table.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

/// Connector error taxonomy
pub mod error;

/// Event data model and property values
pub mod event;

/// Event Hubs source abstraction
pub mod source;

/// Streaming ingest client and channel traits
pub mod ingest;

/// Snowflake transport - auth, SQL sessions, streaming ingest
pub mod snowflake;

/// Per-partition checkpoint store
pub mod checkpoint;

/// In-memory implementations for tests and harnesses
pub mod testing;
