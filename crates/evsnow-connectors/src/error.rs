//! Error types shared by all connectors.
//!
//! The variants follow the pipeline's retry taxonomy: transient kinds are
//! retried in place by the worker, permanent kinds stop the worker and mark
//! the mapping failed.

use std::time::Duration;

/// Coarse classification of a connector failure, consumed by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Broker or ingest I/O hiccup; safe to retry.
    Transient,
    /// A durable ack did not arrive in time; safe to retry, escalate on repeat.
    DurabilityTimeout,
    /// Checkpoint save failed; the batch stays un-checkpointed until a retry succeeds.
    CheckpointPersist,
    /// Schema mismatch, revoked auth, missing PIPE; fatal to the worker.
    Permanent,
    /// Invalid configuration detected before the loop starts.
    Configuration,
}

/// Errors from external system connectors.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    /// Broker or ingest network failure (connection reset, throttle, renewal).
    #[error("transient network failure: {0}")]
    TransientNetwork(String),

    /// Durable ack did not arrive within the configured deadline.
    #[error("ingest durability timeout after {elapsed:?} (channel {channel})")]
    DurabilityTimeout {
        /// Channel the batch was sent on.
        channel: String,
        /// How long the worker waited for the ack.
        elapsed: Duration,
    },

    /// SQL error while upserting a checkpoint row.
    #[error("checkpoint persist failure: {0}")]
    CheckpointPersist(String),

    /// The control table disappeared mid-run.
    #[error("control table missing: {0}")]
    ControlTableMissing(String),

    /// Schema mismatch, revoked credentials, deleted PIPE.
    #[error("permanent ingest failure: {0}")]
    PermanentIngest(String),

    /// An identifier failed validation before SQL interpolation.
    #[error("invalid Snowflake identifier: {0}")]
    InvalidIdentifier(String),

    /// Bad connection profile or mapping configuration.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl ConnectorError {
    /// Returns the retry classification for this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TransientNetwork(_) => ErrorKind::Transient,
            Self::DurabilityTimeout { .. } => ErrorKind::DurabilityTimeout,
            Self::CheckpointPersist(_) => ErrorKind::CheckpointPersist,
            Self::PermanentIngest(_) | Self::ControlTableMissing(_) => ErrorKind::Permanent,
            Self::InvalidIdentifier(_) | Self::Configuration(_) => ErrorKind::Configuration,
        }
    }

    /// Whether the failure is worth retrying against the same target.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Transient | ErrorKind::DurabilityTimeout | ErrorKind::CheckpointPersist
        )
    }
}

/// Validates a Snowflake identifier before it is interpolated into SQL.
///
/// Accepts letters, digits, underscores and dollar signs only. Everything
/// else is rejected rather than quoted.
///
/// # Errors
///
/// Returns [`ConnectorError::InvalidIdentifier`] for empty or unsafe input.
pub fn validate_identifier(ident: &str) -> Result<&str, ConnectorError> {
    if !ident.is_empty()
        && ident
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
    {
        Ok(ident)
    } else {
        Err(ConnectorError::InvalidIdentifier(ident.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_kinds() {
        assert!(ConnectorError::TransientNetwork("reset".into()).is_transient());
        assert!(ConnectorError::DurabilityTimeout {
            channel: "t_0_ab".into(),
            elapsed: Duration::from_secs(30),
        }
        .is_transient());
        assert!(ConnectorError::CheckpointPersist("lock timeout".into()).is_transient());
    }

    #[test]
    fn test_permanent_kinds() {
        assert!(!ConnectorError::PermanentIngest("pipe dropped".into()).is_transient());
        assert!(!ConnectorError::ControlTableMissing("INGESTION_STATUS".into()).is_transient());
        assert_eq!(
            ConnectorError::PermanentIngest("x".into()).kind(),
            ErrorKind::Permanent
        );
        assert_eq!(
            ConnectorError::ControlTableMissing("x".into()).kind(),
            ErrorKind::Permanent
        );
    }

    #[test]
    fn test_configuration_not_transient() {
        assert!(!ConnectorError::Configuration("missing pipe".into()).is_transient());
        assert!(!ConnectorError::InvalidIdentifier("a;b".into()).is_transient());
    }

    #[test]
    fn test_validate_identifier_accepts_safe() {
        assert!(validate_identifier("EVENTS_2024").is_ok());
        assert!(validate_identifier("ingest$raw").is_ok());
        assert!(validate_identifier("_private").is_ok());
    }

    #[test]
    fn test_validate_identifier_rejects_unsafe() {
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("events; drop table x").is_err());
        assert!(validate_identifier("a-b").is_err());
        assert!(validate_identifier("a.b").is_err());
    }

    #[test]
    fn test_display_includes_detail() {
        let e = ConnectorError::CheckpointPersist("MERGE failed".into());
        assert!(e.to_string().contains("MERGE failed"));
    }
}
