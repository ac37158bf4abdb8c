//! Error types for the pipeline engine.

use evsnow_connectors::error::ConnectorError;

/// Errors surfaced by supervisors and the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// A connector call failed outside a worker's retry loop.
    #[error("connector error: {0}")]
    Connector(#[from] ConnectorError),

    /// A mapping stopped because a worker raised a non-recoverable error.
    #[error("mapping '{mapping}' failed: {reason}")]
    MappingFailed {
        /// The mapping key, `hub->db.schema.table`.
        mapping: String,
        /// Terse description of the terminal failure.
        reason: String,
    },

    /// A worker task panicked or was aborted.
    #[error("worker task for partition '{partition}' ended abnormally: {detail}")]
    WorkerTask {
        /// Partition the task was driving.
        partition: String,
        /// Join error description.
        detail: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connector_error_converts() {
        let e: PipelineError = ConnectorError::TransientNetwork("reset".into()).into();
        assert!(matches!(e, PipelineError::Connector(_)));
    }

    #[test]
    fn test_mapping_failed_display() {
        let e = PipelineError::MappingFailed {
            mapping: "telemetry->RAW.PUBLIC.EVENTS".into(),
            reason: "permanent ingest failure".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("telemetry->RAW.PUBLIC.EVENTS"));
        assert!(msg.contains("permanent ingest failure"));
    }
}
