use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::worker::machine::Stage;

/// Failure categories reported by pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network or endpoint unreachable, including stage timeouts.
    TransportFailure,
    /// Unusable input such as a non-audio file or an empty title.
    ValidationFailure,
    /// Duration probe failed. Recovered locally, never fails a job.
    MetadataProbeFailure,
    /// Writing the cached copy or the job state failed.
    PersistenceFailure,
    /// The remote endpoint answered with a business error.
    RemoteRejection,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::TransportFailure => "transport_failure",
            ErrorKind::ValidationFailure => "validation_failure",
            ErrorKind::MetadataProbeFailure => "metadata_probe_failure",
            ErrorKind::PersistenceFailure => "persistence_failure",
            ErrorKind::RemoteRejection => "remote_rejection",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "transport_failure" => Some(ErrorKind::TransportFailure),
            "validation_failure" => Some(ErrorKind::ValidationFailure),
            "metadata_probe_failure" => Some(ErrorKind::MetadataProbeFailure),
            "persistence_failure" => Some(ErrorKind::PersistenceFailure),
            "remote_rejection" => Some(ErrorKind::RemoteRejection),
            _ => None,
        }
    }

    /// Returns true for kinds the pipeline absorbs instead of failing the job.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ErrorKind::MetadataProbeFailure)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::TransportFailure => "TransportFailure",
            ErrorKind::ValidationFailure => "ValidationFailure",
            ErrorKind::MetadataProbeFailure => "MetadataProbeFailure",
            ErrorKind::PersistenceFailure => "PersistenceFailure",
            ErrorKind::RemoteRejection => "RemoteRejection",
        };
        f.write_str(name)
    }
}

/// Error returned by an adapter call for a single stage.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct StageError {
    pub kind: ErrorKind,
    pub message: String,
}

impl StageError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TransportFailure, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ValidationFailure, message)
    }

    pub fn probe(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MetadataProbeFailure, message)
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PersistenceFailure, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RemoteRejection, message)
    }

    /// A stage that exceeded its timeout is a transport failure.
    pub fn timed_out(stage: Stage, after: Duration) -> Self {
        Self::transport(format!(
            "{} timed out after {}s",
            stage,
            after.as_secs_f32()
        ))
    }

    pub fn is_recoverable(&self) -> bool {
        self.kind.is_recoverable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_kind_name() {
        let err = StageError::transport("upload endpoint unreachable");
        assert_eq!(
            err.to_string(),
            "TransportFailure: upload endpoint unreachable"
        );
    }

    #[test]
    fn test_kind_string_round_trip() {
        for kind in [
            ErrorKind::TransportFailure,
            ErrorKind::ValidationFailure,
            ErrorKind::MetadataProbeFailure,
            ErrorKind::PersistenceFailure,
            ErrorKind::RemoteRejection,
        ] {
            assert_eq!(ErrorKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ErrorKind::parse("bogus"), None);
    }

    #[test]
    fn test_only_probe_failures_are_recoverable() {
        assert!(StageError::probe("ffprobe missing").is_recoverable());
        assert!(!StageError::persistence("disk full").is_recoverable());
        assert!(!StageError::rejected("duplicate").is_recoverable());
    }

    #[test]
    fn test_timeout_is_transport_failure() {
        let err = StageError::timed_out(Stage::Uploading, Duration::from_secs(5));
        assert_eq!(err.kind, ErrorKind::TransportFailure);
        assert!(err.message.contains("uploading timed out after 5s"));
    }
}
