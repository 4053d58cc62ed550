//! Run-level reconciliation errors.
//!
//! Record-level failures never show up here; they are absorbed into the run report.

use crate::model::SnapshotId;
use crate::payload::PayloadError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The payload will never decode. The snapshot is moved to `Error`.
    #[error(transparent)]
    MalformedPayload(#[from] PayloadError),
    /// Listing existing devices failed; nothing was mutated.
    #[error("failed to build device index: {0:#}")]
    IndexBuild(#[source] anyhow::Error),
    #[error("snapshot {0} not found")]
    SnapshotNotFound(SnapshotId),
    /// The snapshot could not be read or its status could not be persisted.
    #[error("failed to access snapshot {id}: {source:#}")]
    SnapshotAccess {
        id: SnapshotId,
        #[source]
        source: anyhow::Error,
    },
    /// The caller cancelled the attempt. The snapshot stays `Processing`.
    #[error("reconciliation cancelled")]
    Cancelled,
}

impl ReconcileError {
    /// Whether a later attempt on the same snapshot may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReconcileError::IndexBuild(_)
                | ReconcileError::SnapshotAccess { .. }
                | ReconcileError::Cancelled
        )
    }
}

pub type ReconcileResult<T> = std::result::Result<T, ReconcileError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::parse_payload;

    #[test]
    fn test_retry_classification() {
        let malformed = ReconcileError::from(parse_payload(b"{").unwrap_err());
        assert!(!malformed.is_retryable());
        assert!(!ReconcileError::SnapshotNotFound(SnapshotId::from("dis-1")).is_retryable());
        assert!(ReconcileError::IndexBuild(anyhow::anyhow!("store offline")).is_retryable());
        assert!(ReconcileError::Cancelled.is_retryable());
        assert!(ReconcileError::SnapshotAccess {
            id: SnapshotId::from("dis-1"),
            source: anyhow::anyhow!("disk full"),
        }
        .is_retryable());
    }

    #[test]
    fn test_index_error_message() {
        let err = ReconcileError::IndexBuild(anyhow::anyhow!("store offline"));
        assert_eq!(err.to_string(), "failed to build device index: store offline");
    }
}
