//! # Reconciliation Driver
//!
//! Runs one attempt against a snapshot: parse, index, merge pass, link pass,
//! status summary. Decides which failures are terminal and which are retried.

use crate::error::{ReconcileError, ReconcileResult};
use crate::index::IdentityIndex;
use crate::link::{link_parents, LinkOutcome};
use crate::merge::{merge_candidates, MergeOutcome};
use crate::model::{DeviceSpec, Phase, Snapshot, SnapshotId, SnapshotStatus};
use crate::payload::parse_payload;
use crate::store::{DeviceStore, IdentityAllocator, SnapshotStore};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, info_span, warn};

pub const PROCESSING_MESSAGE: &str = "Reconciler has started processing the snapshot.";

/// Cooperative cancellation shared between a caller and an attempt.
///
/// Checked before every store write. Once cancelled it stays cancelled.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> ReconcileResult<()> {
        if self.is_cancelled() {
            Err(ReconcileError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Counts gathered over both passes of one attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub candidates: usize,
    pub created: usize,
    pub updated: usize,
    pub rejected: usize,
    pub failed: usize,
    pub links_updated: usize,
    pub links_unchanged: usize,
    pub unresolved_parents: usize,
    pub link_failures: usize,
}

impl ReconcileReport {
    fn from_passes(candidates: usize, merge: &MergeOutcome, link: &LinkOutcome) -> Self {
        Self {
            candidates,
            created: merge.created,
            updated: merge.updated,
            rejected: merge.rejected.len(),
            failed: merge.failures.len(),
            links_updated: link.links_updated,
            links_unchanged: link.unchanged,
            unresolved_parents: link.unresolved.len(),
            link_failures: link.failures.len(),
        }
    }

    /// Devices created or updated.
    pub fn processed(&self) -> usize {
        self.created + self.updated
    }

    /// Human-readable status message stored on the completed snapshot.
    pub fn summary(&self) -> String {
        let mut message = format!(
            "Snapshot processed. {} devices created/updated. {} parent links updated.",
            self.processed(),
            self.links_updated
        );
        let failed = self.failed + self.link_failures;
        if self.rejected + failed + self.unresolved_parents > 0 {
            message.push_str(&format!(
                " ({} rejected, {} failed, {} unresolved parents).",
                self.rejected, failed, self.unresolved_parents
            ));
        }
        message
    }
}

/// Run both passes over already parsed candidates.
///
/// Only a listing failure or cancellation comes back as an error; every
/// record-level problem is counted in the report.
pub fn run_passes(
    store: &dyn DeviceStore,
    allocator: &dyn IdentityAllocator,
    candidates: Vec<DeviceSpec>,
    cancel: &CancelToken,
) -> ReconcileResult<ReconcileReport> {
    let candidate_count = candidates.len();
    cancel.check()?;
    let mut index = IdentityIndex::build(store).map_err(ReconcileError::IndexBuild)?;
    info!(
        by_uri = index.primary_len(),
        by_serial = index.secondary_len(),
        "loaded existing devices"
    );

    let merged = {
        let _pass = info_span!("pass", n = 1).entered();
        merge_candidates(store, allocator, &mut index, candidates, cancel)?
    };
    let linked = {
        let _pass = info_span!("pass", n = 2).entered();
        info!("linking parent relationships");
        link_parents(store, &mut index, &merged.touched, cancel)?
    };

    Ok(ReconcileReport::from_passes(candidate_count, &merged, &linked))
}

/// Outcome of one attempt against a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub status: SnapshotStatus,
    /// Present when both passes ran in this attempt.
    pub report: Option<ReconcileReport>,
}

/// Drive one snapshot through its phases.
pub(crate) fn reconcile_snapshot(
    devices: &dyn DeviceStore,
    allocator: &dyn IdentityAllocator,
    snapshots: &dyn SnapshotStore,
    id: &SnapshotId,
    cancel: &CancelToken,
) -> ReconcileResult<Attempt> {
    let snapshot = load_snapshot(snapshots, id)?;
    let _span = info_span!("reconcile", snapshot = snapshot.name()).entered();

    if snapshot.status.phase.is_terminal() {
        info!(phase = %snapshot.status.phase, "already finished, skipping");
        return Ok(Attempt {
            status: snapshot.status,
            report: None,
        });
    }

    info!("starting reconciliation");
    write_status(snapshots, id, SnapshotStatus::new(Phase::Processing, PROCESSING_MESSAGE))?;

    let candidates = match parse_payload(snapshot.raw_data.as_bytes()) {
        Ok(candidates) => candidates,
        Err(err) => {
            error!(error = %err, "snapshot payload is malformed");
            let status = SnapshotStatus::new(Phase::Error, err.to_string());
            write_status(snapshots, id, status.clone())?;
            return Ok(Attempt {
                status,
                report: None,
            });
        }
    };

    let report = match run_passes(devices, allocator, candidates, cancel) {
        Ok(report) => report,
        Err(err) => {
            warn!(error = %err, retryable = err.is_retryable(), "attempt aborted, snapshot left in Processing");
            return Err(err);
        }
    };

    let status = SnapshotStatus::new(Phase::Completed, report.summary());
    write_status(snapshots, id, status.clone())?;
    info!(
        processed = report.processed(),
        links_updated = report.links_updated,
        "successfully reconciled"
    );
    Ok(Attempt {
        status,
        report: Some(report),
    })
}

fn load_snapshot(snapshots: &dyn SnapshotStore, id: &SnapshotId) -> ReconcileResult<Snapshot> {
    snapshots
        .get_snapshot(id)
        .map_err(|source| ReconcileError::SnapshotAccess {
            id: id.clone(),
            source,
        })?
        .ok_or_else(|| ReconcileError::SnapshotNotFound(id.clone()))
}

fn write_status(
    snapshots: &dyn SnapshotStore,
    id: &SnapshotId,
    status: SnapshotStatus,
) -> ReconcileResult<()> {
    snapshots
        .update_snapshot_status(id, &status)
        .map_err(|source| ReconcileError::SnapshotAccess {
            id: id.clone(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_message() {
        let report = ReconcileReport {
            candidates: 3,
            created: 3,
            links_updated: 1,
            ..Default::default()
        };
        assert_eq!(
            report.summary(),
            "Snapshot processed. 3 devices created/updated. 1 parent links updated."
        );

        let noisy = ReconcileReport {
            candidates: 5,
            updated: 2,
            rejected: 1,
            failed: 1,
            link_failures: 1,
            unresolved_parents: 2,
            ..Default::default()
        };
        assert_eq!(
            noisy.summary(),
            "Snapshot processed. 2 devices created/updated. 0 parent links updated. \
             (1 rejected, 2 failed, 2 unresolved parents)."
        );
    }

    #[test]
    fn test_cancel_token_is_shared() {
        let token = CancelToken::new();
        let handle = token.clone();
        assert!(token.check().is_ok());
        handle.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(ReconcileError::Cancelled)));
    }
}
