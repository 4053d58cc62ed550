//! # devgraph
//!
//! Folds point-in-time hardware inventory snapshots into a durable graph of device
//! records. Each snapshot is reconciled in two passes: devices are upserted by their
//! primary key (a canonical Redfish URI), then wired to their parents through the
//! weaker serial-number reference.

pub mod config;
pub mod discovery;
pub mod error;
pub mod index;
pub mod link;
pub mod merge;
pub mod model;
pub mod payload;
pub mod persistence;
pub mod reconcile;
pub mod store;

// Re-export main types for convenience
pub use config::DevgraphConfig;
pub use error::{ReconcileError, ReconcileResult};
pub use model::{
    DeviceId, DeviceRecord, DeviceSpec, Phase, ResourceKind, Snapshot, SnapshotId, SnapshotStatus,
};
pub use persistence::FileStore;
pub use reconcile::{Attempt, CancelToken, ReconcileReport};
pub use store::{DeviceStore, IdentityAllocator, InventoryStore, MemoryStore, SnapshotStore};

use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

/// Main API: submits snapshots and reconciles them against a store.
pub struct Reconciler {
    store: Arc<dyn InventoryStore>,
    cancel: CancelToken,
}

impl Reconciler {
    /// Create a reconciler over a store that serves every capability.
    pub fn with_store<S>(store: Arc<S>) -> Self
    where
        S: InventoryStore + 'static,
    {
        Self {
            store,
            cancel: CancelToken::new(),
        }
    }

    /// Use a caller-owned cancellation token for every attempt of this reconciler.
    ///
    /// A token stays cancelled, so once it fires every later attempt through
    /// this reconciler returns [`ReconcileError::Cancelled`]. Use
    /// [`Reconciler::reconcile_with`] to scope cancellation to one attempt.
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn store(&self) -> &dyn InventoryStore {
        self.store.as_ref()
    }

    /// Store a new snapshot in `Pending` and return its identity.
    pub fn submit(&self, name: Option<String>, raw_data: String) -> anyhow::Result<SnapshotId> {
        let uid = SnapshotId(self.store.allocate(ResourceKind::DiscoverySnapshot)?);
        let now = Utc::now();
        let snapshot = Snapshot {
            metadata: model::Metadata {
                name: name.unwrap_or_else(|| format!("snapshot-{}", now.timestamp())),
                uid: uid.clone(),
                created_at: now,
                updated_at: now,
            },
            raw_data,
            status: SnapshotStatus::default(),
        };
        self.store.create_snapshot(&snapshot)?;
        info!(snapshot = snapshot.name(), uid = %uid, "submitted snapshot");
        Ok(uid)
    }

    /// Reconcile one snapshot. Safe to call again for the same snapshot.
    ///
    /// A malformed payload is not an error here: it shows up as phase `Error`.
    /// Errors are reserved for attempts that should be retried (see
    /// [`ReconcileError::is_retryable`]) or unknown snapshots.
    pub fn reconcile(&self, id: &SnapshotId) -> ReconcileResult<SnapshotStatus> {
        self.reconcile_detailed(id).map(|attempt| attempt.status)
    }

    /// Like [`Reconciler::reconcile`], also returning the pass counts.
    pub fn reconcile_detailed(&self, id: &SnapshotId) -> ReconcileResult<Attempt> {
        self.reconcile_with(id, &self.cancel)
    }

    /// Run one attempt under its own cancellation token instead of the
    /// reconciler's.
    pub fn reconcile_with(&self, id: &SnapshotId, cancel: &CancelToken) -> ReconcileResult<Attempt> {
        reconcile::reconcile_snapshot(
            self.store.as_device_store(),
            self.store.as_allocator(),
            self.store.as_snapshot_store(),
            id,
            cancel,
        )
    }

    /// Run both passes over a payload without a snapshot resource.
    pub fn reconcile_payload(&self, raw: &[u8]) -> ReconcileResult<ReconcileReport> {
        let candidates = payload::parse_payload(raw)?;
        reconcile::run_passes(
            self.store.as_device_store(),
            self.store.as_allocator(),
            candidates,
            &self.cancel,
        )
    }

    /// Reconcile every snapshot that has not reached a terminal phase, oldest first.
    ///
    /// Stops early on cancellation; other errors are reported per snapshot.
    pub fn reconcile_pending(
        &self,
    ) -> anyhow::Result<Vec<(SnapshotId, ReconcileResult<SnapshotStatus>)>> {
        let mut pending: Vec<Snapshot> = self
            .store
            .list_snapshots()?
            .into_iter()
            .filter(|snapshot| !snapshot.status.phase.is_terminal())
            .collect();
        pending.sort_by(|a, b| {
            a.metadata
                .created_at
                .cmp(&b.metadata.created_at)
                .then_with(|| a.uid().cmp(b.uid()))
        });

        let mut results = Vec::with_capacity(pending.len());
        for snapshot in pending {
            let result = self.reconcile(snapshot.uid());
            if let Err(err) = &result {
                warn!(snapshot = snapshot.name(), error = %err, "snapshot not reconciled");
            }
            let cancelled = matches!(result, Err(ReconcileError::Cancelled));
            results.push((snapshot.uid().clone(), result));
            if cancelled {
                break;
            }
        }
        Ok(results)
    }
}
