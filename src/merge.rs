//! # Merge Pass
//!
//! First pass of a reconciliation attempt: upsert every candidate keyed by its
//! primary key. Records touched here are the only ones the link pass looks at.

use crate::error::ReconcileResult;
use crate::index::IdentityIndex;
use crate::model::{DeviceId, DeviceRecord, DeviceSpec, Metadata, ResourceKind};
use crate::reconcile::CancelToken;
use crate::store::{DeviceStore, IdentityAllocator};
use chrono::Utc;
use hashbrown::HashSet;
use tracing::{debug, error, info, warn};

/// A candidate that could not be folded into the store. Never fatal to the run.
#[derive(Debug)]
pub enum RecordFailure {
    Allocation {
        primary_key: String,
        error: anyhow::Error,
    },
    Create {
        primary_key: String,
        error: anyhow::Error,
    },
    Update {
        primary_key: String,
        uid: DeviceId,
        error: anyhow::Error,
    },
}

impl RecordFailure {
    pub fn primary_key(&self) -> &str {
        match self {
            RecordFailure::Allocation { primary_key, .. }
            | RecordFailure::Create { primary_key, .. }
            | RecordFailure::Update { primary_key, .. } => primary_key,
        }
    }
}

/// Result of the merge pass.
#[derive(Debug, Default)]
pub struct MergeOutcome {
    /// Identities created or updated, in first-touch order, without duplicates.
    pub touched: Vec<DeviceId>,
    pub created: usize,
    pub updated: usize,
    /// Input positions of candidates without a usable primary key.
    pub rejected: Vec<usize>,
    pub failures: Vec<RecordFailure>,
}

impl MergeOutcome {
    /// Successful creates and updates, counting repeated keys each time.
    pub fn processed(&self) -> usize {
        self.created + self.updated
    }
}

/// Upsert `candidates` in input order.
///
/// `index` is updated in place so that later candidates and the link pass see
/// every record created here.
pub fn merge_candidates(
    store: &dyn DeviceStore,
    allocator: &dyn IdentityAllocator,
    index: &mut IdentityIndex,
    candidates: Vec<DeviceSpec>,
    cancel: &CancelToken,
) -> ReconcileResult<MergeOutcome> {
    let mut outcome = MergeOutcome::default();
    let mut seen = HashSet::new();

    for (position, mut candidate) in candidates.into_iter().enumerate() {
        let Some(primary_key) = candidate.primary_key().map(str::to_string) else {
            warn!(position, "skipping device, missing primary key");
            outcome.rejected.push(position);
            continue;
        };
        cancel.check()?;

        // Promote a legacy key so stored records always carry the typed field.
        candidate.primary_key = Some(primary_key.clone());

        let existing = index.by_primary_key(&primary_key).cloned();
        let stored = match existing {
            None => create_device(store, allocator, candidate, &primary_key),
            Some(existing) => update_device(store, existing, candidate, &primary_key),
        };

        match stored {
            Ok((record, created)) => {
                if created {
                    outcome.created += 1;
                } else {
                    outcome.updated += 1;
                }
                if seen.insert(record.uid().clone()) {
                    outcome.touched.push(record.uid().clone());
                }
                index.insert(record);
            }
            Err(failure) => outcome.failures.push(failure),
        }
    }

    debug!(
        created = outcome.created,
        updated = outcome.updated,
        rejected = outcome.rejected.len(),
        failed = outcome.failures.len(),
        "merge pass finished"
    );
    Ok(outcome)
}

fn create_device(
    store: &dyn DeviceStore,
    allocator: &dyn IdentityAllocator,
    mut candidate: DeviceSpec,
    primary_key: &str,
) -> Result<(DeviceRecord, bool), RecordFailure> {
    info!(uri = primary_key, "creating new device");
    let uid = allocator.allocate(ResourceKind::Device).map_err(|error| {
        error!(uri = primary_key, error = %error, "failed to allocate device identity");
        RecordFailure::Allocation {
            primary_key: primary_key.to_string(),
            error,
        }
    })?;

    // A candidate never supplies its own parent link; only the link pass does.
    candidate.parent_id = None;
    let now = Utc::now();
    let record = DeviceRecord {
        metadata: Metadata {
            uid: DeviceId(uid),
            name: primary_key.to_string(),
            created_at: now,
            updated_at: now,
        },
        spec: candidate,
    };

    store.create_device(&record).map_err(|error| {
        error!(uri = primary_key, error = %error, "failed to create device");
        RecordFailure::Create {
            primary_key: primary_key.to_string(),
            error,
        }
    })?;
    Ok((record, true))
}

fn update_device(
    store: &dyn DeviceStore,
    existing: DeviceRecord,
    mut candidate: DeviceSpec,
    primary_key: &str,
) -> Result<(DeviceRecord, bool), RecordFailure> {
    info!(uri = primary_key, uid = %existing.uid(), "updating existing device");
    candidate.parent_id = existing.spec.parent_id.clone();

    let mut record = existing;
    record.spec = candidate;
    record.metadata.updated_at = Utc::now();

    store.update_device(&record).map_err(|error| {
        error!(uri = primary_key, uid = %record.uid(), error = %error, "failed to update device");
        RecordFailure::Update {
            primary_key: primary_key.to_string(),
            uid: record.uid().clone(),
            error,
        }
    })?;
    Ok((record, false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn candidate(key: &str, serial: &str, parent: &str) -> DeviceSpec {
        DeviceSpec {
            primary_key: Some(key.to_string()),
            serial_number: serial.to_string(),
            parent_serial_number: parent.to_string(),
            ..Default::default()
        }
    }

    fn merge(store: &MemoryStore, candidates: Vec<DeviceSpec>) -> (IdentityIndex, MergeOutcome) {
        let mut index = IdentityIndex::build(store).unwrap();
        let outcome =
            merge_candidates(store, store, &mut index, candidates, &CancelToken::new()).unwrap();
        (index, outcome)
    }

    #[test]
    fn test_creates_then_updates() {
        let store = MemoryStore::new();
        let (_, first) = merge(&store, vec![candidate("/Systems/1", "SN1", "")]);
        assert_eq!((first.created, first.updated), (1, 0));

        let created = store.device_by_primary_key("/Systems/1").unwrap();
        assert_eq!(created.metadata.created_at, created.metadata.updated_at);
        assert_eq!(created.name(), "/Systems/1");

        let (_, second) = merge(&store, vec![candidate("/Systems/1", "SN1-B", "")]);
        assert_eq!((second.created, second.updated), (0, 1));
        assert_eq!(store.len(), 1);

        let updated = store.device_by_primary_key("/Systems/1").unwrap();
        assert_eq!(updated.uid(), created.uid());
        assert_eq!(updated.metadata.created_at, created.metadata.created_at);
        assert!(updated.metadata.updated_at >= created.metadata.updated_at);
        assert_eq!(updated.spec.serial_number, "SN1-B");
    }

    #[test]
    fn test_missing_primary_key_is_rejected() {
        let store = MemoryStore::new();
        let mut keyless = candidate("", "SN0", "");
        keyless.primary_key = None;
        let (_, outcome) = merge(&store, vec![keyless, candidate("/Systems/1", "", "")]);
        assert_eq!(outcome.rejected, vec![0]);
        assert_eq!(outcome.processed(), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_duplicate_key_in_one_batch_updates_first() {
        let store = MemoryStore::new();
        let (index, outcome) = merge(
            &store,
            vec![candidate("/Systems/1", "A", ""), candidate("/Systems/1", "B", "")],
        );
        assert_eq!((outcome.created, outcome.updated), (1, 1));
        assert_eq!(outcome.touched.len(), 1);
        assert_eq!(store.len(), 1);
        assert!(index.by_secondary_key("A").is_none());
        assert!(index.by_secondary_key("B").is_some());
    }

    #[test]
    fn test_update_carries_parent_link() {
        let store = MemoryStore::new();
        merge(&store, vec![candidate("/Systems/1/Memory/1", "", "SN1")]);
        let mut linked = store.device_by_primary_key("/Systems/1/Memory/1").unwrap();
        linked.spec.parent_id = Some(DeviceId::from("dev-parent"));
        store.insert_device(linked);

        let mut refreshed = candidate("/Systems/1/Memory/1", "", "");
        refreshed.parent_id = Some(DeviceId::from("dev-bogus"));
        merge(&store, vec![refreshed]);

        let after = store.device_by_primary_key("/Systems/1/Memory/1").unwrap();
        assert_eq!(after.spec.parent_id, Some(DeviceId::from("dev-parent")));
        assert_eq!(after.spec.parent_serial_number, "");
    }

    #[test]
    fn test_create_ignores_candidate_parent_id() {
        let store = MemoryStore::new();
        let mut spec = candidate("/Systems/1", "", "");
        spec.parent_id = Some(DeviceId::from("dev-nowhere"));
        merge(&store, vec![spec]);
        assert_eq!(store.device_by_primary_key("/Systems/1").unwrap().spec.parent_id, None);
    }

    #[test]
    fn test_write_failures_are_absorbed() {
        let store = MemoryStore::new();
        store.fail_writes_for("/Systems/2");
        let (index, outcome) = merge(
            &store,
            vec![
                candidate("/Systems/1", "", ""),
                candidate("/Systems/2", "SN2", ""),
                candidate("/Systems/3", "", ""),
            ],
        );
        assert_eq!(outcome.created, 2);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].primary_key(), "/Systems/2");
        assert!(matches!(outcome.failures[0], RecordFailure::Create { .. }));
        assert!(index.by_primary_key("/Systems/2").is_none());
        assert!(index.by_secondary_key("SN2").is_none());
        assert_eq!(outcome.touched.len(), 2);
    }

    #[test]
    fn test_allocation_failure_is_absorbed() {
        let store = MemoryStore::new();
        store.fail_next_allocations(1);
        let (_, outcome) = merge(
            &store,
            vec![candidate("/Systems/1", "", ""), candidate("/Systems/2", "", "")],
        );
        assert!(matches!(outcome.failures[0], RecordFailure::Allocation { .. }));
        assert_eq!(outcome.created, 1);
        assert!(store.device_by_primary_key("/Systems/2").is_some());
    }

    #[test]
    fn test_cancelled_before_first_write() {
        let store = MemoryStore::new();
        let mut index = IdentityIndex::new();
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = merge_candidates(
            &store,
            &store,
            &mut index,
            vec![candidate("/Systems/1", "", "")],
            &cancel,
        );
        assert!(matches!(result, Err(crate::ReconcileError::Cancelled)));
        assert!(store.is_empty());
    }
}
