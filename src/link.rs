//! # Link Pass
//!
//! Second pass of a reconciliation attempt: wire each touched device to its parent,
//! found through the parent's serial number. Runs only after every upsert of the
//! merge pass, so a parent listed after its child still resolves.

use crate::error::ReconcileResult;
use crate::index::IdentityIndex;
use crate::model::DeviceId;
use crate::reconcile::CancelToken;
use crate::store::DeviceStore;
use chrono::Utc;
use tracing::{debug, error, info, warn};

/// A parent link that could not be persisted. Never fatal to the run.
#[derive(Debug)]
pub struct LinkFailure {
    pub child: DeviceId,
    pub parent: DeviceId,
    pub error: anyhow::Error,
}

/// Result of the link pass.
#[derive(Debug, Default)]
pub struct LinkOutcome {
    pub links_updated: usize,
    /// Links that were already correct and needed no write.
    pub unchanged: usize,
    /// Devices declaring no parent.
    pub roots: usize,
    /// Parent references that matched no device, or matched the device itself.
    pub unresolved: Vec<DeviceId>,
    pub failures: Vec<LinkFailure>,
}

/// Resolve and persist parent links for `touched` devices.
pub fn link_parents(
    store: &dyn DeviceStore,
    index: &mut IdentityIndex,
    touched: &[DeviceId],
    cancel: &CancelToken,
) -> ReconcileResult<LinkOutcome> {
    let mut outcome = LinkOutcome::default();

    for uid in touched {
        let Some(child) = index.get(uid) else {
            continue;
        };
        let Some(parent_serial) = child.spec.parent_ref() else {
            outcome.roots += 1;
            continue;
        };

        let Some(parent) = index.by_secondary_key(parent_serial) else {
            warn!(
                uid = %uid,
                parent_serial,
                serial = child.spec.serial_number.as_str(),
                "parent device not found"
            );
            outcome.unresolved.push(uid.clone());
            continue;
        };
        let parent_uid = parent.uid().clone();

        if &parent_uid == uid {
            warn!(uid = %uid, parent_serial, "device references itself as parent, not linking");
            outcome.unresolved.push(uid.clone());
            continue;
        }
        if child.spec.parent_id.as_ref() == Some(&parent_uid) {
            debug!(uid = %uid, parent = %parent_uid, "parent link already current");
            outcome.unchanged += 1;
            continue;
        }

        cancel.check()?;
        info!(
            child = child.name(),
            uid = %uid,
            parent = parent.name(),
            parent_uid = %parent_uid,
            "linking device to parent"
        );

        let mut linked = child.clone();
        linked.spec.parent_id = Some(parent_uid.clone());
        linked.metadata.updated_at = Utc::now();

        match store.update_device(&linked) {
            Ok(()) => {
                outcome.links_updated += 1;
                index.insert(linked);
            }
            Err(err) => {
                error!(uid = %uid, parent = %parent_uid, error = %err, "failed to update parent link");
                outcome.failures.push(LinkFailure {
                    child: uid.clone(),
                    parent: parent_uid,
                    error: err,
                });
            }
        }
    }

    debug!(
        links_updated = outcome.links_updated,
        unchanged = outcome.unchanged,
        unresolved = outcome.unresolved.len(),
        failed = outcome.failures.len(),
        "link pass finished"
    );
    Ok(outcome)
}
