//! # Indexing Module
//!
//! Attempt-local lookup structures over the existing device records: one by
//! primary key for create-vs-update matching, one by secondary key for parent
//! resolution. Both point into a single arena of records keyed by identity.

use crate::model::{DeviceId, DeviceRecord};
use crate::store::DeviceStore;
use anyhow::Result;
use hashbrown::HashMap;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default)]
pub struct IdentityIndex {
    records: HashMap<DeviceId, DeviceRecord>,
    by_primary_key: HashMap<String, DeviceId>,
    by_secondary_key: HashMap<String, DeviceId>,
}

impl IdentityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// List every device in the store and index it.
    ///
    /// A listing failure is returned as-is; the caller treats it as transient.
    pub fn build(store: &dyn DeviceStore) -> Result<Self> {
        let records = store.list_devices()?;
        Ok(Self::from_records(records))
    }

    /// Index an already listed set of records.
    pub fn from_records(records: Vec<DeviceRecord>) -> Self {
        let mut index = Self::new();
        for record in records {
            if record.spec.primary_key().is_none() {
                warn!(uid = %record.uid(), "device has no primary key, excluded from primary index");
            }
            index.insert(record);
        }
        index
    }

    /// Insert or replace a record and refresh both key mappings for it.
    ///
    /// Records without a primary key only land in the secondary index.
    pub fn insert(&mut self, record: DeviceRecord) {
        let uid = record.uid().clone();
        if let Some(previous) = self.records.get(&uid) {
            let previous_serial = previous.spec.secondary_key().map(str::to_string);
            if let Some(serial) = previous_serial {
                if record.spec.secondary_key() != Some(serial.as_str())
                    && self.by_secondary_key.get(&serial) == Some(&uid)
                {
                    self.by_secondary_key.remove(&serial);
                }
            }
        }

        if let Some(key) = record.spec.primary_key() {
            self.by_primary_key.insert(key.to_string(), uid.clone());
        }
        if let Some(serial) = record.spec.secondary_key() {
            if let Some(existing) = self.by_secondary_key.insert(serial.to_string(), uid.clone()) {
                if existing != uid {
                    debug!(serial, replaced = %existing, uid = %uid, "duplicate serial number, last one wins");
                }
            }
        }
        self.records.insert(uid, record);
    }

    pub fn get(&self, uid: &DeviceId) -> Option<&DeviceRecord> {
        self.records.get(uid)
    }

    pub fn get_mut(&mut self, uid: &DeviceId) -> Option<&mut DeviceRecord> {
        self.records.get_mut(uid)
    }

    pub fn by_primary_key(&self, key: &str) -> Option<&DeviceRecord> {
        self.by_primary_key
            .get(key)
            .and_then(|uid| self.records.get(uid))
    }

    pub fn by_secondary_key(&self, serial: &str) -> Option<&DeviceRecord> {
        self.by_secondary_key
            .get(serial)
            .and_then(|uid| self.records.get(uid))
    }

    pub fn primary_len(&self) -> usize {
        self.by_primary_key.len()
    }

    pub fn secondary_len(&self) -> usize {
        self.by_secondary_key.len()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeviceSpec, Metadata, LEGACY_PRIMARY_KEY_ATTR};
    use crate::store::MemoryStore;
    use chrono::Utc;
    use serde_json::json;

    fn record(uid: &str, key: Option<&str>, serial: &str) -> DeviceRecord {
        let now = Utc::now();
        DeviceRecord {
            metadata: Metadata {
                uid: DeviceId::from(uid),
                name: key.unwrap_or_default().to_string(),
                created_at: now,
                updated_at: now,
            },
            spec: DeviceSpec {
                primary_key: key.map(str::to_string),
                serial_number: serial.to_string(),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_build_indexes_both_keys() {
        let store = MemoryStore::new();
        store.insert_device(record("dev-1", Some("/Systems/1"), "SN1"));
        store.insert_device(record("dev-2", Some("/Systems/1/Memory/DIMM0"), ""));

        let index = IdentityIndex::build(&store).unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.primary_len(), 2);
        assert_eq!(index.secondary_len(), 1);
        assert_eq!(
            index.by_primary_key("/Systems/1").unwrap().uid().as_str(),
            "dev-1"
        );
        assert_eq!(index.by_secondary_key("SN1").unwrap().uid().as_str(), "dev-1");
        assert!(index.by_secondary_key("").is_none());
    }

    #[test]
    fn test_records_without_primary_key_are_excluded() {
        let mut legacy = record("dev-2", None, "SN2");
        legacy
            .spec
            .attributes
            .insert(LEGACY_PRIMARY_KEY_ATTR.to_string(), json!("/Systems/2"));

        let index = IdentityIndex::from_records(vec![record("dev-1", None, "SN1"), legacy]);
        assert_eq!(index.primary_len(), 1);
        assert!(index.by_primary_key("/Systems/2").is_some());
        assert_eq!(index.by_secondary_key("SN1").unwrap().uid().as_str(), "dev-1");
    }

    #[test]
    fn test_duplicate_serial_last_write_wins() {
        let index = IdentityIndex::from_records(vec![
            record("dev-1", Some("/a"), "SN"),
            record("dev-2", Some("/b"), "SN"),
        ]);
        assert_eq!(index.secondary_len(), 1);
        assert_eq!(index.by_secondary_key("SN").unwrap().uid().as_str(), "dev-2");
    }

    #[test]
    fn test_reinsert_moves_secondary_key() {
        let mut index = IdentityIndex::from_records(vec![record("dev-1", Some("/a"), "OLD")]);
        index.insert(record("dev-1", Some("/a"), "NEW"));
        assert!(index.by_secondary_key("OLD").is_none());
        assert_eq!(index.by_secondary_key("NEW").unwrap().uid().as_str(), "dev-1");
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_build_propagates_listing_failure() {
        let store = MemoryStore::new();
        store.fail_next_lists(1);
        assert!(IdentityIndex::build(&store).is_err());
    }
}
