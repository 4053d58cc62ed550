//! # Store Module
//!
//! Capabilities the reconciliation engine consumes from its environment, plus an
//! in-memory implementation of all of them.

use crate::model::{DeviceId, DeviceRecord, ResourceKind, Snapshot, SnapshotId, SnapshotStatus};
use anyhow::{anyhow, bail, Result};
use hashbrown::{HashMap, HashSet};
use parking_lot::{Mutex, RwLock};

/// Durable record store for devices.
///
/// Every call is independently atomic. There are no transactions.
pub trait DeviceStore: Send + Sync {
    /// List every device record.
    fn list_devices(&self) -> Result<Vec<DeviceRecord>>;

    /// Persist a new record. Fails if the identity already exists.
    fn create_device(&self, record: &DeviceRecord) -> Result<()>;

    /// Replace an existing record. Fails if the identity is unknown.
    fn update_device(&self, record: &DeviceRecord) -> Result<()>;
}

/// Hands out durable identities, unique per kind.
pub trait IdentityAllocator: Send + Sync {
    fn allocate(&self, kind: ResourceKind) -> Result<String>;
}

/// Persistence of snapshots and their status.
pub trait SnapshotStore: Send + Sync {
    fn get_snapshot(&self, id: &SnapshotId) -> Result<Option<Snapshot>>;

    fn create_snapshot(&self, snapshot: &Snapshot) -> Result<()>;

    fn update_snapshot_status(&self, id: &SnapshotId, status: &SnapshotStatus) -> Result<()>;

    fn list_snapshots(&self) -> Result<Vec<Snapshot>>;
}

/// Build a fresh identity for `kind`: its prefix plus random hex.
pub fn generate_identity(kind: ResourceKind) -> String {
    let token = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", kind.prefix(), &token[..12])
}

/// A store that serves every capability the driver needs.
pub trait InventoryStore: DeviceStore + IdentityAllocator + SnapshotStore {
    fn as_device_store(&self) -> &dyn DeviceStore;

    fn as_allocator(&self) -> &dyn IdentityAllocator;

    fn as_snapshot_store(&self) -> &dyn SnapshotStore;
}

impl<T> InventoryStore for T
where
    T: DeviceStore + IdentityAllocator + SnapshotStore,
{
    fn as_device_store(&self) -> &dyn DeviceStore {
        self
    }

    fn as_allocator(&self) -> &dyn IdentityAllocator {
        self
    }

    fn as_snapshot_store(&self) -> &dyn SnapshotStore {
        self
    }
}

#[derive(Debug, Default)]
struct Faults {
    failing_lists: usize,
    failing_primary_keys: HashSet<String>,
    failing_allocations: usize,
}

/// In-memory store: devices, snapshots, and identity allocation.
///
/// Also records write counts and can inject faults, which the engine tests rely on.
#[derive(Debug, Default)]
pub struct MemoryStore {
    devices: RwLock<HashMap<DeviceId, DeviceRecord>>,
    snapshots: RwLock<HashMap<SnapshotId, Snapshot>>,
    faults: Mutex<Faults>,
    writes: Mutex<WriteCounts>,
}

/// Number of device writes the store has accepted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteCounts {
    pub creates: usize,
    pub updates: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a device record without counting it as a write.
    pub fn insert_device(&self, record: DeviceRecord) {
        self.devices.write().insert(record.uid().clone(), record);
    }

    pub fn device(&self, id: &DeviceId) -> Option<DeviceRecord> {
        self.devices.read().get(id).cloned()
    }

    /// Look a device up by the primary key it carries.
    pub fn device_by_primary_key(&self, key: &str) -> Option<DeviceRecord> {
        self.devices
            .read()
            .values()
            .find(|record| record.spec.primary_key() == Some(key))
            .cloned()
    }

    /// Devices sorted by identity, for stable comparisons.
    pub fn devices(&self) -> Vec<DeviceRecord> {
        let mut devices: Vec<_> = self.devices.read().values().cloned().collect();
        devices.sort_by(|a, b| a.uid().cmp(b.uid()));
        devices
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }

    pub fn write_counts(&self) -> WriteCounts {
        *self.writes.lock()
    }

    /// Make the next `count` listing calls fail.
    pub fn fail_next_lists(&self, count: usize) {
        self.faults.lock().failing_lists = count;
    }

    /// Make every create/update of a record carrying `key` fail.
    pub fn fail_writes_for(&self, key: impl Into<String>) {
        self.faults.lock().failing_primary_keys.insert(key.into());
    }

    /// Make the next `count` identity allocations fail.
    pub fn fail_next_allocations(&self, count: usize) {
        self.faults.lock().failing_allocations = count;
    }

    fn check_write_fault(&self, record: &DeviceRecord) -> Result<()> {
        let faults = self.faults.lock();
        match record.spec.primary_key() {
            Some(key) if faults.failing_primary_keys.contains(key) => {
                bail!("injected write failure for {key}")
            }
            _ => Ok(()),
        }
    }
}

impl DeviceStore for MemoryStore {
    fn list_devices(&self) -> Result<Vec<DeviceRecord>> {
        {
            let mut faults = self.faults.lock();
            if faults.failing_lists > 0 {
                faults.failing_lists -= 1;
                bail!("device store unavailable");
            }
        }
        Ok(self.devices.read().values().cloned().collect())
    }

    fn create_device(&self, record: &DeviceRecord) -> Result<()> {
        self.check_write_fault(record)?;
        let mut devices = self.devices.write();
        if devices.contains_key(record.uid()) {
            bail!("device {} already exists", record.uid());
        }
        devices.insert(record.uid().clone(), record.clone());
        self.writes.lock().creates += 1;
        Ok(())
    }

    fn update_device(&self, record: &DeviceRecord) -> Result<()> {
        self.check_write_fault(record)?;
        let mut devices = self.devices.write();
        let slot = devices
            .get_mut(record.uid())
            .ok_or_else(|| anyhow!("device {} not found", record.uid()))?;
        *slot = record.clone();
        self.writes.lock().updates += 1;
        Ok(())
    }
}

impl IdentityAllocator for MemoryStore {
    fn allocate(&self, kind: ResourceKind) -> Result<String> {
        {
            let mut faults = self.faults.lock();
            if faults.failing_allocations > 0 {
                faults.failing_allocations -= 1;
                bail!("identity allocation failed for {kind}");
            }
        }
        loop {
            let id = generate_identity(kind);
            let taken = match kind {
                ResourceKind::Device => self.devices.read().contains_key(&DeviceId(id.clone())),
                ResourceKind::DiscoverySnapshot => self
                    .snapshots
                    .read()
                    .contains_key(&SnapshotId(id.clone())),
            };
            if !taken {
                return Ok(id);
            }
        }
    }
}

impl SnapshotStore for MemoryStore {
    fn get_snapshot(&self, id: &SnapshotId) -> Result<Option<Snapshot>> {
        Ok(self.snapshots.read().get(id).cloned())
    }

    fn create_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let mut snapshots = self.snapshots.write();
        if snapshots.contains_key(snapshot.uid()) {
            bail!("snapshot {} already exists", snapshot.uid());
        }
        snapshots.insert(snapshot.uid().clone(), snapshot.clone());
        Ok(())
    }

    fn update_snapshot_status(&self, id: &SnapshotId, status: &SnapshotStatus) -> Result<()> {
        let mut snapshots = self.snapshots.write();
        let snapshot = snapshots
            .get_mut(id)
            .ok_or_else(|| anyhow!("snapshot {id} not found"))?;
        snapshot.status = status.clone();
        snapshot.metadata.updated_at = chrono::Utc::now();
        Ok(())
    }

    fn list_snapshots(&self) -> Result<Vec<Snapshot>> {
        Ok(self.snapshots.read().values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeviceSpec, Metadata};
    use chrono::Utc;

    fn record(uid: &str, key: &str) -> DeviceRecord {
        let now = Utc::now();
        DeviceRecord {
            metadata: Metadata {
                uid: DeviceId::from(uid),
                name: key.to_string(),
                created_at: now,
                updated_at: now,
            },
            spec: DeviceSpec {
                primary_key: Some(key.to_string()),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_store_creation() {
        let store = MemoryStore::new();
        assert!(store.is_empty());
        assert_eq!(store.len(), 0);
        assert!(store.list_devices().unwrap().is_empty());
    }

    #[test]
    fn test_create_and_update() {
        let store = MemoryStore::new();
        let mut device = record("dev-1", "/Systems/1");
        store.create_device(&device).unwrap();
        assert!(store.create_device(&device).is_err());

        device.spec.serial_number = "SN1".to_string();
        store.update_device(&device).unwrap();
        assert_eq!(
            store.device(&DeviceId::from("dev-1")).unwrap().spec.serial_number,
            "SN1"
        );
        assert_eq!(store.write_counts(), WriteCounts { creates: 1, updates: 1 });

        assert!(store.update_device(&record("dev-2", "/Systems/2")).is_err());
    }

    #[test]
    fn test_injected_faults() {
        let store = MemoryStore::new();
        store.fail_next_lists(1);
        assert!(store.list_devices().is_err());
        assert!(store.list_devices().is_ok());

        store.fail_writes_for("/Systems/1");
        assert!(store.create_device(&record("dev-1", "/Systems/1")).is_err());
        assert!(store.is_empty());

        store.fail_next_allocations(1);
        assert!(store.allocate(ResourceKind::Device).is_err());
        assert!(store.allocate(ResourceKind::Device).is_ok());
    }

    #[test]
    fn test_allocate_prefix_and_uniqueness() {
        let store = MemoryStore::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            let id = store.allocate(ResourceKind::Device).unwrap();
            assert!(id.starts_with("dev-"));
            assert!(seen.insert(id));
        }
        assert!(store
            .allocate(ResourceKind::DiscoverySnapshot)
            .unwrap()
            .starts_with("dis-"));
    }
}
