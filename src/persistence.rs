//! # File Store
//!
//! Durable store keeping one JSON document per resource:
//! `<root>/device/<uid>.json` and `<root>/discoverysnapshot/<uid>.json`.
//! Each write lands in a temporary file in the target directory first and is then
//! linked or renamed into place, so readers never observe a partial document.

use crate::model::{DeviceRecord, ResourceKind, Snapshot, SnapshotId, SnapshotStatus};
use crate::store::{generate_identity, DeviceStore, IdentityAllocator, SnapshotStore};
use anyhow::{anyhow, bail, Context, Result};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

const MANIFEST_FILE: &str = "manifest.json";
const STORAGE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct StorageManifest {
    format_version: u32,
    app_version: String,
}

#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    status_lock: Mutex<()>,
}

impl FileStore {
    /// Open (or initialise) a store rooted at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let root = path.as_ref().to_path_buf();
        for kind in [ResourceKind::Device, ResourceKind::DiscoverySnapshot] {
            let dir = root.join(kind.collection());
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        validate_or_init_manifest(&root)?;
        Ok(Self {
            root,
            status_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, kind: ResourceKind, uid: &str) -> Result<PathBuf> {
        if uid.is_empty() || uid.contains(|c: char| c == '/' || c == '\\') || uid.starts_with('.') {
            bail!("invalid {kind} identity {uid:?}");
        }
        Ok(self
            .root
            .join(kind.collection())
            .join(format!("{uid}.json")))
    }

    fn list<T: DeserializeOwned>(&self, kind: ResourceKind) -> Result<Vec<T>> {
        let dir = self.root.join(kind.collection());
        let entries =
            fs::read_dir(&dir).with_context(|| format!("failed to list {}", dir.display()))?;
        let mut items = Vec::new();
        for entry in entries {
            let path = entry
                .with_context(|| format!("failed to list {}", dir.display()))?
                .path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let bytes = match fs::read(&path) {
                Ok(bytes) => bytes,
                // Removed between listing and reading.
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => {
                    return Err(err).with_context(|| format!("failed to read {}", path.display()))
                }
            };
            match serde_json::from_slice(&bytes) {
                Ok(item) => items.push(item),
                Err(err) => warn!(
                    path = %path.display(),
                    error = %err,
                    "skipping undecodable {kind} document"
                ),
            }
        }
        Ok(items)
    }
}

impl DeviceStore for FileStore {
    fn list_devices(&self) -> Result<Vec<DeviceRecord>> {
        self.list(ResourceKind::Device)
    }

    fn create_device(&self, record: &DeviceRecord) -> Result<()> {
        let path = self.path_for(ResourceKind::Device, record.uid().as_str())?;
        create_document(&path, record)
    }

    fn update_device(&self, record: &DeviceRecord) -> Result<()> {
        let path = self.path_for(ResourceKind::Device, record.uid().as_str())?;
        if !path.exists() {
            bail!("device {} not found", record.uid());
        }
        replace_document(&path, record)
    }
}

impl IdentityAllocator for FileStore {
    /// Draw ids until one is free on disk. Creates refuse to overwrite, so a
    /// racing allocation of the same id fails at create time.
    fn allocate(&self, kind: ResourceKind) -> Result<String> {
        loop {
            let id = generate_identity(kind);
            if self.path_for(kind, &id)?.exists() {
                debug!(id = %id, "identity already taken, drawing again");
                continue;
            }
            return Ok(id);
        }
    }
}

impl SnapshotStore for FileStore {
    fn get_snapshot(&self, id: &SnapshotId) -> Result<Option<Snapshot>> {
        let path = self.path_for(ResourceKind::DiscoverySnapshot, id.as_str())?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes).with_context(|| {
                format!("failed to decode {}", path.display())
            })?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    fn create_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let path = self.path_for(ResourceKind::DiscoverySnapshot, snapshot.uid().as_str())?;
        create_document(&path, snapshot)
    }

    fn update_snapshot_status(&self, id: &SnapshotId, status: &SnapshotStatus) -> Result<()> {
        let _guard = self.status_lock.lock();
        let mut snapshot = self
            .get_snapshot(id)?
            .ok_or_else(|| anyhow!("snapshot {id} not found"))?;
        snapshot.status = status.clone();
        snapshot.metadata.updated_at = chrono::Utc::now();
        let path = self.path_for(ResourceKind::DiscoverySnapshot, id.as_str())?;
        replace_document(&path, &snapshot)
    }

    fn list_snapshots(&self) -> Result<Vec<Snapshot>> {
        self.list(ResourceKind::DiscoverySnapshot)
    }
}

fn validate_or_init_manifest(root: &Path) -> Result<()> {
    let path = root.join(MANIFEST_FILE);
    if path.exists() {
        let manifest: StorageManifest = read_document(&path)?;
        if manifest.format_version != STORAGE_FORMAT_VERSION {
            return Err(anyhow!(
                "storage format version mismatch: expected {}, found {}",
                STORAGE_FORMAT_VERSION,
                manifest.format_version
            ));
        }
        return Ok(());
    }

    let manifest = StorageManifest {
        format_version: STORAGE_FORMAT_VERSION,
        app_version: env!("CARGO_PKG_VERSION").to_string(),
    };
    replace_document(&path, &manifest)
}

fn read_document<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("failed to decode {}", path.display()))
}

/// Write `value` to a temporary file in the directory of `path`.
fn stage_document<T: Serialize>(path: &Path, value: &T) -> Result<NamedTempFile> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow!("{} has no parent directory", path.display()))?;
    let mut staged = NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to stage a document in {}", dir.display()))?;
    serde_json::to_writer_pretty(&mut staged, value)?;
    staged.write_all(b"\n")?;
    staged.as_file().sync_all()?;
    Ok(staged)
}

/// Publish a new document; fails if one already exists at `path`.
fn create_document<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let staged = stage_document(path, value)?;
    match staged.persist_noclobber(path) {
        Ok(_) => Ok(()),
        Err(err) if err.error.kind() == ErrorKind::AlreadyExists => {
            bail!("{} already exists", path.display())
        }
        Err(err) => {
            Err(err.error).with_context(|| format!("failed to publish {}", path.display()))
        }
    }
}

/// Publish a document, replacing whatever is at `path`.
fn replace_document<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let staged = stage_document(path, value)?;
    staged
        .persist(path)
        .map_err(|err| err.error)
        .with_context(|| format!("failed to publish {}", path.display()))?;
    Ok(())
}
