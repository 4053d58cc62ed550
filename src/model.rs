//! # Data Model
//!
//! Device records, discovery snapshots, and the identifiers that tie them together.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Attribute key that older producers used to carry the primary key inside the bag.
pub const LEGACY_PRIMARY_KEY_ATTR: &str = "redfish_uri";

/// Open bag of typed properties describing a physical component.
pub type Attributes = BTreeMap<String, serde_json::Value>;

/// Decode an explicit JSON `null` as the type's default, like a missing key.
pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Kinds of resource the store hands out identities for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Device,
    DiscoverySnapshot,
}

impl ResourceKind {
    /// Prefix carried by every identity of this kind.
    pub fn prefix(self) -> &'static str {
        match self {
            ResourceKind::Device => "dev",
            ResourceKind::DiscoverySnapshot => "dis",
        }
    }

    /// Directory/collection name used by stores.
    pub fn collection(self) -> &'static str {
        match self {
            ResourceKind::Device => "device",
            ResourceKind::DiscoverySnapshot => "discoverysnapshot",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Device => write!(f, "Device"),
            ResourceKind::DiscoverySnapshot => write!(f, "DiscoverySnapshot"),
        }
    }
}

/// Durable, store-assigned identity of a device record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Durable identity of a discovery snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(pub String);

impl SnapshotId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SnapshotId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Store-owned bookkeeping shared by every resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata<I> {
    pub uid: I,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Discovered description of a device: everything except store bookkeeping.
///
/// This is also the wire shape of one entry in a snapshot payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceSpec {
    /// Strong external identifier (canonical Redfish URI).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<String>,
    /// Weak external identifier, used only for parent linking.
    #[serde(
        skip_serializing_if = "String::is_empty",
        deserialize_with = "null_as_default"
    )]
    pub serial_number: String,
    /// Serial number of the intended parent; empty for roots.
    #[serde(
        skip_serializing_if = "String::is_empty",
        deserialize_with = "null_as_default"
    )]
    pub parent_serial_number: String,
    /// Resolved parent identity. Written by the link pass only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<DeviceId>,
    #[serde(
        alias = "properties",
        skip_serializing_if = "BTreeMap::is_empty",
        deserialize_with = "null_as_default"
    )]
    pub attributes: Attributes,
}

impl DeviceSpec {
    /// Resolve the primary key, falling back to the legacy `redfish_uri` attribute.
    ///
    /// Empty and whitespace-only keys count as absent.
    pub fn primary_key(&self) -> Option<&str> {
        let typed = self.primary_key.as_deref().map(str::trim);
        let legacy = || {
            self.attributes
                .get(LEGACY_PRIMARY_KEY_ATTR)
                .and_then(|value| value.as_str())
                .map(str::trim)
        };
        typed
            .filter(|key| !key.is_empty())
            .or_else(|| legacy().filter(|key| !key.is_empty()))
    }

    /// Secondary key, or `None` when empty.
    pub fn secondary_key(&self) -> Option<&str> {
        Some(self.serial_number.as_str()).filter(|key| !key.is_empty())
    }

    /// Parent reference, or `None` for roots.
    pub fn parent_ref(&self) -> Option<&str> {
        Some(self.parent_serial_number.as_str()).filter(|key| !key.is_empty())
    }

    /// Normalize a freshly decoded candidate: trim keys, drop empty ones.
    pub(crate) fn normalized(mut self) -> Self {
        self.primary_key = self
            .primary_key
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty());
        self.serial_number = self.serial_number.trim().to_string();
        self.parent_serial_number = self.parent_serial_number.trim().to_string();
        self
    }
}

/// A device as persisted by the record store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub metadata: Metadata<DeviceId>,
    pub spec: DeviceSpec,
}

impl DeviceRecord {
    pub fn uid(&self) -> &DeviceId {
        &self.metadata.uid
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }
}

/// Processing phase of a snapshot. Only ever advances forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    Pending,
    Processing,
    Completed,
    Error,
}

impl Phase {
    /// `Completed` and `Error` absorb every later attempt.
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Error)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Phase::Pending => "Pending",
            Phase::Processing => "Processing",
            Phase::Completed => "Completed",
            Phase::Error => "Error",
        };
        f.write_str(label)
    }
}

/// Observed processing state of a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotStatus {
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default)]
    pub ready: bool,
}

impl SnapshotStatus {
    pub fn new(phase: Phase, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: message.into(),
            ready: phase == Phase::Completed,
        }
    }
}

/// One discovery batch submitted for reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub metadata: Metadata<SnapshotId>,
    /// Raw payload text as produced by the discovery source. Opaque until parsed.
    #[serde(rename = "rawData")]
    pub raw_data: String,
    #[serde(default)]
    pub status: SnapshotStatus,
}

impl Snapshot {
    pub fn uid(&self) -> &SnapshotId {
        &self.metadata.uid
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_primary_key_prefers_typed_field() {
        let mut attributes = Attributes::new();
        attributes.insert(LEGACY_PRIMARY_KEY_ATTR.to_string(), json!("/Systems/old"));
        let spec = DeviceSpec {
            primary_key: Some("/Systems/1".to_string()),
            attributes,
            ..Default::default()
        };
        assert_eq!(spec.primary_key(), Some("/Systems/1"));
    }

    #[test]
    fn test_primary_key_legacy_fallback() {
        let mut attributes = Attributes::new();
        attributes.insert(LEGACY_PRIMARY_KEY_ATTR.to_string(), json!("/Systems/1"));
        let spec = DeviceSpec {
            primary_key: Some("   ".to_string()),
            attributes,
            ..Default::default()
        };
        assert_eq!(spec.primary_key(), Some("/Systems/1"));

        let mut attributes = Attributes::new();
        attributes.insert(LEGACY_PRIMARY_KEY_ATTR.to_string(), json!(42));
        let spec = DeviceSpec {
            attributes,
            ..Default::default()
        };
        assert_eq!(spec.primary_key(), None);
    }

    #[test]
    fn test_empty_keys_are_absent() {
        let spec = DeviceSpec::default();
        assert_eq!(spec.secondary_key(), None);
        assert_eq!(spec.parent_ref(), None);
    }

    #[test]
    fn test_phase_terminal() {
        assert!(!Phase::Pending.is_terminal());
        assert!(!Phase::Processing.is_terminal());
        assert!(Phase::Completed.is_terminal());
        assert!(Phase::Error.is_terminal());
        assert!(SnapshotStatus::new(Phase::Completed, "done").ready);
        assert!(!SnapshotStatus::new(Phase::Error, "bad").ready);
    }

    #[test]
    fn test_spec_wire_names() {
        let spec: DeviceSpec = serde_json::from_value(json!({
            "primaryKey": "/Systems/1",
            "serialNumber": "SN1",
            "parentSerialNumber": "SN0",
            "properties": {"deviceType": "Node"}
        }))
        .unwrap();
        assert_eq!(spec.primary_key(), Some("/Systems/1"));
        assert_eq!(spec.secondary_key(), Some("SN1"));
        assert_eq!(spec.parent_ref(), Some("SN0"));
        assert_eq!(spec.attributes["deviceType"], json!("Node"));
    }
}
