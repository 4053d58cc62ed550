//! # Redfish Discovery
//!
//! Walks a Redfish service (`Systems -> {Processors, Memory}`) and produces the
//! candidate list a snapshot payload carries. Nodes are keyed by their system
//! path; processors and DIMMs point at their node through its serial number.

use crate::model::{null_as_default, DeviceSpec, LEGACY_PRIMARY_KEY_ATTR};
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, instrument, warn};

/// Attribute naming the Redfish path of a component's parent.
pub const PARENT_URI_ATTR: &str = "redfish_parent_uri";

/// Read access to a Redfish service, addressed by paths relative to its root.
pub trait RedfishTransport: Send + Sync {
    fn get(&self, path: &str) -> Result<Vec<u8>>;
}

/// Serves a Redfish mockup tree from disk: `<root><path>/index.json`.
#[derive(Debug, Clone)]
pub struct MockupTransport {
    root: PathBuf,
}

impl MockupTransport {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl RedfishTransport for MockupTransport {
    fn get(&self, path: &str) -> Result<Vec<u8>> {
        let relative = Path::new(path.trim_matches('/'));
        if !relative
            .components()
            .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
        {
            bail!("invalid redfish path {path:?}");
        }
        let mut file = self.root.join(relative);
        file.push("index.json");
        fs::read(&file).with_context(|| format!("failed to read {}", file.display()))
    }
}

#[derive(Debug, Default, Deserialize)]
struct Link {
    #[serde(rename = "@odata.id", default, deserialize_with = "null_as_default")]
    odata_id: String,
}

#[derive(Debug, Deserialize)]
struct Collection {
    #[serde(rename = "Members", default, deserialize_with = "null_as_default")]
    members: Vec<Link>,
}

/// Fields every mapped component shares. Redfish reports unknown values as `null`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct CommonProperties {
    #[serde(deserialize_with = "null_as_default")]
    manufacturer: String,
    #[serde(deserialize_with = "null_as_default")]
    model: String,
    #[serde(deserialize_with = "null_as_default")]
    part_number: String,
    #[serde(deserialize_with = "null_as_default")]
    serial_number: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct System {
    #[serde(flatten)]
    common: CommonProperties,
    #[serde(default)]
    processors: Option<Link>,
    #[serde(default)]
    memory: Option<Link>,
}

/// The component types discovery maps into devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentKind {
    System,
    Processor,
    Memory,
}

impl ComponentKind {
    /// Value of the `deviceType` attribute.
    pub fn device_type(self) -> &'static str {
        match self {
            ComponentKind::System => "Node",
            ComponentKind::Processor => "CPU",
            ComponentKind::Memory => "DIMM",
        }
    }

    fn decode(self, body: &[u8]) -> Result<CommonProperties> {
        let common = match self {
            ComponentKind::System => serde_json::from_slice::<System>(body)?.common,
            ComponentKind::Processor | ComponentKind::Memory => serde_json::from_slice(body)?,
        };
        Ok(common)
    }
}

/// Walk the service and return candidates in discovery order: each node
/// followed by its processors, then its DIMMs.
///
/// Members that cannot be fetched or decoded are logged and skipped. Failing to
/// read the `Systems` collection, or finding nothing at all, is an error.
#[instrument(skip(transport))]
pub fn collect(transport: &dyn RedfishTransport, service_root: &str) -> Result<Vec<DeviceSpec>> {
    let body = transport
        .get("/Systems")
        .context("failed to get Systems collection")?;
    let systems: Collection =
        serde_json::from_slice(&body).context("failed to decode Systems collection")?;

    let mut candidates = Vec::new();
    for member in &systems.members {
        let system_path = relative_path(&member.odata_id, service_root);
        match collect_system(transport, service_root, &system_path) {
            Ok(mut found) => candidates.append(&mut found),
            Err(err) => warn!(system = %member.odata_id, error = %err, "skipping system"),
        }
    }

    if candidates.is_empty() {
        bail!("redfish discovery found no devices");
    }
    info!(devices = candidates.len(), "discovery complete");
    Ok(candidates)
}

fn collect_system(
    transport: &dyn RedfishTransport,
    service_root: &str,
    system_path: &str,
) -> Result<Vec<DeviceSpec>> {
    let body = transport.get(system_path)?;
    let system: System = serde_json::from_slice(&body)
        .with_context(|| format!("failed to decode system data from {system_path}"))?;

    let node_serial = system.common.serial_number.clone();
    let mut candidates = vec![to_candidate(
        &system.common,
        ComponentKind::System,
        system_path,
        None,
    )];

    let children = [
        (system.processors.as_ref(), ComponentKind::Processor),
        (system.memory.as_ref(), ComponentKind::Memory),
    ];
    for (link, kind) in children {
        let Some(link) = link.filter(|link| !link.odata_id.is_empty()) else {
            continue;
        };
        let collection_path = relative_path(&link.odata_id, service_root);
        let parent = Parent {
            path: system_path,
            serial: &node_serial,
        };
        match collect_members(transport, service_root, &collection_path, kind, &parent) {
            Ok(mut found) => candidates.append(&mut found),
            Err(err) => warn!(
                collection = %link.odata_id,
                kind = kind.device_type(),
                error = %err,
                "failed to retrieve inventory"
            ),
        }
    }
    Ok(candidates)
}

struct Parent<'a> {
    path: &'a str,
    serial: &'a str,
}

fn collect_members(
    transport: &dyn RedfishTransport,
    service_root: &str,
    collection_path: &str,
    kind: ComponentKind,
    parent: &Parent<'_>,
) -> Result<Vec<DeviceSpec>> {
    let body = transport.get(collection_path)?;
    let collection: Collection = serde_json::from_slice(&body)
        .with_context(|| format!("failed to decode collection from {collection_path}"))?;

    let mut candidates = Vec::with_capacity(collection.members.len());
    for member in &collection.members {
        let member_path = relative_path(&member.odata_id, service_root);
        let common = match transport
            .get(&member_path)
            .and_then(|body| kind.decode(&body))
        {
            Ok(common) => common,
            Err(err) => {
                warn!(member = %member.odata_id, error = %err, "skipping member");
                continue;
            }
        };
        debug!(member = %member_path, kind = kind.device_type(), "mapped component");
        candidates.push(to_candidate(&common, kind, &member_path, Some(parent)));
    }
    Ok(candidates)
}

fn to_candidate(
    common: &CommonProperties,
    kind: ComponentKind,
    path: &str,
    parent: Option<&Parent<'_>>,
) -> DeviceSpec {
    let part_number = if common.part_number.is_empty() {
        &common.model
    } else {
        &common.part_number
    };

    let mut spec = DeviceSpec {
        primary_key: Some(path.to_string()),
        serial_number: common.serial_number.trim().to_string(),
        ..DeviceSpec::default()
    };
    let attrs = &mut spec.attributes;
    attrs.insert("deviceType".into(), Value::from(kind.device_type()));
    if !common.manufacturer.is_empty() {
        attrs.insert("manufacturer".into(), Value::from(common.manufacturer.as_str()));
    }
    if !part_number.is_empty() {
        attrs.insert("partNumber".into(), Value::from(part_number.as_str()));
    }
    attrs.insert(LEGACY_PRIMARY_KEY_ATTR.into(), Value::from(path));

    if let Some(parent) = parent {
        spec.parent_serial_number = parent.serial.trim().to_string();
        spec.attributes
            .insert(PARENT_URI_ATTR.into(), Value::from(parent.path));
    }
    spec
}

/// Strip the service root from an `@odata.id` link.
fn relative_path(link: &str, service_root: &str) -> String {
    let root = service_root.trim_end_matches('/');
    let stripped = if root.is_empty() {
        link
    } else {
        link.strip_prefix(root).unwrap_or(link)
    };
    if stripped.starts_with('/') {
        stripped.to_string()
    } else {
        format!("/{stripped}")
    }
}
