use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};

use devgraph::model::DeviceSpec;

/// The three-device snapshot: `uri/A` alone, `uri/B` with serial `S1`, and
/// `uri/C` pointing at `S1`.
#[allow(dead_code)]
pub fn scenario_payload() -> String {
    json!([
        {"primaryKey": "uri/A", "attributes": {"deviceType": "Chassis"}},
        {"primaryKey": "uri/B", "serialNumber": "S1", "attributes": {"deviceType": "Node"}},
        {"primaryKey": "uri/C", "parentSerialNumber": "S1", "attributes": {"deviceType": "CPU"}}
    ])
    .to_string()
}

#[allow(dead_code)]
#[derive(Debug, Clone)]
pub struct GeneratedInventory {
    pub candidates: Vec<DeviceSpec>,
    /// Children whose parent serial exists in the inventory.
    #[allow(dead_code)]
    pub expected_links: usize,
    /// Children pointing at a serial nothing in the inventory carries.
    #[allow(dead_code)]
    pub dangling: usize,
}

#[allow(dead_code)]
fn component(path: String, serial: String, kind: &str, parent: Option<&str>) -> DeviceSpec {
    let mut spec = DeviceSpec {
        primary_key: Some(path),
        serial_number: serial,
        parent_serial_number: parent.unwrap_or_default().to_string(),
        ..DeviceSpec::default()
    };
    spec.attributes
        .insert("deviceType".to_string(), Value::from(kind));
    spec
}

/// Generate nodes with CPUs and DIMMs, shuffled so children often precede
/// their parents. A share of children reference a node that does not exist.
#[allow(dead_code)]
pub fn generate_inventory(nodes: u32, dangling_probability: f64, seed: u64) -> GeneratedInventory {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut candidates = Vec::new();
    let mut expected_links = 0;
    let mut dangling = 0;

    for node in 1..=nodes {
        let node_path = format!("/Systems/{node:05}");
        let node_serial = format!("SN-NODE-{node:05}");
        candidates.push(component(
            node_path.clone(),
            node_serial.clone(),
            "Node",
            None,
        ));

        let cpus = rng.random_range(1..=2);
        let dimms = rng.random_range(2..=8);
        let children = (0..cpus)
            .map(|i| ("Processors", format!("CPU{i}"), "CPU"))
            .chain((0..dimms).map(|i| ("Memory", format!("DIMM{i}"), "DIMM")));

        for (collection, member, kind) in children {
            let path = format!("{node_path}/{collection}/{member}");
            let serial = format!("SN-{node:05}-{member}");
            let parent = if rng.random_bool(dangling_probability) {
                dangling += 1;
                format!("SN-MISSING-{node:05}")
            } else {
                expected_links += 1;
                node_serial.clone()
            };
            candidates.push(component(path, serial, kind, Some(&parent)));
        }
    }

    candidates.shuffle(&mut rng);
    GeneratedInventory {
        candidates,
        expected_links,
        dangling,
    }
}

#[allow(dead_code)]
pub fn to_payload(candidates: &[DeviceSpec]) -> String {
    serde_json::to_string(candidates).unwrap_or_default()
}
