#[path = "../src/test_support.rs"]
mod test_support;

use std::sync::Arc;

use devgraph::{MemoryStore, Reconciler};
use test_support::{generate_inventory, to_payload};

#[test]
fn generated_inventory_reconciles_idempotently() -> anyhow::Result<()> {
    let inventory = generate_inventory(200, 0.05, 7);
    let payload = to_payload(&inventory.candidates);
    let store = Arc::new(MemoryStore::new());
    let reconciler = Reconciler::with_store(store.clone());

    let first = reconciler.reconcile_payload(payload.as_bytes())?;
    assert_eq!(first.created, inventory.candidates.len());
    assert_eq!(first.links_updated, inventory.expected_links);
    assert_eq!(first.unresolved_parents, inventory.dangling);
    let count_after_first = store.len();
    let specs_after_first: Vec<_> = store.devices().into_iter().map(|d| d.spec).collect();

    let second = reconciler.reconcile_payload(payload.as_bytes())?;
    assert_eq!(count_after_first, store.len());
    assert_eq!(second.created, 0);
    assert_eq!(second.updated, inventory.candidates.len());
    assert_eq!(second.links_updated, 0);
    assert_eq!(second.links_unchanged, inventory.expected_links);

    let specs_after_second: Vec<_> = store.devices().into_iter().map(|d| d.spec).collect();
    assert_eq!(specs_after_first, specs_after_second);
    Ok(())
}

#[test]
fn one_record_per_primary_key_across_runs() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let reconciler = Reconciler::with_store(store.clone());

    for seed in 0..5 {
        // Same topology, different order each run.
        let inventory = generate_inventory(20, 0.0, 11);
        let mut candidates = inventory.candidates;
        let len = candidates.len();
        candidates.rotate_left(seed * 3 % len);
        reconciler.reconcile_payload(to_payload(&candidates).as_bytes())?;
        assert_eq!(store.len(), candidates.len());
    }
    Ok(())
}
