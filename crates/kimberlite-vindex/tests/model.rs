//! Model-based test: replays random `add`/`delete` batches against a
//! `BTreeMap` reference model and checks `lookup` agrees after every step.

use std::collections::BTreeMap;
use std::sync::Arc;

use kimberlite_io::{IoBackend, SyncBackend};
use kimberlite_vindex::{IndexConfig, ValueIndex};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    AddNewKey { key: u8, ids: Vec<u32> },
    AddToExisting { key: u8, extra_ids: Vec<u32> },
    DeleteSome { key: u8 },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..8, prop::collection::vec(1u32..1000, 1..5)).prop_map(|(key, mut ids)| {
            ids.sort_unstable();
            ids.dedup();
            Op::AddNewKey { key, ids }
        }),
        (0u8..8, prop::collection::vec(1u32..1000, 1..5)).prop_map(|(key, mut ids)| {
            ids.sort_unstable();
            ids.dedup();
            Op::AddToExisting { key, extra_ids: ids }
        }),
        (0u8..8).prop_map(|key| Op::DeleteSome { key }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn matches_reference_model(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let dir = tempfile::tempdir().unwrap();
        let backend: Arc<dyn IoBackend> = Arc::new(SyncBackend::new());
        let index = ValueIndex::open(backend, &dir.path().join("value"), IndexConfig::without_interrupts()).unwrap();
        let mut model: BTreeMap<u8, Vec<u32>> = BTreeMap::new();

        for op in ops {
            match op {
                Op::AddNewKey { key, ids } => {
                    if model.contains_key(&key) || ids.is_empty() {
                        continue;
                    }
                    index.add(&[(vec![key], ids.clone())], None).unwrap();
                    model.insert(key, ids);
                }
                Op::AddToExisting { key, extra_ids } => {
                    let Some(existing) = model.get(&key) else { continue };
                    let max_existing = *existing.iter().max().unwrap();
                    let mut extra: Vec<u32> = extra_ids
                        .into_iter()
                        .map(|d| max_existing + d)
                        .collect();
                    extra.sort_unstable();
                    extra.dedup();
                    if extra.is_empty() {
                        continue;
                    }
                    index.add(&[(vec![key], extra.clone())], None).unwrap();
                    model.get_mut(&key).unwrap().extend(extra);
                }
                Op::DeleteSome { key } => {
                    let Some(existing) = model.get(&key) else { continue };
                    if existing.is_empty() {
                        continue;
                    }
                    let to_remove = vec![existing[0]];
                    index.delete(&[(vec![key], to_remove.clone())], None).unwrap();
                    let entry = model.get_mut(&key).unwrap();
                    entry.retain(|id| !to_remove.contains(id));
                    if entry.is_empty() {
                        model.remove(&key);
                    }
                }
            }

            for (key, ids) in &model {
                prop_assert_eq!(index.lookup(&[*key]).unwrap(), Some(ids.clone()));
            }
            prop_assert_eq!(index.size().unwrap(), model.len());
        }
    }
}
