// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property tests for the pre-order mapping tree
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; no kernel logic.
//!
//! TEST_SCOPE:
//!   - Random insert/revoke/pack sequences against a parent-pointer model
//!   - Structural integrity and a free last slot after every pack
//!
//! TEST_SCENARIOS:
//!   - tree_matches_model(): live set and parent relation agree with the model

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use proptest::prelude::*;

use super::mapping::Mapping;
use super::pool::TreeAllocators;
use super::tree::MappingTree;
use crate::config::MapdbConfig;
use crate::types::SpaceId;

const ROOT: SpaceId = SpaceId::task(0);

#[derive(Clone, Debug)]
enum Op {
    Insert(usize),
    Revoke(usize),
    Pack,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => any::<usize>().prop_map(Op::Insert),
        2 => any::<usize>().prop_map(Op::Revoke),
        1 => Just(Op::Pack),
    ]
}

/// Live slots as (position, page number).
fn live(tree: &MappingTree) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    let mut cursor = Some(0);
    while let Some(i) = cursor {
        if let Some(page) = tree.get(i).page_number() {
            out.push((i, page));
        }
        cursor = tree.next(i);
    }
    out
}

fn position(tree: &MappingTree, page: usize) -> usize {
    live(tree).into_iter().find(|&(_, p)| p == page).map(|(i, _)| i).unwrap()
}

proptest! {
    #[test]
    fn tree_matches_model(ops in proptest::collection::vec(op_strategy(), 1..64)) {
        let config = MapdbConfig::new(ROOT, 1 << 22, &[22, 12]).unwrap();
        let pools = Arc::new(TreeAllocators::new(&config));
        let mut tree = MappingTree::new(&pools, Mapping::root(ROOT, 0)).unwrap();
        // page -> parent page; the root is page 0.
        let mut model: BTreeMap<usize, usize> = BTreeMap::new();
        let mut next_page = 1usize;

        for op in ops {
            match op {
                Op::Insert(pick) => {
                    let pages: Vec<usize> = core::iter::once(0).chain(model.keys().copied()).collect();
                    let parent = pages[pick % pages.len()];
                    let idx = position(&tree, parent);
                    tree.insert_child(idx, SpaceId::task(1), next_page).unwrap();
                    model.insert(next_page, parent);
                    next_page += 1;
                }
                Op::Revoke(pick) => {
                    if model.is_empty() {
                        continue;
                    }
                    let pages: Vec<usize> = model.keys().copied().collect();
                    let victim = pages[pick % pages.len()];
                    let idx = position(&tree, victim);
                    let mut doomed = Vec::new();
                    let mut cursor = idx;
                    while let Some(i) = tree.next_child(idx, cursor) {
                        doomed.push(i);
                        cursor = i;
                    }
                    for i in doomed {
                        tree.kill(i);
                    }
                    tree.kill(idx);
                    tree.trim_tail();

                    let mut gone = alloc::vec![victim];
                    while let Some(page) = gone.pop() {
                        model.remove(&page);
                        gone.extend(model.iter().filter(|&(_, &p)| p == page).map(|(&c, _)| c));
                    }
                }
                Op::Pack => {}
            }
            prop_assert!(tree.pack());
            prop_assert!(tree.check_integrity().is_ok());

            let slots = live(&tree);
            prop_assert_eq!(slots.len(), model.len() + 1);
            for &(i, page) in &slots {
                match tree.parent(i) {
                    None => prop_assert_eq!(page, 0),
                    Some(p) => {
                        let parent_page = tree.get(p).page_number().unwrap();
                        prop_assert_eq!(model.get(&page).copied(), Some(parent_page));
                    }
                }
            }
        }
    }
}
