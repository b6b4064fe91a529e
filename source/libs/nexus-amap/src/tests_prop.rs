// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for amap slot occupancy
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; drives one amap with HostPager against a HashMap model.
//!
//! TEST_SCOPE:
//!   - nused equals the sum of chunk bitmap popcounts after every operation
//!   - Lookups agree with the model
//!   - Lazy amaps hold exactly the chunks that have an occupied slot
//!   - Every anon dropped from the amap is freed exactly once
//!
//! TEST_SCENARIOS:
//!   - occupancy_matches_model(): random add/replace/unadd/wipe sequences

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use proptest::prelude::*;

use crate::{AmapRef, AmapSystem, AnonId, Blocking, HostPager, PageBackend, CHUNK_SIZE};

#[derive(Clone, Debug)]
enum Op {
    Add(usize),
    Replace(usize),
    Unadd(usize),
    Wipe(usize, usize),
}

fn arb_op(nslots: usize) -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..nslots).prop_map(Op::Add),
        1 => (0..nslots).prop_map(Op::Replace),
        2 => (0..nslots).prop_map(Op::Unadd),
        1 => (0..nslots, 1..=nslots).prop_map(move |(start, len)| Op::Wipe(start, len.min(nslots - start))),
    ]
}

proptest! {
    #[test]
    fn occupancy_matches_model((nslots, lazy, ops) in (1usize..300, any::<bool>())
        .prop_flat_map(|(n, lazy)| (Just(n), Just(lazy), proptest::collection::vec(arb_op(n), 0..80))))
    {
        let pager = Arc::new(HostPager::new());
        let system = AmapSystem::new(pager.clone());
        let amap = system.create(nslots, Blocking::NoWait, lazy).unwrap();
        let aref = AmapRef::new(amap.clone(), 0);
        let mut model: HashMap<usize, AnonId> = HashMap::new();

        for op in ops {
            match op {
                Op::Add(slot) => {
                    if !model.contains_key(&slot) {
                        let anon = pager.alloc(slot as u64).unwrap();
                        prop_assert_eq!(system.add(&aref, slot, anon, false).unwrap(), None);
                        model.insert(slot, anon);
                    }
                }
                Op::Replace(slot) => {
                    if let Some(old) = model.get(&slot).copied() {
                        let new = pager.alloc(0).unwrap();
                        prop_assert_eq!(system.add(&aref, slot, new, true).unwrap(), Some(old));
                        prop_assert!(pager.drop_ref(old));
                        pager.free_pages(&[old]);
                        model.insert(slot, new);
                    }
                }
                Op::Unadd(slot) => {
                    if let Some(anon) = model.remove(&slot) {
                        prop_assert_eq!(system.unadd(&aref, slot), anon);
                        prop_assert!(pager.drop_ref(anon));
                        pager.free_pages(&[anon]);
                    }
                }
                Op::Wipe(start, len) => {
                    system.wipe_range(&amap, start, len);
                    model.retain(|slot, _| *slot < start || *slot >= start + len);
                }
            }
            prop_assert_eq!(amap.verify(), Ok(()));
            prop_assert_eq!(amap.nused(), model.len());
        }

        for slot in 0..nslots {
            prop_assert_eq!(system.lookup(&aref, slot), model.get(&slot).copied());
        }
        if lazy && nslots > CHUNK_SIZE {
            let chunks: HashSet<usize> = model.keys().map(|slot| slot / CHUNK_SIZE).collect();
            prop_assert_eq!(amap.chunk_count(), chunks.len());
        }
        prop_assert_eq!(pager.live_pages(), model.len());
    }
}
