// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for the run-length per-page refcounts
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; compares the encoding against a one-count-per-slot model.
//!
//! TEST_SCOPE:
//!   - Runs always tile [0, len)
//!   - Counts match a naive per-slot model after arbitrary adjustments
//!   - Zero callbacks cover exactly the slots that dropped to zero
//!
//! TEST_SCENARIOS:
//!   - adjust_matches_model(): random +1/-1 ranges agree with the model
//!   - undo_restores_encoding(): +1 then -1 on one range restores a uniform array

use super::PerPageRefs;
use proptest::prelude::*;

fn arb_ops(nslots: usize) -> impl Strategy<Value = Vec<(usize, usize, bool)>> {
    proptest::collection::vec(
        (0..nslots, 1..=nslots, any::<bool>()).prop_map(move |(start, len, up)| {
            (start, len.min(nslots - start), up)
        }),
        0..24,
    )
}

proptest! {
    #[test]
    fn adjust_matches_model((nslots, initial, ops) in (1usize..64, 0usize..3)
        .prop_flat_map(|(n, init)| (Just(n), Just(init), arb_ops(n))))
    {
        let mut ppref = PerPageRefs::establish(nslots, initial).unwrap();
        let mut model = vec![initial; nslots];
        for (start, len, up) in ops {
            let range = start..start + len;
            if !up && model[range.clone()].iter().any(|&c| c == 0) {
                continue;
            }
            let mut zeroed = Vec::new();
            ppref.adjust(start, len, if up { 1 } else { -1 }, |s, l| zeroed.extend(s..s + l));
            let mut expect_zeroed = Vec::new();
            for slot in range {
                if up {
                    model[slot] += 1;
                } else {
                    model[slot] -= 1;
                    if model[slot] == 0 {
                        expect_zeroed.push(slot);
                    }
                }
            }
            prop_assert_eq!(zeroed, expect_zeroed);
            prop_assert_eq!(ppref.check(), Ok(()));
        }
        for (slot, expected) in model.iter().enumerate() {
            prop_assert_eq!(ppref.count_at(slot), *expected);
        }
        let covered: usize = ppref.runs().map(|(_, _, len)| len).sum();
        prop_assert_eq!(covered, nslots);
    }

    #[test]
    fn undo_restores_encoding(
        (nslots, start, len) in (1usize..80).prop_flat_map(|n| (Just(n), 0..n, 1..=n)),
        initial in 1usize..4,
    ) {
        let len = len.min(nslots - start);
        let mut ppref = PerPageRefs::establish(nslots, initial).unwrap();
        let original = ppref.clone();
        ppref.adjust(start, len, 1, |_, _| {});
        ppref.adjust(start, len, -1, |_, _| {});
        prop_assert_eq!(ppref, original);
    }
}
