// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Integration tests for the swap-off sweep
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//!
//! TEST_SCOPE:
//!   - Only anons whose swap slot is in range are paged in
//!   - Teardown racing the sweep is deferred and completed by the sweep
//!   - Slot changes made while the sweep sleeps are picked up
//!   - The sweep stops at the first failed page-in
//!
//! TEST_SCENARIOS:
//!   - single_page_in_across_three_amaps(): one anon in range among three amaps
//!   - unref_during_page_in_defers_wipeout(): last reference dropped while paging in
//!   - rescan_after_concurrent_add(): an anon added during page-in is paged in too
//!   - failure_stops_sweep(): later amaps are not visited

#![forbid(unsafe_code)]

use std::sync::Arc;

use nexus_amap::{
    AmapRef, AmapSystem, AnonId, Blocking, HostPager, PageBackend, PageError, RefFlags,
};
use parking_lot::Mutex;

type Hook = Box<dyn FnOnce() + Send>;

/// HostPager that runs a one-shot hook at the start of the next page-in,
/// while the sweep has the amap unlocked.
#[derive(Default)]
struct RacingPager {
    host: HostPager,
    hook: Mutex<Option<Hook>>,
}

impl RacingPager {
    fn on_next_page_in(&self, hook: Hook) {
        *self.hook.lock() = Some(hook);
    }
}

impl PageBackend for RacingPager {
    fn add_ref(&self, anon: AnonId) {
        self.host.add_ref(anon)
    }

    fn drop_ref(&self, anon: AnonId) -> bool {
        self.host.drop_ref(anon)
    }

    fn refcount(&self, anon: AnonId) -> usize {
        self.host.refcount(anon)
    }

    fn free_pages(&self, anons: &[AnonId]) {
        self.host.free_pages(anons)
    }

    fn duplicate(&self, anon: AnonId, blocking: Blocking) -> Result<AnonId, PageError> {
        self.host.duplicate(anon, blocking)
    }

    fn wait_for_memory(&self) {
        self.host.wait_for_memory()
    }

    fn is_busy(&self, anon: AnonId) -> bool {
        self.host.is_busy(anon)
    }

    fn wait_unbusy(&self, anon: AnonId) {
        self.host.wait_unbusy(anon)
    }

    fn revoke_write(&self, anon: AnonId) {
        self.host.revoke_write(anon)
    }

    fn swap_slot(&self, anon: AnonId) -> Option<u32> {
        self.host.swap_slot(anon)
    }

    fn page_in(&self, anon: AnonId) -> Result<(), PageError> {
        let hook = self.hook.lock().take();
        if let Some(hook) = hook {
            hook();
        }
        self.host.page_in(anon)
    }
}

fn setup() -> (Arc<RacingPager>, Arc<AmapSystem>) {
    let pager = Arc::new(RacingPager::default());
    let system = Arc::new(AmapSystem::new(pager.clone()));
    (pager, system)
}

#[test]
fn single_page_in_across_three_amaps() {
    let (pager, system) = setup();
    let mut anons = Vec::new();
    let amaps: Vec<_> = (0..3)
        .map(|i| {
            let amap = system.create(64, Blocking::NoWait, true).expect("create");
            let anon = pager.host.alloc(i).expect("page");
            system.add(&AmapRef::new(amap.clone(), 0), 10 * i as usize, anon, false).expect("add");
            anons.push(anon);
            amap
        })
        .collect();
    pager.host.swap_out(anons[0], 100);
    pager.host.swap_out(anons[1], 12);

    assert!(!system.swap_off(10, 20));
    assert_eq!(pager.host.stats().page_ins, 1);
    assert_eq!(pager.swap_slot(anons[1]), None);
    assert_eq!(pager.swap_slot(anons[0]), Some(100));
    for amap in &amaps {
        assert!(system.is_live(amap.id()));
        assert!(amap.flags().is_empty());
    }
}

#[test]
fn unref_during_page_in_defers_wipeout() {
    let (pager, system) = setup();
    let amap = system.create(8, Blocking::NoWait, true).expect("create");
    let anon = pager.host.alloc(3).expect("page");
    system.add(&AmapRef::new(amap.clone(), 0), 2, anon, false).expect("add");
    pager.host.swap_out(anon, 5);

    let racer = {
        let system = Arc::clone(&system);
        let amap = amap.clone();
        Box::new(move || {
            system.unreference(&amap, 0, 8, RefFlags::empty());
            assert!(!amap.is_dead(), "wipeout must wait for the sweep");
        })
    };
    pager.on_next_page_in(racer);

    assert!(!system.swap_off(0, 16));
    assert!(amap.is_dead());
    assert_eq!(system.live_count(), 0);
    assert!(!pager.host.is_live(anon));
}

#[test]
fn rescan_after_concurrent_add() {
    let (pager, system) = setup();
    let amap = system.create(32, Blocking::NoWait, true).expect("create");
    let aref = AmapRef::new(amap.clone(), 0);
    let late = pager.host.alloc(1).expect("page");
    system.add(&aref, 20, late, false).expect("add");
    pager.host.swap_out(late, 1);
    let early = pager.host.alloc(2).expect("page");
    pager.host.swap_out(early, 2);

    let racer = {
        let system = Arc::clone(&system);
        let aref = aref.clone();
        Box::new(move || {
            system.add(&aref, 4, early, false).expect("add during page-in");
        })
    };
    pager.on_next_page_in(racer);

    assert!(!system.swap_off(0, 8));
    assert_eq!(pager.host.stats().page_ins, 2);
    assert_eq!(pager.swap_slot(early), None);
    assert_eq!(pager.swap_slot(late), None);
}

#[test]
fn failure_stops_sweep() {
    let (pager, system) = setup();
    let first = system.create(4, Blocking::NoWait, true).expect("create");
    let second = system.create(4, Blocking::NoWait, true).expect("create");
    let bad = pager.host.alloc(1).expect("page");
    let good = pager.host.alloc(2).expect("page");
    system.add(&AmapRef::new(first.clone(), 0), 0, bad, false).expect("add");
    system.add(&AmapRef::new(second.clone(), 0), 0, good, false).expect("add");
    pager.host.swap_out(bad, 3);
    pager.host.swap_out(good, 4);
    pager.host.fail_page_in(bad);

    assert!(system.swap_off(0, 8));
    assert_eq!(pager.host.stats().page_ins, 1);
    assert_eq!(pager.swap_slot(good), Some(4));
    assert!(first.flags().is_empty());
}
