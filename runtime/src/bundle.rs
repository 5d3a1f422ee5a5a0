// SPDX-FileCopyrightText: 2020 Sean Cross <sean@xobs.io>
// SPDX-License-Identifier: Apache-2.0

//! The per-worker bundle: a small fixed ring of uthread slots that the
//! LAME switch policy rotates over.
//!
//! A bundle belongs to exactly one worker and is only ever manipulated on
//! that worker, so none of these operations take locks. Cross-worker
//! movement of uthreads happens solely through the runqueue hand-off in
//! [`crate::kthread`].

use std::fmt::Write as _;
use std::sync::Arc;

use crate::kthread;
use crate::thread::Uthread;
use crate::Error;

/// Hard upper bound on bundle capacity. The configured capacity is usually
/// 2-8; the slots are inline so growing this costs memory on every worker.
pub const BUNDLE_CAPACITY_MAX: usize = 8;

/// One bundle slot: an owned reference to a uthread plus per-slot
/// accounting. The slot is empty when `uthread` is `None`.
#[derive(Default)]
pub struct Slot {
    uthread: Option<Arc<Uthread>>,
    cycles: u64,
    lame_count: u64,
}

impl Slot {
    pub fn is_present(&self) -> bool {
        self.uthread.is_some()
    }

    pub fn uthread(&self) -> Option<&Arc<Uthread>> {
        self.uthread.as_ref()
    }

    pub fn lame_count(&self) -> u64 {
        self.lame_count
    }
}

/// Per-worker bundle state. `active` indexes the uthread currently
/// considered running; it only moves in the round-robin picks and on
/// `add(.., set_active = true)`.
pub struct Bundle {
    slots: [Slot; BUNDLE_CAPACITY_MAX],
    capacity: u32,
    used: u32,
    active: u32,
    enabled: bool,
    total_cycles: u64,
    total_lames: u64,
    total_xsave_lames: u64,
}

impl Bundle {
    pub fn new(capacity: u32) -> Bundle {
        assert!(
            capacity as usize <= BUNDLE_CAPACITY_MAX,
            "bundle capacity {} exceeds maximum {}",
            capacity,
            BUNDLE_CAPACITY_MAX
        );
        Bundle {
            slots: Default::default(),
            capacity,
            used: 0,
            active: 0,
            enabled: false,
            total_cycles: 0,
            total_lames: 0,
            total_xsave_lames: 0,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn active(&self) -> u32 {
        self.active
    }

    pub fn slot(&self, index: usize) -> Option<&Slot> {
        self.slots.get(index)
    }

    /// Adds a uthread to the first empty slot.
    ///
    /// Adding a uthread that is already bundled is an idempotent no-op:
    /// it is logged and reported as success, and no second slot is used.
    pub fn add(&mut self, th: &Arc<Uthread>, set_active: bool) -> Result<(), Error> {
        let mut first_empty = None;
        for (i, slot) in self.slots[..self.capacity as usize].iter().enumerate() {
            match slot.uthread {
                Some(ref existing) => {
                    if Arc::ptr_eq(existing, th) {
                        log::error!(
                            "[LAME]: attempted to add duplicate uthread {:p} to bundle (kthread {})",
                            Arc::as_ptr(th),
                            kthread::my_index()
                        );
                        return Ok(());
                    }
                }
                None => {
                    if first_empty.is_none() {
                        first_empty = Some(i);
                    }
                }
            }
        }

        let idx = first_empty.ok_or(Error::NoSpace)?;
        let slot = &mut self.slots[idx];
        slot.uthread = Some(Arc::clone(th));
        slot.cycles = 0;
        slot.lame_count = 0;
        self.used += 1;

        if set_active {
            self.active = idx as u32;
        }
        self.debug_check();
        Ok(())
    }

    /// Removes a uthread by reference. The `active` index is left alone
    /// even when it pointed at the removed slot; the next round-robin pick
    /// scans past empty slots.
    pub fn remove(&mut self, th: &Arc<Uthread>) -> Result<(), Error> {
        let found = self.slots[..self.capacity as usize]
            .iter()
            .position(|slot| match slot.uthread {
                Some(ref existing) => Arc::ptr_eq(existing, th),
                None => false,
            });
        match found {
            Some(idx) => {
                self.slots[idx].uthread = None;
                self.used -= 1;
                self.debug_check();
                Ok(())
            }
            None => Err(Error::NotFound),
        }
    }

    pub fn remove_by_index(&mut self, index: usize) -> Result<(), Error> {
        if index >= self.capacity as usize {
            log::error!(
                "[LAME][kthread:{}][func:remove_by_index] index {} out of bounds",
                kthread::my_index(),
                index
            );
            return Err(Error::BadIndex);
        }
        if self.slots[index].uthread.take().is_none() {
            return Err(Error::NotFound);
        }
        self.used -= 1;
        self.debug_check();
        Ok(())
    }

    /// Removes whatever occupies the active slot. `active` itself does not
    /// move; see `remove`.
    pub fn remove_at_active(&mut self) -> Result<(), Error> {
        let active = self.active as usize;
        if self.slots[active].uthread.take().is_none() {
            return Err(Error::NotFound);
        }
        self.used -= 1;
        self.debug_check();
        Ok(())
    }

    /// Round-robin pick: the first present slot after `active`, wrapping.
    /// Advances `active` to the returned slot. Returns `None` (and leaves
    /// `active` untouched) when the bundle is empty.
    pub fn next_uthread(&mut self) -> Option<Arc<Uthread>> {
        let start = self.active;
        for i in 1..=self.capacity {
            let idx = (start + i) % self.capacity;
            if self.slots[idx as usize].uthread.is_some() {
                self.active = idx;
                return self.slots[idx as usize].uthread.clone();
            }
        }
        None
    }

    /// Fast-path pick for bundles known to be dense in `[0, used)`: no
    /// occupancy scan, just an increment modulo `used`.
    pub fn next_uthread_dense(&mut self) -> Option<Arc<Uthread>> {
        debug_assert!(
            self.slots[..self.used as usize].iter().all(Slot::is_present),
            "dense pick on a sparse bundle"
        );
        let mut next = self.active + 1;
        if next >= self.used {
            next = 0;
        }
        self.active = next;
        self.slots[next as usize].uthread.clone()
    }

    /// The uthread at the active index, if that slot is occupied.
    pub fn current_uthread(&self) -> Option<Arc<Uthread>> {
        self.slots[self.active as usize].uthread.clone()
    }

    /// Dynamically enables bundle scheduling. Only meaningful when the
    /// bundle is statically enabled; a capacity-1 bundle stays disabled.
    pub fn enable(&mut self) {
        if !self.is_statically_enabled() {
            log::warn!(
                "[LAME][kthread:{}] refusing to enable a bundle of capacity {}",
                kthread::my_index(),
                self.capacity
            );
            return;
        }
        self.enabled = true;
    }

    /// Dynamically disables bundle scheduling, e.g. around scheduler
    /// critical sections where a switch must not land.
    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn is_statically_enabled(&self) -> bool {
        self.capacity > 1
    }

    pub fn is_dynamically_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_enabled(&self) -> bool {
        self.is_statically_enabled() && self.is_dynamically_enabled()
    }

    /// Marks every bundled uthread not-ready and running, so the host
    /// scheduler keeps treating them as "on CPU" while they sit here.
    pub fn set_all_unready(&self) {
        for slot in self.slots[..self.capacity as usize].iter() {
            if let Some(ref th) = slot.uthread {
                th.mark_bundled();
            }
        }
    }

    /// Takes every occupied slot's uthread out of the bundle, oldest slot
    /// first, resetting the bundle to empty. Used by the runqueue hand-off.
    pub(crate) fn take_all(&mut self) -> impl Iterator<Item = Arc<Uthread>> + '_ {
        self.used = 0;
        self.active = 0;
        self.slots[..self.capacity as usize].iter_mut().filter_map(|slot| {
            slot.cycles = 0;
            slot.lame_count = 0;
            slot.uthread.take()
        })
    }

    /// Restores the canonical empty-cursor form (`used == 0, active == 0`)
    /// after a dismantle, whether or not any slots were occupied.
    pub(crate) fn reset_cursor(&mut self) {
        self.used = 0;
        self.active = 0;
    }

    /// Worker-exit cleanup: drop every reference and zero the accounting.
    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.uthread = None;
            slot.cycles = 0;
            slot.lame_count = 0;
        }
        self.capacity = 0;
        self.used = 0;
        self.active = 0;
        self.enabled = false;
        self.total_cycles = 0;
        self.total_lames = 0;
        self.total_xsave_lames = 0;
    }

    pub fn total_lames(&self) -> u64 {
        self.total_lames
    }

    pub fn total_xsave_lames(&self) -> u64 {
        self.total_xsave_lames
    }

    pub fn total_cycles(&self) -> u64 {
        self.total_cycles
    }

    /// Accounts one handled LAME against the slot that was left behind.
    pub(crate) fn record_lame(&mut self, slot_index: usize) {
        self.total_lames += 1;
        if let Some(slot) = self.slots.get_mut(slot_index) {
            slot.lame_count += 1;
        }
    }

    pub(crate) fn record_xsave(&mut self) {
        self.total_xsave_lames += 1;
    }

    /// Accounts a LAME that was absorbed without a switch (stall and
    /// slow-path variants).
    pub(crate) fn record_stall(&mut self) {
        self.total_lames += 1;
    }

    pub(crate) fn record_cycles(&mut self, cycles: u64) {
        self.total_cycles += cycles;
    }

    /// Emits the one-line bundle snapshot consumed by the log analyzers.
    pub fn print(&self, kthread: u32) {
        let mut line = format!(
            "[LAME][BUNDLE][kthread:{}][size:{}][used:{}][active:{}][enabled:{}][bundle:",
            kthread, self.capacity, self.used, self.active, self.enabled as u8
        );
        for slot in self.slots[..self.capacity as usize].iter() {
            match slot.uthread {
                Some(ref th) => {
                    let _ = write!(line, "<{:p}>", Arc::as_ptr(th));
                }
                None => line.push_str("<0x0>"),
            }
        }
        line.push(']');
        log::info!("{}", line);
    }

    #[cfg(debug_assertions)]
    fn debug_check(&self) {
        assert!(self.used <= self.capacity);
        let occupied = self.slots[..self.capacity as usize]
            .iter()
            .filter(|s| s.is_present())
            .count();
        assert_eq!(occupied, self.used as usize);
        assert!(!self.enabled || self.capacity > 1);
        for (i, a) in self.slots[..self.capacity as usize].iter().enumerate() {
            if let Some(ref ta) = a.uthread {
                for b in self.slots[i + 1..self.capacity as usize].iter() {
                    if let Some(ref tb) = b.uthread {
                        assert!(!Arc::ptr_eq(ta, tb), "uthread aliased across slots");
                    }
                }
            }
        }
    }

    #[cfg(not(debug_assertions))]
    fn debug_check(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uthreads(n: usize) -> Vec<Arc<Uthread>> {
        (0..n).map(|_| Arc::new(Uthread::new())).collect()
    }

    fn occupancy(bundle: &Bundle) -> Vec<bool> {
        (0..bundle.capacity() as usize)
            .map(|i| bundle.slot(i).unwrap().is_present())
            .collect()
    }

    #[test]
    fn add_and_round_robin() {
        let ths = uthreads(4);
        let mut bundle = Bundle::new(4);
        bundle.add(&ths[0], true).unwrap();
        bundle.add(&ths[1], false).unwrap();
        bundle.add(&ths[2], false).unwrap();
        bundle.add(&ths[3], false).unwrap();
        assert_eq!(bundle.used(), 4);
        assert_eq!(bundle.active(), 0);

        for expect in [1, 2, 3, 0] {
            let next = bundle.next_uthread().unwrap();
            assert!(Arc::ptr_eq(&next, &ths[expect]));
            assert_eq!(bundle.active(), expect as u32);
        }
        assert_eq!(bundle.active(), 0);
    }

    #[test]
    fn overfill_returns_no_space() {
        let ths = uthreads(3);
        let mut bundle = Bundle::new(2);
        bundle.add(&ths[0], true).unwrap();
        bundle.add(&ths[1], false).unwrap();
        assert_eq!(bundle.add(&ths[2], false), Err(Error::NoSpace));
        assert_eq!(bundle.used(), 2);
        assert!(Arc::ptr_eq(bundle.slot(0).unwrap().uthread().unwrap(), &ths[0]));
        assert!(Arc::ptr_eq(bundle.slot(1).unwrap().uthread().unwrap(), &ths[1]));
    }

    #[test]
    fn duplicate_add_is_idempotent() {
        let ths = uthreads(1);
        let mut bundle = Bundle::new(4);
        bundle.add(&ths[0], true).unwrap();
        bundle.add(&ths[0], false).unwrap();
        assert_eq!(bundle.used(), 1);
        assert!(Arc::ptr_eq(bundle.slot(0).unwrap().uthread().unwrap(), &ths[0]));
        for i in 1..4 {
            assert!(!bundle.slot(i).unwrap().is_present());
        }
    }

    #[test]
    fn add_remove_round_trip() {
        let ths = uthreads(3);
        let mut bundle = Bundle::new(4);
        bundle.add(&ths[0], true).unwrap();
        bundle.add(&ths[1], false).unwrap();
        let before = occupancy(&bundle);
        let used_before = bundle.used();

        bundle.add(&ths[2], false).unwrap();
        bundle.remove(&ths[2]).unwrap();

        assert_eq!(occupancy(&bundle), before);
        assert_eq!(bundle.used(), used_before);
    }

    #[test]
    fn remove_absent_returns_not_found() {
        let ths = uthreads(2);
        let mut bundle = Bundle::new(2);
        bundle.add(&ths[0], true).unwrap();
        assert_eq!(bundle.remove(&ths[1]), Err(Error::NotFound));
        assert_eq!(bundle.used(), 1);
    }

    #[test]
    fn remove_by_index_bounds() {
        let ths = uthreads(1);
        let mut bundle = Bundle::new(2);
        bundle.add(&ths[0], true).unwrap();
        assert_eq!(bundle.remove_by_index(7), Err(Error::BadIndex));
        assert_eq!(bundle.remove_by_index(1), Err(Error::NotFound));
        bundle.remove_by_index(0).unwrap();
        assert_eq!(bundle.used(), 0);
    }

    #[test]
    fn pick_on_empty_bundle() {
        let mut bundle = Bundle::new(4);
        bundle.active = 2;
        assert!(bundle.next_uthread().is_none());
        assert_eq!(bundle.active(), 2);
    }

    #[test]
    fn round_robin_fairness() {
        // k consecutive picks visit each of the k present uthreads once,
        // from any starting point.
        let ths = uthreads(3);
        let mut bundle = Bundle::new(8);
        for th in &ths {
            bundle.add(th, false).unwrap();
        }
        for start in 0..3 {
            bundle.active = start;
            let mut seen = Vec::new();
            for _ in 0..3 {
                let th = bundle.next_uthread().unwrap();
                assert!(!seen.iter().any(|s| Arc::ptr_eq(s, &th)));
                seen.push(th);
            }
            assert_eq!(seen.len(), 3);
        }
    }

    #[test]
    fn round_robin_survives_remove_at_active() {
        // Removing the active uthread leaves `active` pointing at the empty
        // slot; the scan in the next pick must step past it.
        let ths = uthreads(4);
        let mut bundle = Bundle::new(4);
        for (i, th) in ths.iter().enumerate() {
            bundle.add(th, i == 0).unwrap();
        }

        let next = bundle.next_uthread().unwrap();
        assert!(Arc::ptr_eq(&next, &ths[1]));

        bundle.remove_at_active().unwrap();
        assert_eq!(bundle.active(), 1);
        assert!(!bundle.slot(1).unwrap().is_present());

        for expect in [2, 3, 0, 2] {
            let next = bundle.next_uthread().unwrap();
            assert!(Arc::ptr_eq(&next, &ths[expect]));
        }
    }

    #[test]
    fn dense_pick_wraps_on_used() {
        let ths = uthreads(2);
        let mut bundle = Bundle::new(4);
        bundle.add(&ths[0], true).unwrap();
        bundle.add(&ths[1], false).unwrap();

        let next = bundle.next_uthread_dense().unwrap();
        assert!(Arc::ptr_eq(&next, &ths[1]));
        let next = bundle.next_uthread_dense().unwrap();
        assert!(Arc::ptr_eq(&next, &ths[0]));
    }

    #[test]
    fn enable_requires_capacity() {
        let mut single = Bundle::new(1);
        single.enable();
        assert!(!single.is_enabled());
        assert!(!single.is_statically_enabled());

        let mut pair = Bundle::new(2);
        assert!(!pair.is_enabled());
        pair.enable();
        assert!(pair.is_enabled());
        assert!(pair.is_dynamically_enabled());
        pair.disable();
        assert!(!pair.is_enabled());
    }

    #[test]
    fn readiness_illusion() {
        let ths = uthreads(2);
        let mut bundle = Bundle::new(2);
        for th in &ths {
            th.mark_queued();
            bundle.add(th, false).unwrap();
        }
        bundle.set_all_unready();
        for th in &ths {
            assert!(!th.is_ready());
            assert!(th.is_running());
        }
    }

    #[test]
    fn print_survives_every_occupancy() {
        let _ = env_logger::builder().is_test(true).try_init();
        let ths = uthreads(2);
        let mut bundle = Bundle::new(4);
        bundle.print(0);
        bundle.add(&ths[0], true).unwrap();
        bundle.add(&ths[1], false).unwrap();
        bundle.remove(&ths[0]).unwrap();
        bundle.print(0);
    }

    #[test]
    fn clear_resets_everything() {
        let ths = uthreads(2);
        let mut bundle = Bundle::new(2);
        for th in &ths {
            bundle.add(th, false).unwrap();
        }
        bundle.enable();
        bundle.clear();
        assert_eq!(bundle.capacity(), 0);
        assert_eq!(bundle.used(), 0);
        assert!(!bundle.is_dynamically_enabled());
        assert_eq!(bundle.total_lames(), 0);
    }
}
