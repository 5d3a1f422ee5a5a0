// SPDX-FileCopyrightText: 2020 Sean Cross <sean@xobs.io>
// SPDX-License-Identifier: Apache-2.0

//! The LAME switch policy. Entered from the stubs in [`crate::arch::entry`]
//! after the interrupted register state has been captured; everything here
//! is ordinary Rust running on the interrupted uthread's stack.

use core::cell::Cell;
use std::sync::Arc;

use crate::arch::entry::jmp_uthread_direct;
use crate::arch::xsave::{self, XsaveArea};
use crate::bitmap;
use crate::config;
use crate::kthread::{self, Kthread};
use crate::preempt;
use crate::thread::Uthread;

/// The handler flavor a stub is bound to. Chosen once at registration;
/// the hot path never branches on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    Switch,
    Stall,
    Nop,
    Pretend,
}

thread_local! {
    static IN_LAME: Cell<u8> = Cell::new(0);
}

/// Takes the nested-delivery guard. Returns `false` (and counts the
/// suppression) when a LAME lands while another is already being handled
/// on this worker.
pub(crate) fn lame_enter() -> bool {
    IN_LAME.with(|c| {
        if c.get() > 0 {
            if let Some(k) = kthread::myk() {
                k.note_suppressed_lame();
            }
            false
        } else {
            c.set(1);
            preempt::disable();
            true
        }
    })
}

/// Drops the guard and re-enables preemption. Every handler path ends
/// here, including the far side of a switch, where this runs on behalf of
/// the entry that suspended the resumed uthread.
pub(crate) fn lame_exit() {
    IN_LAME.with(|c| c.set(c.get().saturating_sub(1)));
    preempt::enable();
}

/// A fresh uthread context begins outside any LAME even though the switch
/// that launched it ran inside the handler.
pub(crate) fn note_fresh_context() {
    IN_LAME.with(|c| c.set(0));
    preempt::reset();
}

pub fn in_lame() -> u8 {
    IN_LAME.with(|c| c.get())
}

/// The `switch` policy, general occupancy. `rip` is the interrupted
/// instruction pointer, used only for the extended-state gate.
pub fn handle(rip: u64) {
    switch_body(rip, false);
    lame_exit();
}

/// The `switch` policy for bundles kept dense in `[0, used)`; registered
/// for the capacity-2 fast path.
pub fn handle_dense(rip: u64) {
    switch_body(rip, true);
    lame_exit();
}

fn switch_body(rip: u64, dense: bool) {
    let k = match kthread::myk() {
        Some(k) => k,
        None => return,
    };

    // Nothing to rotate to, or a critical section asked us to stay put.
    let (enabled, used) = k.with_bundle(|b| (b.is_enabled(), b.used()));
    if !enabled || used <= 1 {
        return;
    }

    let (cur, next, left_idx) = k.with_bundle(|b| {
        let left = b.active() as usize;
        let cur = b.current_uthread();
        let next = if dense {
            b.next_uthread_dense()
        } else {
            b.next_uthread()
        };
        (cur, next, left)
    });

    let cur = match cur {
        Some(cur) => cur,
        None => {
            // The active slot must be occupied whenever used >= 1.
            log::error!(
                "[LAME][func:switch_body][kthread:{}] active slot empty with {} uthreads bundled",
                k.id(),
                used
            );
            return;
        }
    };
    let next = match next {
        Some(next) => next,
        None => {
            log::error!(
                "[LAME][func:switch_body][kthread:{}] no next uthread in a bundle of {}",
                k.id(),
                used
            );
            return;
        }
    };

    // Commit the new self pointer before any register state moves; the
    // store is visible by the time `next` resumes because it precedes the
    // restore epilogue.
    kthread::set_self(Arc::as_ptr(&next) as *mut Uthread);
    k.with_bundle(|b| b.record_lame(left_idx));

    log::debug!(
        "[LAME][sched OFF][func:switch_body][kthread:{}] uthread {:p}",
        k.id(),
        Arc::as_ptr(&cur)
    );
    log::debug!(
        "[LAME][sched ON][func:switch_body][kthread:{}] uthread {:p}",
        k.id(),
        Arc::as_ptr(&next)
    );

    if xsave_gate(k, rip) {
        let mut area = XsaveArea::uninit();
        let active_xstates = xsave::xgetbv(1);
        unsafe {
            xsave::xsavec(&mut area, active_xstates);
            jmp_uthread_direct(cur.tf_ptr(), next.tf_ptr());
            // Back on this uthread after some later switch returned here.
            xsave::xrstor(&area, active_xstates);
        }
    } else {
        unsafe {
            jmp_uthread_direct(cur.tf_ptr(), next.tf_ptr());
        }
    }
}

/// Consults the code-range bitmap and accounts a gated save. Instructions
/// outside the mapped text conservatively save extended state.
fn xsave_gate(k: &Kthread, rip: u64) -> bool {
    if !bitmap::needs_xsave(rip) {
        return false;
    }
    k.with_bundle(|b| b.record_xsave());
    true
}

/// The `stall` variant: account the LAME, then burn the configured cycle
/// budget in a user-mode timed pause instead of switching.
pub fn stall() {
    if let Some(k) = kthread::myk() {
        k.with_bundle(|b| b.record_stall());
    }
    xsave::tpause(config::get().stall_cycles);
    lame_exit();
}

/// The `pretend` variant (capacity 2): walk the bookkeeping and the
/// save/restore pair but skip the jump, accumulating the cost in
/// `total_cycles` for TSC measurement runs.
pub fn handle_pretend() {
    let start = xsave::rdtsc();
    if let Some(k) = kthread::myk() {
        let used = k.with_bundle(|b| b.used());
        if used > 1 {
            let left_idx = k.with_bundle(|b| {
                let left = b.active() as usize;
                b.next_uthread_dense();
                left
            });
            k.with_bundle(|b| b.record_lame(left_idx));
        }

        let mut area = XsaveArea::uninit();
        let active_xstates = xsave::xgetbv(1);
        unsafe {
            xsave::xsavec(&mut area, active_xstates);
            xsave::xrstor(&area, active_xstates);
        }
        k.with_bundle(|b| {
            b.record_xsave();
            b.record_cycles(xsave::rdtsc().wrapping_sub(start));
        });
    }
    lame_exit();
}

/// Slow path for a PMU delivery that turned out to be a real preemption
/// request: preserve extended state, then either cede the worker to the
/// control plane or yield to the host scheduler.
pub fn handle_bret_slowpath() {
    let k = match kthread::myk() {
        Some(k) => k,
        None => return,
    };
    k.note_preempt_slowpath();

    // One level of disable belongs to the handler itself; anything deeper
    // means the application had preemption off, so resume it untouched.
    if preempt::count() > 1 {
        return;
    }

    // Pin the worker while deciding (getk).
    preempt::disable();

    let mut area = XsaveArea::uninit();
    let active_xstates = xsave::xgetbv(0);
    unsafe {
        xsave::xsavec(&mut area, active_xstates);
    }

    k.with_bundle(|b| b.record_stall());

    if k.cede_needed() {
        kthread::thread_cede();
        preempt::enable(); // worker handed back by the control plane
    } else {
        preempt::enable(); // putk
        kthread::thread_yield();
    }

    unsafe {
        xsave::xrstor(&area, active_xstates);
    }
}

/// Dumps the per-worker LAME counters, for measurement runs and shutdown.
pub fn print_tsc_counters() {
    kthread::for_each(|k| {
        k.with_bundle(|b| {
            let avg = if b.total_lames() > 0 {
                b.total_cycles() / b.total_lames()
            } else {
                0
            };
            log::warn!(
                "[LAME][TSC][kthread:{}] avg_cycles={}; total_cycles={}; total_lames={}; total_xsave_lames={}; skip={}; stall={}; in_lame={}",
                k.id(),
                avg,
                b.total_cycles(),
                b.total_lames(),
                b.total_xsave_lames(),
                k.suppressed_lames(),
                k.preempt_slowpaths(),
                in_lame(),
            );
        });
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_entry_is_suppressed() {
        let k = kthread::init_thread(2);
        assert!(lame_enter());
        assert_eq!(in_lame(), 1);
        assert!(!lame_enter());
        assert_eq!(k.suppressed_lames(), 1);
        lame_exit();
        assert_eq!(in_lame(), 0);
    }

    #[test]
    fn disabled_bundle_passes_through() {
        let k = kthread::init_thread(2);
        let a = Arc::new(Uthread::new());
        let b = Arc::new(Uthread::new());
        k.add_to_bundle(&a, true).unwrap();
        k.add_to_bundle(&b, false).unwrap();
        // enabled == false: the handler must return without touching the
        // cursor or the counters.
        assert!(lame_enter());
        handle(0x400123);
        assert_eq!(in_lame(), 0);
        k.with_bundle(|bu| {
            assert_eq!(bu.active(), 0);
            assert_eq!(bu.total_lames(), 0);
            assert_eq!(bu.total_xsave_lames(), 0);
        });
    }

    #[test]
    fn lone_uthread_skips_the_switch() {
        let k = kthread::init_thread(2);
        let a = Arc::new(Uthread::new());
        k.add_to_bundle(&a, true).unwrap();
        k.with_bundle(|b| b.enable());
        assert!(lame_enter());
        handle(0x400123);
        assert_eq!(in_lame(), 0);
        k.with_bundle(|b| {
            assert_eq!(b.active(), 0);
            assert_eq!(b.total_lames(), 0);
        });
    }

    #[test]
    fn unmapped_rip_gates_one_xsave() {
        // No bitmap loaded: every rip conservatively needs a save, and the
        // gate accounts exactly one per call.
        let k = kthread::init_thread(2);
        assert!(xsave_gate(&k, 0x400800));
        assert_eq!(k.with_bundle(|b| b.total_xsave_lames()), 1);
        assert!(xsave_gate(&k, 0x400800));
        assert_eq!(k.with_bundle(|b| b.total_xsave_lames()), 2);
    }

    #[test]
    fn fresh_context_clears_handler_state() {
        assert!(lame_enter());
        note_fresh_context();
        assert_eq!(in_lame(), 0);
        assert!(preempt::enabled());
    }
}
