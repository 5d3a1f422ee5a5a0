// SPDX-FileCopyrightText: 2020 Sean Cross <sean@xobs.io>
// SPDX-License-Identifier: Apache-2.0

//! Uthread: a user-level thread as seen by the bundle scheduler.
//!
//! The host runtime manages creation, joining and parking; the bundle core
//! only needs the trapframe and the visibility flags that keep the
//! work-stealer away from bundled uthreads.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use crate::arch::trapframe::Trapframe;

/// Default stack size for uthreads created through [`Uthread::with_stack`].
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

bitflags! {
    /// How the host scheduler sees a uthread. `READY` means "sitting on a
    /// runqueue waiting to run"; `RUNNING` means "occupying a worker",
    /// which bundled uthreads appear to do even while suspended, so the
    /// work-stealer leaves them alone.
    pub struct ThreadState: u8 {
        const READY   = 1 << 0;
        const RUNNING = 1 << 1;
    }
}

/// Everything required to suspend and resume a single uthread.
///
/// The trapframe must stay the first field: the entry stubs identify the
/// current uthread through the per-worker self pointer and treat it as a
/// pointer to its trapframe.
#[repr(C)]
pub struct Uthread {
    tf: UnsafeCell<Trapframe>,

    /// [`ThreadState`] bits. Both flags move together, so they live in one
    /// atomic: the dismantle path publishes READY with a single release
    /// store that the stealer's acquire pairs with.
    state: AtomicU8,

    /// TSC timestamp of the most recent transition to ready.
    pub ready_tsc: AtomicU64,

    pub total_cycles: AtomicU64,

    stack: Option<Box<[u8]>>,
}

// The trapframe is only touched by the owning worker (or by the entry stubs
// running on that worker); cross-worker access goes through the atomic
// state word.
unsafe impl Send for Uthread {}
unsafe impl Sync for Uthread {}

impl Uthread {
    /// An accounting-only uthread with a zeroed trapframe and no stack.
    pub fn new() -> Uthread {
        Uthread {
            tf: UnsafeCell::new(Trapframe::default()),
            state: AtomicU8::new(ThreadState::empty().bits()),
            ready_tsc: AtomicU64::new(0),
            total_cycles: AtomicU64::new(0),
            stack: None,
        }
    }

    /// A runnable uthread with its own stack. The trapframe is primed so
    /// that the first switch into it enters `entry(arg)` through the
    /// architecture trampoline.
    pub fn with_stack(entry: extern "C" fn(usize), arg: usize, stack_size: usize) -> Uthread {
        let stack = vec![0u8; stack_size].into_boxed_slice();
        // Stack grows down; keep the top 16-byte aligned for the SysV ABI.
        let top = (stack.as_ptr() as usize + stack.len()) & !15;
        let mut th = Uthread::new();
        th.stack = Some(stack);
        Trapframe::init_call(th.tf.get_mut(), entry, arg, top);
        th
    }

    pub fn tf_ptr(&self) -> *mut Trapframe {
        self.tf.get()
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from_bits_truncate(self.state.load(Ordering::Acquire))
    }

    pub fn is_ready(&self) -> bool {
        self.state().contains(ThreadState::READY)
    }

    pub fn is_running(&self) -> bool {
        self.state().contains(ThreadState::RUNNING)
    }

    /// Entering a bundle: invisible to the stealer, apparently on CPU.
    pub fn mark_bundled(&self) {
        self.state
            .store(ThreadState::RUNNING.bits(), Ordering::Release);
    }

    /// Back on a runqueue: ready, not running. The release store here is
    /// the one the work-stealer's acquire of the ring head pairs with.
    pub fn mark_queued(&self) {
        self.state.store(ThreadState::READY.bits(), Ordering::Release);
    }
}

impl Default for Uthread {
    fn default() -> Uthread {
        Uthread::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem;

    #[test]
    fn trapframe_is_first_field() {
        // The entry stubs and the switch policy rely on this.
        assert_eq!(mem::offset_of!(Uthread, tf), 0);
    }

    #[test]
    fn fresh_uthread_is_invisible_to_stealer() {
        let th = Uthread::new();
        assert!(!th.is_ready());
        assert!(!th.is_running());
    }

    #[test]
    fn state_transitions_are_exclusive() {
        let th = Uthread::new();
        th.mark_queued();
        assert_eq!(th.state(), ThreadState::READY);
        th.mark_bundled();
        assert_eq!(th.state(), ThreadState::RUNNING);
    }
}
