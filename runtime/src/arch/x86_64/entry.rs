// SPDX-FileCopyrightText: 2020 Sean Cross <sean@xobs.io>
// SPDX-License-Identifier: Apache-2.0

//! LAME entry stubs and the cooperative trapframe jump.
//!
//! The stubs are the only code that runs between interrupt delivery and the
//! switch policy. Their job is strictly marshalling: push every
//! general-purpose register onto the interrupted stack, hand a pointer to
//! that block (plus the pushed return address and flags) to a Rust shim,
//! and on return pop everything back and return to the interrupted
//! instruction. All scheduling decisions live in [`crate::sched`].
//!
//! Two return flavors exist. The INT stubs are entered through a software
//! interrupt and return with `iretq`. The PMU stubs are entered through a
//! re-vectored performance-counter overflow whose frame is just
//! `[rflags][rip]`, and return with the paired `bretq` sequence:
//! `popfq; ret`.

use core::arch::naked_asm;
use core::mem;

use super::trapframe::Trapframe;
use crate::kthread;
use crate::sched;

/// The register block a stub pushes, in ascending memory order.
#[repr(C)]
pub struct SavedGprs {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

// Shared stub body for the PMU ("bretq") flavor. The frame above the saved
// block is [rflags][rip]; the interrupted rsp is what `popfq; ret` leaves.
// The 15 registers are pushed high-to-low so the block reads low-to-high as
// SavedGprs. rbx carries the block pointer across the call (callee-saved,
// and restored from the block afterwards anyway).
macro_rules! bret_stub {
    ($shim:path) => {
        naked_asm!(
            "push r15",
            "push r14",
            "push r13",
            "push r12",
            "push r11",
            "push r10",
            "push r9",
            "push r8",
            "push rbp",
            "push rdi",
            "push rsi",
            "push rdx",
            "push rcx",
            "push rbx",
            "push rax",
            "mov rdi, rsp",
            "mov rsi, [rsp + 15*8 + 8]",  // pushed return address
            "mov rdx, [rsp + 15*8]",      // pushed rflags
            "lea rcx, [rsp + 15*8 + 16]", // rsp after bretq
            "mov rbx, rsp",
            "and rsp, -16",
            "call {shim}",
            "mov rsp, rbx",
            "pop rax",
            "pop rbx",
            "pop rcx",
            "pop rdx",
            "pop rsi",
            "pop rdi",
            "pop rbp",
            "pop r8",
            "pop r9",
            "pop r10",
            "pop r11",
            "pop r12",
            "pop r13",
            "pop r14",
            "pop r15",
            "popfq",
            "ret",
            shim = sym $shim,
        )
    };
}

// Shared stub body for the INT flavor: a full iretq frame
// [rip][cs][rflags][rsp][ss] sits above the saved block.
macro_rules! int_stub {
    ($shim:path) => {
        naked_asm!(
            "push r15",
            "push r14",
            "push r13",
            "push r12",
            "push r11",
            "push r10",
            "push r9",
            "push r8",
            "push rbp",
            "push rdi",
            "push rsi",
            "push rdx",
            "push rcx",
            "push rbx",
            "push rax",
            "mov rdi, rsp",
            "mov rsi, [rsp + 15*8]",      // frame rip
            "mov rdx, [rsp + 15*8 + 16]", // frame rflags
            "mov rcx, [rsp + 15*8 + 24]", // frame rsp
            "mov rbx, rsp",
            "and rsp, -16",
            "call {shim}",
            "mov rsp, rbx",
            "pop rax",
            "pop rbx",
            "pop rcx",
            "pop rdx",
            "pop rsi",
            "pop rdi",
            "pop rbp",
            "pop r8",
            "pop r9",
            "pop r10",
            "pop r11",
            "pop r12",
            "pop r13",
            "pop r14",
            "pop r15",
            "iretq",
            shim = sym $shim,
        )
    };
}

/// General INT entry: round-robin over any occupancy pattern.
#[unsafe(naked)]
pub unsafe extern "C" fn lame_entry() {
    int_stub!(shim_switch_int)
}

/// Capacity-2 INT entry bound to the dense fast-path pick.
#[unsafe(naked)]
pub unsafe extern "C" fn lame_entry2() {
    int_stub!(shim_switch_dense_int)
}

/// General PMU entry.
#[unsafe(naked)]
pub unsafe extern "C" fn lame_entry_bret() {
    bret_stub!(shim_switch_bret)
}

/// Capacity-2 PMU entry.
#[unsafe(naked)]
pub unsafe extern "C" fn lame_entry2_bret() {
    bret_stub!(shim_switch_dense_bret)
}

/// PMU entry that emulates a fixed stall instead of switching.
#[unsafe(naked)]
pub unsafe extern "C" fn lame_entry_stall_bret() {
    bret_stub!(shim_stall)
}

/// PMU entry that returns immediately (baseline overhead measurement).
#[unsafe(naked)]
pub unsafe extern "C" fn lame_entry_nop_bret() {
    naked_asm!("popfq", "ret")
}

/// INT entry that returns immediately.
#[unsafe(naked)]
pub unsafe extern "C" fn lame_entry_nop() {
    naked_asm!("iretq")
}

/// Capacity-2 INT entry that walks the whole switch path except the jump,
/// for TSC measurement of the save/restore cost.
#[unsafe(naked)]
pub unsafe extern "C" fn lame_entry2_pretend() {
    int_stub!(shim_pretend)
}

/// Copies the stub-saved state into the current uthread's trapframe. The
/// nested-delivery guard must already have been taken: a suppressed entry
/// must not clobber the trapframe of the interrupt it nested inside.
unsafe fn store_to_self(gprs: *const SavedGprs, rip: u64, rflags: u64, rsp: u64) -> bool {
    let cur = kthread::thread_self();
    if cur.is_null() {
        log::error!(
            "[LAME][func:store_to_self][kthread:{}] no current uthread",
            kthread::my_index()
        );
        return false;
    }
    (*(*cur).tf_ptr()).store_interrupted(&*gprs, rip, rflags, rsp);
    true
}

unsafe extern "C" fn shim_switch_int(gprs: *const SavedGprs, rip: u64, rflags: u64, rsp: u64) {
    if !sched::lame_enter() {
        return;
    }
    if !store_to_self(gprs, rip, rflags, rsp) {
        sched::lame_exit();
        return;
    }
    sched::handle(rip);
}

unsafe extern "C" fn shim_switch_dense_int(gprs: *const SavedGprs, rip: u64, rflags: u64, rsp: u64) {
    if !sched::lame_enter() {
        return;
    }
    if !store_to_self(gprs, rip, rflags, rsp) {
        sched::lame_exit();
        return;
    }
    sched::handle_dense(rip);
}

unsafe extern "C" fn shim_switch_bret(gprs: *const SavedGprs, rip: u64, rflags: u64, rsp: u64) {
    if !sched::lame_enter() {
        return;
    }
    if !store_to_self(gprs, rip, rflags, rsp) {
        sched::lame_exit();
        return;
    }
    if kthread::myk().map(|k| k.cede_needed()).unwrap_or(false) {
        sched::handle_bret_slowpath();
        sched::lame_exit();
        return;
    }
    sched::handle(rip);
}

unsafe extern "C" fn shim_switch_dense_bret(gprs: *const SavedGprs, rip: u64, rflags: u64, rsp: u64) {
    if !sched::lame_enter() {
        return;
    }
    if !store_to_self(gprs, rip, rflags, rsp) {
        sched::lame_exit();
        return;
    }
    if kthread::myk().map(|k| k.cede_needed()).unwrap_or(false) {
        sched::handle_bret_slowpath();
        sched::lame_exit();
        return;
    }
    sched::handle_dense(rip);
}

unsafe extern "C" fn shim_stall(_gprs: *const SavedGprs, _rip: u64, _rflags: u64, _rsp: u64) {
    if !sched::lame_enter() {
        return;
    }
    sched::stall();
}

unsafe extern "C" fn shim_pretend(gprs: *const SavedGprs, rip: u64, rflags: u64, rsp: u64) {
    if !sched::lame_enter() {
        return;
    }
    if !store_to_self(gprs, rip, rflags, rsp) {
        sched::lame_exit();
        return;
    }
    sched::handle_pretend();
}

/// Direct trapframe-to-trapframe switch: saves the callee-saved registers,
/// flags, stack and return address of the caller into `prev`, loads the
/// same set from `next`, and transfers control. Caller-saved registers
/// follow the C ABI (clobbered), which is what makes this legal to call
/// from ordinary Rust.
///
/// Control comes back here, with the original stack, when some later
/// switch targets `prev` again.
#[unsafe(naked)]
pub unsafe extern "C" fn jmp_uthread_direct(_prev: *mut Trapframe, _next: *const Trapframe) {
    naked_asm!(
        "mov [rdi + {off_rbx}], rbx",
        "mov [rdi + {off_rbp}], rbp",
        "mov [rdi + {off_r12}], r12",
        "mov [rdi + {off_r13}], r13",
        "mov [rdi + {off_r14}], r14",
        "mov [rdi + {off_r15}], r15",
        "lea rax, [rsp + 8]",
        "mov [rdi + {off_rsp}], rax",
        "mov rax, [rsp]",
        "mov [rdi + {off_rip}], rax",
        "pushfq",
        "pop qword ptr [rdi + {off_rflags}]",
        "mov rbx, [rsi + {off_rbx}]",
        "mov rbp, [rsi + {off_rbp}]",
        "mov r12, [rsi + {off_r12}]",
        "mov r13, [rsi + {off_r13}]",
        "mov r14, [rsi + {off_r14}]",
        "mov r15, [rsi + {off_r15}]",
        "push qword ptr [rsi + {off_rflags}]",
        "popfq",
        "mov rsp, [rsi + {off_rsp}]",
        "mov rax, [rsi + {off_rip}]",
        "jmp rax",
        off_rbx = const mem::offset_of!(Trapframe, rbx),
        off_rbp = const mem::offset_of!(Trapframe, rbp),
        off_r12 = const mem::offset_of!(Trapframe, r12),
        off_r13 = const mem::offset_of!(Trapframe, r13),
        off_r14 = const mem::offset_of!(Trapframe, r14),
        off_r15 = const mem::offset_of!(Trapframe, r15),
        off_rsp = const mem::offset_of!(Trapframe, rsp),
        off_rip = const mem::offset_of!(Trapframe, rip),
        off_rflags = const mem::offset_of!(Trapframe, rflags),
    )
}

/// Landing pad for the first switch into a fresh uthread. The entry point
/// and argument ride in r13/r12 (the callee-saved registers the jump
/// transfers); see [`Trapframe::init_call`].
#[unsafe(naked)]
pub unsafe extern "C" fn uthread_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "mov rsi, r12",
        "call {first_run}",
        "ud2",
        first_run = sym uthread_first_run,
    )
}

unsafe extern "C" fn uthread_first_run(entry: extern "C" fn(usize), arg: usize) {
    // A fresh context starts outside any LAME and with preemption enabled,
    // even though the switch that started it ran inside the handler.
    sched::note_fresh_context();
    entry(arg);
    panic!("uthread entry returned");
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::{Cell, UnsafeCell};
    use core::sync::atomic::{AtomicUsize, Ordering};
    use crate::thread::Uthread;

    struct SwitchCtx {
        main_tf: UnsafeCell<Trapframe>,
        uthread_tf: Cell<*mut Trapframe>,
        hits: AtomicUsize,
    }

    extern "C" fn bouncer(arg: usize) {
        let ctx = arg as *const SwitchCtx;
        loop {
            unsafe {
                (*ctx).hits.fetch_add(1, Ordering::SeqCst);
                jmp_uthread_direct((*ctx).uthread_tf.get(), (*ctx).main_tf.get());
            }
        }
    }

    #[test]
    fn switch_round_trip() {
        let ctx = Box::new(SwitchCtx {
            main_tf: UnsafeCell::new(Trapframe::default()),
            uthread_tf: Cell::new(core::ptr::null_mut()),
            hits: AtomicUsize::new(0),
        });
        let th = Uthread::with_stack(bouncer, &*ctx as *const SwitchCtx as usize, 64 * 1024);
        ctx.uthread_tf.set(th.tf_ptr());

        // First switch enters through the trampoline; the bounce saves the
        // uthread's context and resumes us right after the call below.
        unsafe { jmp_uthread_direct(ctx.main_tf.get(), th.tf_ptr()) };
        assert_eq!(ctx.hits.load(Ordering::SeqCst), 1);

        // Second switch resumes the bouncer's loop from its saved frame.
        unsafe { jmp_uthread_direct(ctx.main_tf.get(), th.tf_ptr()) };
        assert_eq!(ctx.hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn saved_block_matches_trapframe_contract() {
        // The stub copies this block verbatim into the trapframe.
        assert_eq!(mem::size_of::<SavedGprs>(), 15 * 8);
        assert_eq!(mem::offset_of!(SavedGprs, rax), 0);
        assert_eq!(mem::offset_of!(SavedGprs, rbp), 6 * 8);
        assert_eq!(mem::offset_of!(SavedGprs, r15), 14 * 8);
    }
}
