// SPDX-FileCopyrightText: 2020 Sean Cross <sean@xobs.io>
// SPDX-License-Identifier: Apache-2.0

//! The fixed-layout register save area for a uthread.
//!
//! The entry stubs and the cooperative jump in [`super::entry`] address
//! these fields by byte offset; the layout is `repr(C)` and checked by the
//! tests below so a reordering shows up as a test failure rather than as
//! register corruption.

use super::entry::SavedGprs;

/// Saved general-purpose register state plus return metadata.
///
/// Field order: the volatile (caller-saved) registers the entry stubs
/// marshal, then the callee-saved registers the cooperative jump moves,
/// then stack pointer, instruction pointer and flags.
#[derive(Debug, Default, Copy, Clone)]
#[repr(C)]
pub struct Trapframe {
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub rax: u64,

    pub rbx: u64,
    pub rbp: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,

    pub rsp: u64,
    pub rip: u64,
    pub rflags: u64,
}

/// Initial RFLAGS for a fresh context: interrupts enabled, reserved bit set.
const RFLAGS_INIT: u64 = 0x202;

impl Trapframe {
    /// Primes a trapframe so the first switch into it calls `entry(arg)` on
    /// the given stack through the architecture trampoline. The argument
    /// and entry point ride in callee-saved registers because those are the
    /// only ones the cooperative jump transfers.
    pub fn init_call(tf: &mut Trapframe, entry: extern "C" fn(usize), arg: usize, stack_top: usize) {
        *tf = Trapframe::default();
        tf.r12 = arg as u64;
        tf.r13 = entry as usize as u64;
        tf.rsp = (stack_top & !15) as u64;
        tf.rip = super::entry::uthread_trampoline as usize as u64;
        tf.rflags = RFLAGS_INIT;
    }

    /// Records the state the entry stub captured on the interrupted stack:
    /// the full GPR block plus the pushed return address, flags, and the
    /// stack pointer the interrupted uthread will resume with.
    pub fn store_interrupted(&mut self, gprs: &SavedGprs, rip: u64, rflags: u64, rsp: u64) {
        self.rax = gprs.rax;
        self.rbx = gprs.rbx;
        self.rcx = gprs.rcx;
        self.rdx = gprs.rdx;
        self.rsi = gprs.rsi;
        self.rdi = gprs.rdi;
        self.rbp = gprs.rbp;
        self.r8 = gprs.r8;
        self.r9 = gprs.r9;
        self.r10 = gprs.r10;
        self.r11 = gprs.r11;
        self.r12 = gprs.r12;
        self.r13 = gprs.r13;
        self.r14 = gprs.r14;
        self.r15 = gprs.r15;
        self.rip = rip;
        self.rflags = rflags;
        self.rsp = rsp;
    }
}

impl core::fmt::Display for Trapframe {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        writeln!(
            f,
            "RIP:{:016x}  RSP:{:016x}  RFL:{:016x}",
            self.rip, self.rsp, self.rflags
        )?;
        writeln!(
            f,
            "RAX:{:016x}  RBX:{:016x}  RCX:{:016x}  RDX:{:016x}",
            self.rax, self.rbx, self.rcx, self.rdx
        )?;
        writeln!(
            f,
            "RSI:{:016x}  RDI:{:016x}  RBP:{:016x}  R8: {:016x}",
            self.rsi, self.rdi, self.rbp, self.r8
        )?;
        writeln!(
            f,
            "R9: {:016x}  R10:{:016x}  R11:{:016x}  R12:{:016x}",
            self.r9, self.r10, self.r11, self.r12
        )?;
        writeln!(
            f,
            "R13:{:016x}  R14:{:016x}  R15:{:016x}",
            self.r13, self.r14, self.r15
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem;

    #[test]
    fn layout_is_stable() {
        // The cooperative jump addresses these by offset.
        assert_eq!(mem::size_of::<Trapframe>(), 18 * 8);
        assert_eq!(mem::offset_of!(Trapframe, rbx), 9 * 8);
        assert_eq!(mem::offset_of!(Trapframe, r15), 14 * 8);
        assert_eq!(mem::offset_of!(Trapframe, rsp), 15 * 8);
        assert_eq!(mem::offset_of!(Trapframe, rip), 16 * 8);
        assert_eq!(mem::offset_of!(Trapframe, rflags), 17 * 8);
    }

    #[test]
    fn register_dump_is_complete() {
        let mut tf = Trapframe::default();
        tf.rip = 0x40_1234;
        tf.r15 = 0xdead_beef;
        let dump = format!("{}", tf);
        assert!(dump.contains("RIP:0000000000401234"));
        assert!(dump.contains("R15:00000000deadbeef"));
    }

    #[test]
    fn init_call_aligns_the_stack(){
        extern "C" fn nop(_: usize) {}
        let mut tf = Trapframe::default();
        Trapframe::init_call(&mut tf, nop, 7, 0x7fff_1234_5679);
        assert_eq!(tf.rsp % 16, 0);
        assert_eq!(tf.r12, 7);
        assert_eq!(tf.rflags, 0x202);
    }
}
