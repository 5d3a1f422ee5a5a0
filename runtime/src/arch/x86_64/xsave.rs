// SPDX-FileCopyrightText: 2020 Sean Cross <sean@xobs.io>
// SPDX-License-Identifier: Apache-2.0

//! Extended processor state save/restore and the timing primitives the
//! stall and measurement variants use.
//!
//! The save area is stack-allocated by the switch policy. Rust has no
//! dynamic stack allocation, so the area is a fixed maximum sized for an
//! AVX-512 machine; `XSAVE_AREA_SIZE` is the documented cap.

use core::arch::asm;
use core::mem::MaybeUninit;

/// Upper bound on the XSAVE area (`xsave_max_size`). 2688 bytes covers the
/// full AVX-512 component set; the rest is headroom for newer components.
pub const XSAVE_AREA_SIZE: usize = 4096;

/// Offset and size of the XSAVE header, which must be zeroed before a
/// compacted save into a fresh buffer.
const XSAVE_HEADER_OFFSET: usize = 512;
const XSAVE_HEADER_SIZE: usize = 64;

/// A 64-byte aligned scratch buffer for one save/restore pair. Lives on
/// the interrupted uthread's stack for exactly the handler's dynamic scope.
#[repr(C, align(64))]
pub struct XsaveArea {
    bytes: [u8; XSAVE_AREA_SIZE],
}

impl XsaveArea {
    /// An uninitialized area with a zeroed header, ready for `xsavec`.
    /// Only the header needs clearing; the compacted save rewrites the
    /// rest of whatever it chooses to track.
    #[inline(always)]
    pub fn uninit() -> MaybeUninit<XsaveArea> {
        let mut area = MaybeUninit::<XsaveArea>::uninit();
        unsafe {
            let base = area.as_mut_ptr() as *mut u8;
            core::ptr::write_bytes(base.add(XSAVE_HEADER_OFFSET), 0, XSAVE_HEADER_SIZE);
        }
        area
    }
}

/// Reads an extended-control register: index 0 is XCR0 (enabled
/// components), index 1 is XINUSE (components in a non-initial state).
#[inline(always)]
pub fn xgetbv(index: u32) -> u64 {
    let lo: u32;
    let hi: u32;
    unsafe {
        // xgetbv
        asm!(
            ".byte 0x0f, 0x01, 0xd0",
            in("ecx") index,
            out("eax") lo,
            out("edx") hi,
            options(nomem, nostack),
        );
    }
    ((hi as u64) << 32) | lo as u64
}

/// Compacted save of the masked components into `area`.
///
/// # Safety
/// `area` must have a zeroed XSAVE header (see [`XsaveArea::uninit`]) and
/// must stay in place until the matching [`xrstor`].
#[inline(always)]
pub unsafe fn xsavec(area: &mut MaybeUninit<XsaveArea>, mask: u64) {
    // xsavec64 [rdi]
    asm!(
        ".byte 0x48, 0x0f, 0xc7, 0x27",
        in("rdi") area.as_mut_ptr(),
        in("eax") mask as u32,
        in("edx") (mask >> 32) as u32,
        options(nostack),
    );
}

/// Restores the masked components from `area`.
///
/// # Safety
/// `area` must hold the result of a prior [`xsavec`] with the same mask.
#[inline(always)]
pub unsafe fn xrstor(area: &MaybeUninit<XsaveArea>, mask: u64) {
    // xrstor64 [rdi]
    asm!(
        ".byte 0x48, 0x0f, 0xae, 0x2f",
        in("rdi") area.as_ptr(),
        in("eax") mask as u32,
        in("edx") (mask >> 32) as u32,
        options(nostack),
    );
}

/// Current timestamp counter.
#[inline(always)]
pub fn rdtsc() -> u64 {
    let lo: u32;
    let hi: u32;
    unsafe {
        asm!("rdtsc", out("eax") lo, out("edx") hi, options(nomem, nostack));
    }
    ((hi as u64) << 32) | lo as u64
}

/// User-mode timed pause until `cycles` TSC ticks from now, the C2-state
/// hint. Requires WAITPKG; the stall variant is only registered on
/// machines that have it.
#[inline(always)]
pub fn tpause(cycles: u64) {
    let deadline = rdtsc().wrapping_add(cycles);
    unsafe {
        // tpause ecx
        asm!(
            ".byte 0x66, 0x0f, 0xae, 0xf1",
            in("ecx") 0u32,
            in("eax") deadline as u32,
            in("edx") (deadline >> 32) as u32,
            options(nomem, nostack),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn area_is_aligned_for_xsave() {
        let area = XsaveArea::uninit();
        assert_eq!(area.as_ptr() as usize % 64, 0);
        assert_eq!(core::mem::size_of::<XsaveArea>(), XSAVE_AREA_SIZE);
    }

    #[test]
    fn header_is_zeroed() {
        let area = XsaveArea::uninit();
        let base = area.as_ptr() as *const u8;
        for i in 0..XSAVE_HEADER_SIZE {
            assert_eq!(unsafe { *base.add(XSAVE_HEADER_OFFSET + i) }, 0);
        }
    }

    #[test]
    fn tsc_is_monotonic_enough() {
        let a = rdtsc();
        let b = rdtsc();
        assert!(b >= a);
    }

    #[test]
    fn save_restore_round_trip() {
        if !std::is_x86_feature_detected!("xsavec") {
            return;
        }
        // XCR0 enumerates the enabled components; save and restore them.
        let mask = xgetbv(0);
        let mut area = XsaveArea::uninit();
        unsafe {
            xsavec(&mut area, mask);
            xrstor(&area, mask);
        }
    }
}
