// SPDX-FileCopyrightText: 2020 Sean Cross <sean@xobs.io>
// SPDX-License-Identifier: Apache-2.0

//! The slice of the host runtime's preemption machinery the handler
//! consumes: a per-thread disable count. The counter nests; preemption is
//! enabled only at zero.

use core::cell::Cell;

thread_local! {
    static PREEMPT_CNT: Cell<u32> = Cell::new(0);
}

pub fn disable() {
    PREEMPT_CNT.with(|c| c.set(c.get() + 1));
}

pub fn enable() {
    PREEMPT_CNT.with(|c| c.set(c.get().saturating_sub(1)));
}

pub fn enabled() -> bool {
    PREEMPT_CNT.with(|c| c.get()) == 0
}

/// Current nesting depth. The LAME handler holds one level itself, so it
/// checks `count() > 1` to see whether the application had preemption off.
pub(crate) fn count() -> u32 {
    PREEMPT_CNT.with(|c| c.get())
}

/// Fresh uthread contexts start with preemption enabled regardless of the
/// state the switch that created them ran under.
pub(crate) fn reset() {
    PREEMPT_CNT.with(|c| c.set(0));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nesting() {
        reset();
        assert!(enabled());
        disable();
        disable();
        assert!(!enabled());
        enable();
        assert!(!enabled());
        enable();
        assert!(enabled());
        // enable() below zero must not wrap
        enable();
        assert!(enabled());
    }
}
