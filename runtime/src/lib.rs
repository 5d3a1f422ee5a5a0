// SPDX-FileCopyrightText: 2020 Sean Cross <sean@xobs.io>
// SPDX-License-Identifier: Apache-2.0

//! LAME bundle scheduling core.
//!
//! Each worker thread owns a small fixed-capacity bundle of uthreads. A
//! user-level interrupt (delivered by a software `int` in application code,
//! or by a performance-counter overflow re-vectored by the kernel driver)
//! lands in one of the entry stubs in [`arch`], which marshals the
//! interrupted register state into the current uthread's trapframe and
//! hands control to the switch policy in [`sched`]. The policy rotates the
//! bundle round-robin and jumps directly into a sibling uthread, so cycles
//! that would be spent stalled in one uthread make forward progress in
//! another, without a trip through the host kernel scheduler.
//!
//! The bundle is dismantled back onto the owning worker's runqueue whenever
//! the host scheduler needs its members again (park, yield, preemption, or
//! worker exit); see [`kthread`].

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate lazy_static;

pub mod arch;
pub mod bitmap;
pub mod bundle;
pub mod config;
pub mod driver;
pub mod kthread;
pub mod preempt;
pub mod sched;
pub mod thread;

pub use bundle::{Bundle, BUNDLE_CAPACITY_MAX};
pub use config::{Config, RegisterMode, TscMode};
pub use kthread::Kthread;
pub use thread::{ThreadState, Uthread};

/// Errors surfaced by bundle operations and runtime initialization.
///
/// Bundle-operation errors are returned to the caller and never abort the
/// process. Registration failures downgrade the runtime to "LAME disabled".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Every slot in the bundle is occupied.
    NoSpace,
    /// The uthread is not present in the bundle.
    NotFound,
    /// A slot index was out of range.
    BadIndex,
    /// The operation requires an enabled bundle.
    BundleDisabled,
    /// A configuration key combination is invalid.
    InvalidConfig,
    /// The kernel driver could not be opened or programmed.
    DriverIo,
    /// An internal consistency check failed.
    Internal,
}

/// Initializes the LAME subsystem for this process.
///
/// Loads the code-range bitmap (if configured) and registers the chosen
/// entry stub with the kernel driver. A registration failure is downgraded:
/// the process continues with LAME disabled and bundled workloads run like
/// the baseline runtime.
pub fn init(cfg: Config) -> Result<(), Error> {
    cfg.validate()?;
    config::set(cfg);
    let cfg = config::get();

    log::info!(
        "LAME handler stub address: {:p}(size=2); {:p}(general)",
        arch::entry::lame_entry2 as *const (),
        arch::entry::lame_entry as *const (),
    );

    if let Err(e) = bitmap::init(cfg) {
        // A missing gprdump only costs precision: every switch saves
        // extended state.
        log::warn!("code-range bitmap unavailable ({:?}); saving extended state on every switch", e);
    }

    if let Err(e) = driver::register(cfg) {
        log::warn!("WARNING: LAME capability not enabled ({:?})", e);
    }

    Ok(())
}
