// SPDX-FileCopyrightText: 2020 Sean Cross <sean@xobs.io>
// SPDX-License-Identifier: Apache-2.0

//! Registration with the `/dev/lame` kernel driver.
//!
//! The driver exposes two ioctls, one per interrupt source. Registration
//! hands it the address of exactly one entry stub; from then on the kernel
//! re-vectors that source into the stub with the architectural frame the
//! stubs expect. Registration happens once at startup and the device is
//! closed immediately afterwards.

use core::mem;

use crate::arch::entry;
use crate::config::{Config, RegisterMode, TscMode};
use crate::sched::Variant;
use crate::Error;

/// Argument block for the registration ioctls. Layout is shared with the
/// kernel driver.
#[repr(C)]
pub struct LameArg {
    pub present: u8,
    pub handler_addr: u64,
}

const LAME_IOC_MAGIC: u64 = b'l' as u64;

// _IOW(magic, nr, size)
const fn iow(nr: u64, size: u64) -> u64 {
    const IOC_WRITE: u64 = 1;
    (IOC_WRITE << 30) | (size << 16) | (LAME_IOC_MAGIC << 8) | nr
}

/// "register INT": redirect the software-interrupt vector.
pub const LAME_REGISTER_INT: u64 = iow(1, mem::size_of::<LameArg>() as u64);
/// "register PMU": redirect performance-counter overflows.
pub const LAME_REGISTER_PMU: u64 = iow(2, mem::size_of::<LameArg>() as u64);

/// The outcome of stub selection: which ioctl to issue, which stub address
/// to hand over, and the policy variant that stub is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub command: u64,
    pub handler: usize,
    pub variant: Variant,
}

/// Maps the configuration onto a concrete stub. Capacity 2 gets the
/// fixed-unroll stubs; the TSC measurement overrides replace the switch
/// stub outright. Returns `None` when registration is disabled.
pub(crate) fn select_stub(cfg: &Config) -> Option<Registration> {
    let reg = match cfg.register {
        RegisterMode::None => return None,
        RegisterMode::Int => match cfg.tsc {
            TscMode::Pretend => Registration {
                command: LAME_REGISTER_INT,
                handler: entry::lame_entry2_pretend as usize,
                variant: Variant::Pretend,
            },
            TscMode::Nop => Registration {
                command: LAME_REGISTER_INT,
                handler: entry::lame_entry_nop as usize,
                variant: Variant::Nop,
            },
            TscMode::Off => Registration {
                command: LAME_REGISTER_INT,
                handler: if cfg.bundle_size == 2 {
                    entry::lame_entry2 as usize
                } else {
                    entry::lame_entry as usize
                },
                variant: Variant::Switch,
            },
        },
        RegisterMode::Pmu => Registration {
            command: LAME_REGISTER_PMU,
            handler: if cfg.bundle_size == 2 {
                entry::lame_entry2_bret as usize
            } else {
                entry::lame_entry_bret as usize
            },
            variant: Variant::Switch,
        },
        RegisterMode::Stall => Registration {
            command: LAME_REGISTER_PMU,
            handler: entry::lame_entry_stall_bret as usize,
            variant: Variant::Stall,
        },
        RegisterMode::Nop => Registration {
            command: LAME_REGISTER_PMU,
            handler: entry::lame_entry_nop_bret as usize,
            variant: Variant::Nop,
        },
    };
    Some(reg)
}

/// Opens the driver and registers the configured stub. A `None` register
/// mode succeeds without touching the device; any driver failure is
/// reported to the caller, which downgrades the runtime to LAME-disabled.
pub fn register(cfg: &Config) -> Result<(), Error> {
    let reg = match select_stub(cfg) {
        Some(reg) => reg,
        None => {
            log::warn!("WARNING: LAME handler not registered");
            return Ok(());
        }
    };

    if cfg.tsc != TscMode::Off {
        log::warn!(
            "WARNING: in LAME TSC measurement mode ({})",
            if cfg.tsc == TscMode::Pretend { "pretend" } else { "nop" }
        );
    }

    let arg = LameArg {
        present: 1,
        handler_addr: reg.handler as u64,
    };

    unsafe {
        let fd = libc::open(b"/dev/lame\0".as_ptr() as *const libc::c_char, libc::O_RDWR);
        if fd < 0 {
            log::error!(
                "[errno {}] failed to open /dev/lame",
                std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
            );
            return Err(Error::DriverIo);
        }

        let rc = libc::ioctl(fd, reg.command as libc::c_ulong, &arg as *const LameArg);
        let err = std::io::Error::last_os_error();
        libc::close(fd);
        if rc < 0 {
            log::error!(
                "[errno {}] ioctl LAME_REGISTER failed",
                err.raw_os_error().unwrap_or(0)
            );
            return Err(Error::DriverIo);
        }
    }

    log::info!(
        "LAME handler registered at {:#x} [bundle size: {}][mode: {:?}]",
        reg.handler,
        cfg.bundle_size,
        cfg.register
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(size: u32, register: RegisterMode, tsc: TscMode) -> Config {
        Config {
            bundle_size: size,
            register,
            tsc,
            ..Config::default()
        }
    }

    #[test]
    fn ioctl_commands_encode_the_arg_size() {
        assert_eq!(mem::size_of::<LameArg>(), 16);
        assert_eq!(LAME_REGISTER_INT, (1 << 30) | (16 << 16) | (0x6c << 8) | 1);
        assert_eq!(LAME_REGISTER_PMU, (1 << 30) | (16 << 16) | (0x6c << 8) | 2);
    }

    #[test]
    fn capacity_two_gets_the_unrolled_stubs() {
        let reg = select_stub(&cfg(2, RegisterMode::Int, TscMode::Off)).unwrap();
        assert_eq!(reg.handler, entry::lame_entry2 as usize);
        assert_eq!(reg.command, LAME_REGISTER_INT);
        assert_eq!(reg.variant, Variant::Switch);

        let reg = select_stub(&cfg(2, RegisterMode::Pmu, TscMode::Off)).unwrap();
        assert_eq!(reg.handler, entry::lame_entry2_bret as usize);
        assert_eq!(reg.command, LAME_REGISTER_PMU);
    }

    #[test]
    fn general_stubs_for_other_capacities() {
        let reg = select_stub(&cfg(4, RegisterMode::Int, TscMode::Off)).unwrap();
        assert_eq!(reg.handler, entry::lame_entry as usize);
        let reg = select_stub(&cfg(4, RegisterMode::Pmu, TscMode::Off)).unwrap();
        assert_eq!(reg.handler, entry::lame_entry_bret as usize);
    }

    #[test]
    fn stall_and_nop_ride_the_pmu_command() {
        let reg = select_stub(&cfg(4, RegisterMode::Stall, TscMode::Off)).unwrap();
        assert_eq!(reg.command, LAME_REGISTER_PMU);
        assert_eq!(reg.handler, entry::lame_entry_stall_bret as usize);
        assert_eq!(reg.variant, Variant::Stall);

        let reg = select_stub(&cfg(4, RegisterMode::Nop, TscMode::Off)).unwrap();
        assert_eq!(reg.handler, entry::lame_entry_nop_bret as usize);
        assert_eq!(reg.variant, Variant::Nop);
    }

    #[test]
    fn tsc_overrides_replace_the_switch_stub() {
        let reg = select_stub(&cfg(2, RegisterMode::Int, TscMode::Pretend)).unwrap();
        assert_eq!(reg.handler, entry::lame_entry2_pretend as usize);
        assert_eq!(reg.variant, Variant::Pretend);

        let reg = select_stub(&cfg(2, RegisterMode::Int, TscMode::Nop)).unwrap();
        assert_eq!(reg.handler, entry::lame_entry_nop as usize);
        assert_eq!(reg.variant, Variant::Nop);
    }

    #[test]
    fn none_means_no_registration() {
        assert!(select_stub(&cfg(2, RegisterMode::None, TscMode::Off)).is_none());
        assert!(register(&cfg(2, RegisterMode::None, TscMode::Off)).is_ok());
    }

    #[test]
    fn missing_driver_reports_io_error() {
        // No /dev/lame on the build machine: registration must fail
        // cleanly so the caller can downgrade.
        if std::path::Path::new("/dev/lame").exists() {
            return;
        }
        let err = register(&cfg(2, RegisterMode::Int, TscMode::Off));
        assert_eq!(err, Err(Error::DriverIo));
    }
}
