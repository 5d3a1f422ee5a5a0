// SPDX-FileCopyrightText: 2020 Sean Cross <sean@xobs.io>
// SPDX-License-Identifier: Apache-2.0

//! Typed view of the LAME configuration keys.
//!
//! Config-file discovery and parsing live in the enclosing runtime; this
//! module only interprets the flat `key value` set that loader hands us and
//! validates the cross-key constraints.

use crate::bundle::BUNDLE_CAPACITY_MAX;
use crate::Error;

/// Which interrupt source (and handler variant) to register with the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterMode {
    /// Do not register; LAME stays inert.
    None,
    /// Software interrupt embedded in application code.
    Int,
    /// Performance-counter overflow re-vectored by the kernel driver.
    Pmu,
    /// PMU source, but emulate a timed stall instead of switching.
    Stall,
    /// PMU source, enter and return immediately (baseline overhead).
    Nop,
}

/// TSC measurement overrides. `Pretend` walks the full save/restore path
/// without the jump and is only meaningful for bundle size 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TscMode {
    Off,
    Pretend,
    Nop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Bundle capacity per worker. 1 disables bundling entirely.
    pub bundle_size: u32,
    pub register: RegisterMode,
    pub tsc: TscMode,
    /// Code-range bitmap region size is `2^factor` bytes; negative disables
    /// the bitmap (every switch saves extended state).
    pub bitmap_pgsz_factor: i32,
    /// Cycle budget for the `stall` variant's timed pause.
    pub stall_cycles: u64,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            bundle_size: 1,
            register: RegisterMode::None,
            tsc: TscMode::Off,
            bitmap_pgsz_factor: 6,
            stall_cycles: 600,
        }
    }
}

impl Config {
    /// Parses the flat key/value lines the external config loader produces.
    /// Unknown keys are ignored (they belong to other subsystems); a known
    /// key with an unparseable value is an error.
    pub fn parse(flat: &str) -> Result<Config, Error> {
        let mut cfg = Config::default();
        for line in flat.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut words = line.split_whitespace();
            let key = match words.next() {
                Some(k) => k,
                None => continue,
            };
            let val = words.next().unwrap_or("");
            match key {
                "lame_bundle_size" => {
                    cfg.bundle_size = val.parse().map_err(|_| Error::InvalidConfig)?
                }
                "lame_register" => {
                    cfg.register = match val {
                        "none" => RegisterMode::None,
                        "int" => RegisterMode::Int,
                        "pmu" => RegisterMode::Pmu,
                        "stall" => RegisterMode::Stall,
                        "nop" => RegisterMode::Nop,
                        _ => return Err(Error::InvalidConfig),
                    }
                }
                "lame_tsc" => {
                    cfg.tsc = match val {
                        "off" => TscMode::Off,
                        "pretend" => TscMode::Pretend,
                        "nop" => TscMode::Nop,
                        _ => return Err(Error::InvalidConfig),
                    }
                }
                "lame_bitmap_pgsz_factor" => {
                    cfg.bitmap_pgsz_factor = val.parse().map_err(|_| Error::InvalidConfig)?
                }
                "lame_stall_cycles" => {
                    cfg.stall_cycles = val.parse().map_err(|_| Error::InvalidConfig)?
                }
                _ => (),
            }
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.bundle_size == 0 || self.bundle_size as usize > BUNDLE_CAPACITY_MAX {
            log::error!(
                "lame_bundle_size {} out of range (1..={})",
                self.bundle_size,
                BUNDLE_CAPACITY_MAX
            );
            return Err(Error::InvalidConfig);
        }
        if self.tsc != TscMode::Off && self.bundle_size != 2 {
            log::error!(
                "LAME TSC measurement mode is only supported for bundle size 2, got {}",
                self.bundle_size
            );
            return Err(Error::InvalidConfig);
        }
        if self.tsc != TscMode::Off && self.register != RegisterMode::Int {
            log::error!("LAME TSC measurement modes require lame_register int");
            return Err(Error::InvalidConfig);
        }
        Ok(())
    }
}

static CONFIG: spin::Once<Config> = spin::Once::new();

/// Commits the process-wide configuration. First caller wins; later calls
/// are ignored, matching the read-only-after-init contract.
pub fn set(cfg: Config) {
    CONFIG.call_once(|| cfg);
}

pub fn get() -> &'static Config {
    CONFIG.call_once(Config::default)
}
