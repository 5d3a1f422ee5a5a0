// SPDX-FileCopyrightText: 2020 Sean Cross <sean@xobs.io>
// SPDX-License-Identifier: Apache-2.0

pub mod entry;
pub mod trapframe;
pub mod xsave;

pub use xsave::rdtsc;
