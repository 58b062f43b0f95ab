// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Support for the 32-bit RISC-V physical memory protection unit and the
//! machine-mode trap path that handles its access faults.

#![no_std]

pub mod csr;
pub mod isolation;
pub mod pmp;
pub mod support;
pub mod trap;

/// Width of the integer registers (and CSRs) of the hart.
pub const XLEN: usize = core::mem::size_of::<usize>() * 8;
