// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Machine-mode control and status registers used by the isolation core.
//!
//! Field layouts are described with `register_bitfields!` so that callers
//! decode and build values through [`LocalRegisterCopy`] rather than with raw
//! shifts. The accessors on [`CSR`] execute `csrr`/`csrw` and are therefore
//! only available when building for a bare-metal RV32 target.

use tock_registers::fields::FieldValue;
use tock_registers::register_bitfields;

#[cfg(all(target_arch = "riscv32", target_os = "none"))]
use core::arch::asm;

pub use tock_registers::LocalRegisterCopy;

register_bitfields![usize,
    pub mcause [
        is_interrupt OFFSET(crate::XLEN - 1) NUMBITS(1) [],
        reason OFFSET(0) NUMBITS(crate::XLEN - 1) []
    ],
    pub mstatus [
        mie OFFSET(3) NUMBITS(1) [],
        mpie OFFSET(7) NUMBITS(1) [],
        mpp OFFSET(11) NUMBITS(2) [
            User = 0,
            Supervisor = 1,
            Machine = 3
        ]
    ],
    pub misa [
        s OFFSET(18) NUMBITS(1) [],
        u OFFSET(20) NUMBITS(1) []
    ]
];

/// Number of `pmpcfgX` CSRs on RV32. Each holds four entry octets.
pub const PMPCFG_REGISTERS: usize = 4;

/// Number of `pmpaddrX` CSRs addressable through [`CSR`].
pub const PMPADDR_REGISTERS: usize = 16;

#[cfg(all(target_arch = "riscv32", target_os = "none"))]
macro_rules! csr_read {
    ($csr:literal) => {{
        let r: usize;
        unsafe {
            asm!(concat!("csrr {rd}, ", stringify!($csr)), rd = out(reg) r);
        }
        r
    }};
}

#[cfg(all(target_arch = "riscv32", target_os = "none"))]
macro_rules! csr_write {
    ($csr:literal, $val:expr) => {{
        let v: usize = $val;
        unsafe {
            asm!(concat!("csrw ", stringify!($csr), ", {rs}"), rs = in(reg) v);
        }
    }};
}

#[cfg(all(target_arch = "riscv32", target_os = "none"))]
macro_rules! csr_bits {
    ($op:literal, $csr:literal, $val:expr) => {{
        let v: usize = $val;
        unsafe {
            asm!(concat!($op, " ", stringify!($csr), ", {rs}"), rs = in(reg) v);
        }
    }};
}

/// Accessor for the machine-mode CSRs of the current hart. CSRs are per-hart
/// and the isolation core is single-core, so the unit value `CSR` is the only
/// instance that is ever needed.
pub struct CSR;

#[cfg(all(target_arch = "riscv32", target_os = "none"))]
impl CSR {
    pub fn mcause(&self) -> LocalRegisterCopy<usize, mcause::Register> {
        LocalRegisterCopy::new(csr_read!(0x342))
    }

    pub fn mepc(&self) -> usize {
        csr_read!(0x341)
    }

    pub fn set_mepc(&self, pc: usize) {
        csr_write!(0x341, pc)
    }

    pub fn mtval(&self) -> usize {
        csr_read!(0x343)
    }

    pub fn mstatus(&self) -> LocalRegisterCopy<usize, mstatus::Register> {
        LocalRegisterCopy::new(csr_read!(0x300))
    }

    pub fn set_mstatus(&self, value: LocalRegisterCopy<usize, mstatus::Register>) {
        csr_write!(0x300, value.get())
    }

    /// Set the bits of `field` in `mstatus` with a single `csrs`.
    pub fn mstatus_set(&self, field: FieldValue<usize, mstatus::Register>) {
        csr_bits!("csrs", 0x300, field.value)
    }

    /// Clear the bits covered by `field` in `mstatus` with a single `csrc`.
    pub fn mstatus_clear(&self, field: FieldValue<usize, mstatus::Register>) {
        csr_bits!("csrc", 0x300, field.mask())
    }

    pub fn misa(&self) -> LocalRegisterCopy<usize, misa::Register> {
        LocalRegisterCopy::new(csr_read!(0x301))
    }

    pub fn pmpconfig_get(&self, index: usize) -> usize {
        match index {
            0 => csr_read!(0x3A0),
            1 => csr_read!(0x3A1),
            2 => csr_read!(0x3A2),
            3 => csr_read!(0x3A3),
            _ => 0,
        }
    }

    pub fn pmpconfig_set(&self, index: usize, value: usize) {
        match index {
            0 => csr_write!(0x3A0, value),
            1 => csr_write!(0x3A1, value),
            2 => csr_write!(0x3A2, value),
            3 => csr_write!(0x3A3, value),
            _ => {}
        }
    }

    pub fn pmpaddr_get(&self, index: usize) -> usize {
        match index {
            0 => csr_read!(0x3B0),
            1 => csr_read!(0x3B1),
            2 => csr_read!(0x3B2),
            3 => csr_read!(0x3B3),
            4 => csr_read!(0x3B4),
            5 => csr_read!(0x3B5),
            6 => csr_read!(0x3B6),
            7 => csr_read!(0x3B7),
            8 => csr_read!(0x3B8),
            9 => csr_read!(0x3B9),
            10 => csr_read!(0x3BA),
            11 => csr_read!(0x3BB),
            12 => csr_read!(0x3BC),
            13 => csr_read!(0x3BD),
            14 => csr_read!(0x3BE),
            15 => csr_read!(0x3BF),
            _ => 0,
        }
    }

    pub fn pmpaddr_set(&self, index: usize, value: usize) {
        match index {
            0 => csr_write!(0x3B0, value),
            1 => csr_write!(0x3B1, value),
            2 => csr_write!(0x3B2, value),
            3 => csr_write!(0x3B3, value),
            4 => csr_write!(0x3B4, value),
            5 => csr_write!(0x3B5, value),
            6 => csr_write!(0x3B6, value),
            7 => csr_write!(0x3B7, value),
            8 => csr_write!(0x3B8, value),
            9 => csr_write!(0x3B9, value),
            10 => csr_write!(0x3BA, value),
            11 => csr_write!(0x3BB, value),
            12 => csr_write!(0x3BC, value),
            13 => csr_write!(0x3BD, value),
            14 => csr_write!(0x3BE, value),
            15 => csr_write!(0x3BF, value),
            _ => {}
        }
    }
}

// Host builds, where these registers do not exist.
#[cfg(not(all(target_arch = "riscv32", target_os = "none")))]
impl CSR {
    pub fn mcause(&self) -> LocalRegisterCopy<usize, mcause::Register> {
        unimplemented!()
    }

    pub fn mepc(&self) -> usize {
        unimplemented!()
    }

    pub fn set_mepc(&self, _pc: usize) {
        unimplemented!()
    }

    pub fn mtval(&self) -> usize {
        unimplemented!()
    }

    pub fn mstatus(&self) -> LocalRegisterCopy<usize, mstatus::Register> {
        unimplemented!()
    }

    pub fn set_mstatus(&self, _value: LocalRegisterCopy<usize, mstatus::Register>) {
        unimplemented!()
    }

    pub fn mstatus_set(&self, _field: FieldValue<usize, mstatus::Register>) {
        unimplemented!()
    }

    pub fn mstatus_clear(&self, _field: FieldValue<usize, mstatus::Register>) {
        unimplemented!()
    }

    pub fn misa(&self) -> LocalRegisterCopy<usize, misa::Register> {
        unimplemented!()
    }

    pub fn pmpconfig_get(&self, _index: usize) -> usize {
        unimplemented!()
    }

    pub fn pmpconfig_set(&self, _index: usize, _value: usize) {
        unimplemented!()
    }

    pub fn pmpaddr_get(&self, _index: usize) -> usize {
        unimplemented!()
    }

    pub fn pmpaddr_set(&self, _index: usize, _value: usize) {
        unimplemented!()
    }
}
