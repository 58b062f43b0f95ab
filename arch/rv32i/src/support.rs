// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Core low-level operations: interrupt masking and privilege transitions.

use isokernel::platform::chip::InterruptControl;

use crate::csr::{misa, mstatus, LocalRegisterCopy, CSR};

#[cfg(all(target_arch = "riscv32", target_os = "none"))]
use core::arch::asm;

/// Machine-mode global interrupt enable, driven through `mstatus.MIE`.
pub struct MachineInterrupts;

impl InterruptControl for MachineInterrupts {
    fn disable_interrupts(&self) {
        CSR.mstatus_clear(mstatus::mie::SET);
    }

    fn enable_interrupts(&self) {
        CSR.mstatus_set(mstatus::mie::SET);
    }

    fn interrupts_enabled(&self) -> bool {
        CSR.mstatus().is_set(mstatus::mie)
    }
}

/// Whether `misa` reports an implemented user mode.
///
/// A hart may hardwire `misa` to zero, in which case user mode support cannot
/// be established and this returns `false`.
pub fn misa_supports_user_mode(isa: LocalRegisterCopy<usize, misa::Register>) -> bool {
    isa.is_set(misa::u)
}

/// Whether the current hart implements user mode.
pub fn user_mode_supported() -> bool {
    misa_supports_user_mode(CSR.misa())
}

/// Compute the `mstatus` value that makes the next `mret` enter user mode.
///
/// `MPP` is set to user, the current `MIE` is parked in `MPIE` so that `mret`
/// restores it, and `MIE` is cleared so nothing can trap in between and
/// overwrite `MPP`.
pub fn user_return_status(
    mut status: LocalRegisterCopy<usize, mstatus::Register>,
) -> LocalRegisterCopy<usize, mstatus::Register> {
    let mpie = if status.is_set(mstatus::mie) {
        mstatus::mpie::SET
    } else {
        mstatus::mpie::CLEAR
    };
    status.modify(mstatus::mpp::User + mpie + mstatus::mie::CLEAR);
    status
}

/// Drop from machine mode to user mode and continue at the instruction after
/// this call.
///
/// The transition itself is the single `mret` instruction; no partially
/// transitioned state is observable.
///
/// # Safety
///
/// From here on every access is checked against the PMP. The caller must have
/// committed a policy that leaves the current code, stack and data accessible
/// to user mode, otherwise the next instruction fetch traps.
#[cfg(all(target_arch = "riscv32", target_os = "none"))]
pub unsafe fn drop_to_user_mode() {
    CSR.set_mstatus(user_return_status(CSR.mstatus()));
    unsafe {
        asm!(
            "la {tmp}, 1f",
            "csrw mepc, {tmp}",
            "mret",
            "1:",
            tmp = out(reg) _,
        );
    }
}

// Host builds, where there is no privilege mode to leave.
///
/// # Safety
///
/// See the bare-metal variant.
#[cfg(not(all(target_arch = "riscv32", target_os = "none")))]
pub unsafe fn drop_to_user_mode() {
    unimplemented!()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_return_parks_enabled_interrupts() {
        let mut status: LocalRegisterCopy<usize, mstatus::Register> = LocalRegisterCopy::new(0);
        status.modify(mstatus::mpp::Machine + mstatus::mie::SET);

        let next = user_return_status(status);
        assert_eq!(
            next.read_as_enum(mstatus::mpp),
            Some(mstatus::mpp::Value::User)
        );
        assert!(next.is_set(mstatus::mpie));
        assert!(!next.is_set(mstatus::mie));
    }

    #[test]
    fn user_return_keeps_interrupts_off() {
        let mut status: LocalRegisterCopy<usize, mstatus::Register> = LocalRegisterCopy::new(0);
        status.modify(mstatus::mpp::Machine + mstatus::mpie::SET);

        let next = user_return_status(status);
        assert!(!next.is_set(mstatus::mpie));
        assert!(!next.is_set(mstatus::mie));
        assert_eq!(next.read(mstatus::mpp), 0);
    }

    #[test]
    fn misa_user_bit() {
        // RV32IMAC with U: 'A' | 'C' | 'I' | 'M' | 'U', MXL = 1.
        let hifive1: usize = (1 << 0) | (1 << 2) | (1 << 8) | (1 << 12) | (1 << 20);
        assert!(misa_supports_user_mode(LocalRegisterCopy::new(hifive1)));
        assert!(!misa_supports_user_mode(LocalRegisterCopy::new(
            hifive1 & !(1 << 20)
        )));
        assert!(!misa_supports_user_mode(LocalRegisterCopy::new(0)));
    }
}
