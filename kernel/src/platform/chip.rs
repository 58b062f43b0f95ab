// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Interfaces for the processor core the isolation core runs on.

/// Global interrupt masking on the current hart.
///
/// The isolation core is single-core. Region tables are committed before the
/// scheduler starts or with interrupts masked, and the fatal path masks
/// interrupts before it starts signalling the operator.
pub trait InterruptControl {
    /// Mask all interrupts on this hart.
    fn disable_interrupts(&self);

    /// Unmask interrupts on this hart.
    fn enable_interrupts(&self);

    /// Whether interrupts are currently unmasked on this hart.
    fn interrupts_enabled(&self) -> bool;

    /// Run `f` with interrupts masked, then restore the previous mask state.
    ///
    /// Interrupts are re-enabled afterwards only if they were enabled on
    /// entry, so `atomic` can be nested inside a window the caller already
    /// masked.
    fn atomic<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
        Self: Sized,
    {
        let were_enabled = self.interrupts_enabled();
        self.disable_interrupts();
        let res = f();
        if were_enabled {
            self.enable_interrupts();
        }
        res
    }
}
