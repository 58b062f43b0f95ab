// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Data structure for storing compile-time configuration options in the
//! isolation core.
//!
//! The rationale for using these configuration options is that they can be
//! used to remove diagnostic code (e.g. PMP table dumps) from the trap and boot
//! paths when they are not needed. The `const` values are checked with plain
//! `if` statements, which the compiler removes when the option is off.
//!
//! To change the configuration, enable the matching cargo feature of this crate
//! from the board's `Cargo.toml`.

/// Data structure holding compile-time configuration options.
///
/// To change the configuration, modify the relevant values in the `CONFIG`
/// constant object defined at the end of this file.
pub struct Config {
    /// Whether the PMP table is dumped to the log after every commit pass.
    pub trace_pmp: bool,

    /// Whether handled access faults are logged from the trap handler.
    ///
    /// The trap path must not block. Only enable this with a logger whose
    /// `log` implementation is non-blocking.
    pub trace_faults: bool,

    /// Whether the fatal path logs the reason before entering the diagnostic
    /// loop.
    pub log_fatal: bool,

    /// Number of spin iterations between two toggles of the fatal indicator.
    ///
    /// Interrupts are disabled on the fatal path, so the delay is a crude busy
    /// loop rather than a timer.
    pub fatal_blink_delay: usize,
}

/// A unique instance of `Config` where compile-time configuration options are
/// defined. These options are available in the isolation core and its
/// architecture crates via `isokernel::config::CONFIG`.
pub const CONFIG: Config = Config {
    trace_pmp: cfg!(feature = "trace_pmp"),
    trace_faults: cfg!(feature = "trace_faults"),
    log_fatal: !cfg!(feature = "quiet_fatal"),
    fatal_blink_delay: 0x1_ffff,
};
