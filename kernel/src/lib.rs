// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Architecture-independent core of the memory isolation subsystem.
//!
//! This crate holds the interfaces that the architecture crates implement and
//! that boot code drives:
//!
//! - [`platform::pmp::ProtectionUnit`]: the region commit interface,
//! - [`platform::chip::InterruptControl`]: masking interrupts on the fatal
//!   path,
//! - [`hil::led::Led`]: the operator-visible fatal indicator,
//! - [`debug::panic_blink_forever`]: the terminal diagnostic loop.
//!
//! Nothing in here touches hardware directly.

#![no_std]

pub mod config;
pub mod debug;
pub mod errorcode;
pub mod hil;
pub mod platform;

pub use crate::errorcode::ErrorCode;
