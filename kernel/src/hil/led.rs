// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Interface for LEDs that abstract away polarity and pin.
//!
//! The isolation core only drives an LED on the fatal path, to signal the
//! fatal state to the operator.

/// Simple on/off interface for LED pins.
///
/// Since GPIO pins are synchronous in Tock the LED interface is synchronous as
/// well.
pub trait Led {
    /// Initialize the LED. Must be called before the LED is used.
    fn init(&mut self);

    /// Turn the LED on.
    fn on(&mut self);

    /// Turn the LED off.
    fn off(&mut self);

    /// Toggle the LED.
    fn toggle(&mut self);

    /// Return the current state of the LED.
    fn read(&self) -> bool;
}
