// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Fatal diagnostics for the isolation core.
//!
//! There are exactly two ways into the fatal state: a configuration error
//! while installing an isolation policy at boot, and a trap whose cause has no
//! registered handler. Both end in [`fatal`], which masks interrupts and
//! blinks the indicator LEDs forever. There is no recovery and no restart.

use core::fmt;

use crate::config;
use crate::hil::led::Led;
use crate::platform::chip::InterruptControl;

/// Enter the fatal state.
///
/// Disables further interrupts through `chip`, optionally logs `reason`, and
/// never returns.
pub fn fatal<C: InterruptControl + ?Sized>(
    chip: &C,
    leds: &mut [&mut dyn Led],
    reason: fmt::Arguments<'_>,
) -> ! {
    chip.disable_interrupts();

    if config::CONFIG.log_fatal {
        log::error!("isolation fault, halting: {}", reason);
    }

    panic_blink_forever(leds)
}

/// Blink the given LEDs forever, with a busy-loop delay between toggles.
///
/// Interrupts are expected to be disabled by the caller. With an empty `leds`
/// slice this only spins.
pub fn panic_blink_forever(leds: &mut [&mut dyn Led]) -> ! {
    for led in leds.iter_mut() {
        led.init();
        led.off();
    }

    loop {
        for _ in 0..config::CONFIG.fatal_blink_delay {
            core::hint::spin_loop();
        }
        for led in leds.iter_mut() {
            led.toggle();
        }
    }
}
