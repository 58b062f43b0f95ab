// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! A register-accurate PMP model for host builds.
//!
//! Behaves like the CSRs of an RV32 hart for everything the commit driver can
//! observe: locked entries ignore writes, a locked TOR entry also freezes the
//! previous address register, the reserved bits and permission combinations
//! are WARL, and a platform granularity `G` shows up on `pmpaddr` read-back.

use core::cell::Cell;

use super::{AddressMode, PMPConfig, PhysicalPMP};

/// `pmpaddrX` is 32 bits wide on RV32.
const PMPADDR_MASK: usize = 0xFFFF_FFFF;

/// Octet bits that are WIRI: bits 5 and 6.
const PMPCFG_WRITABLE: u8 = 0b1001_1111;

pub struct SimulatedPMP<const ENTRIES: usize> {
    cfg: [Cell<u8>; ENTRIES],
    addr: [Cell<usize>; ENTRIES],
    /// Granularity exponent: regions are at least `2^(G + 2)` bytes.
    granularity: u32,
}

impl<const ENTRIES: usize> SimulatedPMP<ENTRIES> {
    /// A PMP with the finest granularity (4 bytes), all entries off.
    pub fn new() -> Self {
        Self::with_granularity(0)
    }

    /// A PMP whose smallest region is `2^(g + 2)` bytes.
    pub fn with_granularity(g: u32) -> Self {
        SimulatedPMP {
            cfg: core::array::from_fn(|_| Cell::new(0)),
            addr: core::array::from_fn(|_| Cell::new(0)),
            granularity: g,
        }
    }

    /// Hart reset: clears every entry, including locked ones.
    pub fn reset(&self) {
        for (cfg, addr) in self.cfg.iter().zip(self.addr.iter()) {
            cfg.set(0);
            addr.set(0);
        }
    }

    fn config(&self, index: usize) -> PMPConfig {
        PMPConfig::from_raw(self.cfg[index].get())
    }

    fn addr_locked(&self, index: usize) -> bool {
        if self.config(index).is_locked() {
            return true;
        }
        match self.cfg.get(index + 1) {
            Some(next) => {
                let next = PMPConfig::from_raw(next.get());
                next.is_locked() && next.mode() == AddressMode::Tor
            }
            None => false,
        }
    }
}

impl<const ENTRIES: usize> Default for SimulatedPMP<ENTRIES> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const ENTRIES: usize> PhysicalPMP for SimulatedPMP<ENTRIES> {
    fn entries(&self) -> usize {
        ENTRIES
    }

    fn cfg_get(&self, index: usize) -> u8 {
        self.cfg[index].get()
    }

    fn cfg_set(&self, index: usize, cfg: u8) {
        if self.config(index).is_locked() {
            return;
        }

        let cfg = cfg & PMPCFG_WRITABLE;
        // W without R is reserved; the write is dropped.
        if cfg & 0b011 == 0b010 {
            return;
        }
        // NA4 is not selectable when regions are larger than four bytes.
        if self.granularity >= 1 && PMPConfig::from_raw(cfg).mode() == AddressMode::Na4 {
            return;
        }

        self.cfg[index].set(cfg);
    }

    fn addr_get(&self, index: usize) -> usize {
        let addr = self.addr[index].get();
        let g = self.granularity;
        match self.config(index).mode() {
            AddressMode::Napot if g >= 2 => addr | ((1usize << (g - 1)) - 1),
            AddressMode::Off | AddressMode::Tor if g >= 1 => addr & !((1usize << g) - 1),
            _ => addr,
        }
    }

    fn addr_set(&self, index: usize, addr: usize) {
        if self.addr_locked(index) {
            return;
        }
        self.addr[index].set(addr & PMPADDR_MASK);
    }
}
