// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! RISC-V physical memory protection (PMP).
//!
//! A PMP entry is configured through a `pmpaddrX` CSR holding an encoded
//! address and a `pmpcfgX` octet holding the entry's permission, addressing
//! mode and lock bits. Entries are matched in index order: the lowest-numbered
//! entry that matches an address decides the access. Machine mode is only
//! restricted by entries whose lock bit is set; user mode is restricted by all
//! entries and denied any address that no entry matches.
//!
//! This module is split in three layers:
//!
//! - address encoding ([`encode_napot`], [`encode_tor`]) and the typed
//!   [`PMPConfig`] octet,
//! - [`PMPRegion`] descriptors collected into an ordered [`RegionTable`],
//! - the [`PhysicalPMP`] register interface and the [`KernelPMP`] driver that
//!   commits regions to it, enforcing ordering and lock invariants.

use core::cell::Cell;
use core::fmt;

use isokernel::config;
use isokernel::platform::pmp::{AccessType, Permissions, PrivilegeLevel, ProtectionUnit};
use isokernel::ErrorCode;
use tock_registers::{register_bitfields, LocalRegisterCopy};

use crate::csr;

#[cfg(any(test, feature = "test-support"))]
pub mod simulated;

/// `pmpaddrX` holds bits `[33:2]` of a 34-bit physical address on RV32, so
/// every address loses its two low bits when encoded.
pub const PMP_ADDR_SHIFT: u32 = 2;

/// Smallest region expressible in NAPOT mode, in bytes.
pub const NAPOT_MIN_SIZE: usize = 8;

/// Encode a naturally aligned power-of-two region for a `pmpaddrX` CSR.
///
/// Drops the low address bits not held by the register, clears the bit marking
/// the alignment boundary and sets all bits below it:
///
/// ```text
/// 8-byte:  pmpaddr yyyy....yyy0
/// 16-byte: pmpaddr yyyy....yy01
/// 32-byte: pmpaddr yyyy....y011
/// ```
///
/// `size` must be a power of two of at least 8 bytes and `base` aligned to
/// `size`. This is not checked: other inputs produce a meaningless value. Use
/// [`NAPOTRegionSpec`] to validate untrusted geometry.
pub const fn encode_napot(base: usize, size: usize) -> usize {
    let boundary = size >> 3;
    ((base >> PMP_ADDR_SHIFT) & !boundary) | boundary.wrapping_sub(1)
}

/// Encode the top (exclusive) address of a TOR region for a `pmpaddrX` CSR.
pub const fn encode_tor(base: usize) -> usize {
    base >> PMP_ADDR_SHIFT
}

/// Inclusive range of 4-byte words matched by a NAPOT-encoded `pmpaddr`.
fn napot_words(pmpaddr: usize) -> (usize, usize) {
    let ones = pmpaddr.trailing_ones() as usize;
    if ones < crate::XLEN - 1 {
        let start = pmpaddr & !((1usize << ones) - 1);
        (start, start + (1usize << (ones + 1)) - 1)
    } else {
        (usize::MIN, usize::MAX)
    }
}

/// Decode a NAPOT-encoded `pmpaddr` into the inclusive byte range it matches.
///
/// The inverse of [`encode_napot`]: for a valid `(base, size)`,
/// `decode_napot(encode_napot(base, size)) == (base, base + size - 1)`.
pub fn decode_napot(pmpaddr: usize) -> (usize, usize) {
    let (start, end) = napot_words(pmpaddr);
    if start == usize::MIN && end == usize::MAX {
        (usize::MIN, usize::MAX)
    } else {
        (
            start.overflowing_shl(PMP_ADDR_SHIFT).0,
            end.overflowing_shl(PMP_ADDR_SHIFT).0 | 0b11,
        )
    }
}

register_bitfields![u8,
    /// Generic `pmpcfg` octet.
    ///
    /// A single `pmpcfgX` CSR holds multiple octets, each affecting the access
    /// permission, addressing mode and "lock" attributes of a single
    /// `pmpaddrX` CSR. Bits 5 and 6 are reserved and read as zero.
    pub pmpcfg_octet [
        r OFFSET(0) NUMBITS(1) [],
        w OFFSET(1) NUMBITS(1) [],
        x OFFSET(2) NUMBITS(1) [],
        a OFFSET(3) NUMBITS(2) [
            OFF = 0,
            TOR = 1,
            NA4 = 2,
            NAPOT = 3
        ],
        l OFFSET(7) NUMBITS(1) []
    ]
];

/// Address matching mode of a PMP entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AddressMode {
    /// The entry matches nothing.
    Off,
    /// Top of range: matches `pmpaddr[i-1] <= y < pmpaddr[i]`, with the lower
    /// bound taken as zero for entry 0.
    Tor,
    /// Naturally aligned four-byte region.
    Na4,
    /// Naturally aligned power-of-two region, at least eight bytes.
    Napot,
}

impl AddressMode {
    fn label(&self) -> &'static str {
        match self {
            AddressMode::Off => "OFF  ",
            AddressMode::Tor => "TOR  ",
            AddressMode::Na4 => "NA4  ",
            AddressMode::Napot => "NAPOT",
        }
    }
}

/// A `pmpcfg` octet.
///
/// Built from an [`AddressMode`], a set of [`Permissions`] and a lock flag, so
/// the reserved write-without-read combination and the reserved bits can not
/// be produced by construction.
#[derive(Copy, Clone)]
pub struct PMPConfig(LocalRegisterCopy<u8, pmpcfg_octet::Register>);

impl PMPConfig {
    /// A disabled, unlocked entry (`0x00`).
    pub const OFF: PMPConfig = PMPConfig(LocalRegisterCopy::new(0));

    pub fn new(mode: AddressMode, permissions: Permissions, locked: bool) -> PMPConfig {
        let rwx = match permissions {
            Permissions::NoAccess => {
                pmpcfg_octet::r::CLEAR + pmpcfg_octet::w::CLEAR + pmpcfg_octet::x::CLEAR
            }
            Permissions::ReadWriteExecute => {
                pmpcfg_octet::r::SET + pmpcfg_octet::w::SET + pmpcfg_octet::x::SET
            }
            Permissions::ReadWriteOnly => {
                pmpcfg_octet::r::SET + pmpcfg_octet::w::SET + pmpcfg_octet::x::CLEAR
            }
            Permissions::ReadExecuteOnly => {
                pmpcfg_octet::r::SET + pmpcfg_octet::w::CLEAR + pmpcfg_octet::x::SET
            }
            Permissions::ReadOnly => {
                pmpcfg_octet::r::SET + pmpcfg_octet::w::CLEAR + pmpcfg_octet::x::CLEAR
            }
            Permissions::ExecuteOnly => {
                pmpcfg_octet::r::CLEAR + pmpcfg_octet::w::CLEAR + pmpcfg_octet::x::SET
            }
        };
        let a = match mode {
            AddressMode::Off => pmpcfg_octet::a::OFF,
            AddressMode::Tor => pmpcfg_octet::a::TOR,
            AddressMode::Na4 => pmpcfg_octet::a::NA4,
            AddressMode::Napot => pmpcfg_octet::a::NAPOT,
        };
        let l = if locked {
            pmpcfg_octet::l::SET
        } else {
            pmpcfg_octet::l::CLEAR
        };

        PMPConfig(LocalRegisterCopy::new((rwx + a + l).value))
    }

    /// Validate a raw octet.
    ///
    /// Returns `Err(ErrorCode::RESERVE)` if a reserved bit is set or the
    /// octet grants write without read.
    pub fn from_bits(bits: u8) -> Result<PMPConfig, ErrorCode> {
        let cfg = PMPConfig::from_raw(bits);
        if bits & 0b0110_0000 != 0 {
            return Err(ErrorCode::RESERVE);
        }
        Permissions::from_rwx(
            cfg.0.is_set(pmpcfg_octet::r),
            cfg.0.is_set(pmpcfg_octet::w),
            cfg.0.is_set(pmpcfg_octet::x),
        )?;
        Ok(cfg)
    }

    /// Wrap an octet read back from hardware without validation.
    pub(crate) fn from_raw(bits: u8) -> PMPConfig {
        PMPConfig(LocalRegisterCopy::new(bits))
    }

    /// Extract the `u8` representation of the octet.
    pub fn get(&self) -> u8 {
        self.0.get()
    }

    pub fn mode(&self) -> AddressMode {
        match self.0.read_as_enum(pmpcfg_octet::a) {
            Some(pmpcfg_octet::a::Value::TOR) => AddressMode::Tor,
            Some(pmpcfg_octet::a::Value::NA4) => AddressMode::Na4,
            Some(pmpcfg_octet::a::Value::NAPOT) => AddressMode::Napot,
            Some(pmpcfg_octet::a::Value::OFF) | None => AddressMode::Off,
        }
    }

    /// Permissions granted by this octet. A reserved combination read back
    /// from hardware grants nothing.
    pub fn permissions(&self) -> Permissions {
        Permissions::from_rwx(
            self.0.is_set(pmpcfg_octet::r),
            self.0.is_set(pmpcfg_octet::w),
            self.0.is_set(pmpcfg_octet::x),
        )
        .unwrap_or(Permissions::NoAccess)
    }

    pub fn is_locked(&self) -> bool {
        self.0.is_set(pmpcfg_octet::l)
    }
}

impl PartialEq<PMPConfig> for PMPConfig {
    fn eq(&self, other: &Self) -> bool {
        self.0.get() == other.0.get()
    }
}

impl Eq for PMPConfig {}

impl fmt::Debug for PMPConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PMPConfig({:#04X})", self.get())
    }
}

impl fmt::Display for PMPConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cfg={:#04X} ({}) ({}{})",
            self.get(),
            self.mode().label(),
            if self.is_locked() { "l" } else { "-" },
            self.permissions(),
        )
    }
}

/// A RISC-V PMP memory region specification, configured in NAPOT mode.
///
/// This type checks that the supplied `start` and `size` values meet the
/// RISC-V NAPOT requirements, namely that
///
/// - the region is a power of two bytes in size
/// - the region's start address is aligned to the region size
/// - the region is at least 8 bytes long
///
/// By accepting this type, callers can rely on these requirements to be
/// verified and use [`NAPOTRegionSpec::napot_addr`] to retrieve the encoded
/// `pmpaddrX` value.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct NAPOTRegionSpec {
    start: usize,
    size: usize,
}

impl NAPOTRegionSpec {
    /// Construct a new [`NAPOTRegionSpec`]
    ///
    /// Returns `Some(region)` when all constraints specified in the
    /// [`NAPOTRegionSpec`]'s documentation are satisfied, otherwise `None`.
    pub fn new(start: usize, size: usize) -> Option<Self> {
        if !size.is_power_of_two() || start % size != 0 || size < NAPOT_MIN_SIZE {
            None
        } else {
            Some(NAPOTRegionSpec { start, size })
        }
    }

    /// Retrieve the start address of this [`NAPOTRegionSpec`].
    pub fn start(&self) -> usize {
        self.start
    }

    /// Retrieve the size of this [`NAPOTRegionSpec`].
    pub fn size(&self) -> usize {
        self.size
    }

    /// Retrieve a `pmpaddrX`-CSR compatible representation of this region's
    /// address and length. For this value to be valid in a `CSR` register,
    /// the `pmpcfgX` octet's `A` (address mode) value belonging to this
    /// `pmpaddrX`-CSR must be set to `NAPOT` (0b11).
    pub fn napot_addr(&self) -> usize {
        encode_napot(self.start, self.size)
    }
}

/// A region descriptor: one PMP entry, ready to be committed.
///
/// Region semantics depend on table order. For a TOR region the lower bound is
/// the encoded address of the previous entry, so a descriptor alone does not
/// describe the range it protects.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PMPRegion {
    index: usize,
    cfg: PMPConfig,
    address: usize,
}

impl PMPRegion {
    /// A disabled entry at `index`.
    pub fn off(index: usize) -> PMPRegion {
        PMPRegion {
            index,
            cfg: PMPConfig::OFF,
            address: 0,
        }
    }

    /// A NAPOT entry covering exactly `spec`.
    pub fn napot(
        index: usize,
        spec: NAPOTRegionSpec,
        permissions: Permissions,
        locked: bool,
    ) -> PMPRegion {
        PMPRegion {
            index,
            cfg: PMPConfig::new(AddressMode::Napot, permissions, locked),
            address: spec.napot_addr(),
        }
    }

    /// A TOR entry whose exclusive upper bound is `top`.
    ///
    /// Returns `None` if `top` is not aligned to the 4-byte PMP granularity.
    pub fn tor(index: usize, top: usize, permissions: Permissions, locked: bool) -> Option<PMPRegion> {
        if top % (1 << PMP_ADDR_SHIFT) != 0 {
            return None;
        }
        Some(PMPRegion {
            index,
            cfg: PMPConfig::new(AddressMode::Tor, permissions, locked),
            address: encode_tor(top),
        })
    }

    /// A descriptor from an already encoded octet and address.
    pub fn from_encoded(index: usize, cfg: PMPConfig, address: usize) -> PMPRegion {
        PMPRegion {
            index,
            cfg,
            address,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn config(&self) -> PMPConfig {
        self.cfg
    }

    /// The encoded `pmpaddrX` value.
    pub fn address(&self) -> usize {
        self.address
    }

    pub fn mode(&self) -> AddressMode {
        self.cfg.mode()
    }

    pub fn permissions(&self) -> Permissions {
        self.cfg.permissions()
    }

    pub fn is_locked(&self) -> bool {
        self.cfg.is_locked()
    }
}

impl fmt::Display for PMPRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "     #{:02}: pmpaddr={:#010X}, {}",
            self.index, self.address, self.cfg
        )
    }
}

/// An ordered, fixed-capacity list of region descriptors.
///
/// Descriptors are pushed in index order starting at zero and committed in
/// that same order by [`RegionTable::commit`].
pub struct RegionTable<const N: usize> {
    regions: [PMPRegion; N],
    len: usize,
}

impl<const N: usize> RegionTable<N> {
    pub fn new() -> Self {
        RegionTable {
            regions: core::array::from_fn(PMPRegion::off),
            len: 0,
        }
    }

    /// Append `region` as the next entry.
    ///
    /// Returns `Err(ErrorCode::SIZE)` if the table is full and
    /// `Err(ErrorCode::INVAL)` if the region's index is not the next one or a
    /// TOR region would match an empty range.
    pub fn push(&mut self, region: PMPRegion) -> Result<(), ErrorCode> {
        if self.len >= N {
            return Err(ErrorCode::SIZE);
        }
        if region.index() != self.len {
            return Err(ErrorCode::INVAL);
        }
        if region.mode() == AddressMode::Tor {
            let lower = match self.len.checked_sub(1) {
                Some(prev) => self.regions[prev].address(),
                None => 0,
            };
            if region.address() <= lower {
                return Err(ErrorCode::INVAL);
            }
        }

        self.regions[self.len] = region;
        self.len += 1;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, index: usize) -> Option<&PMPRegion> {
        self.regions[..self.len].get(index)
    }

    pub fn iter(&self) -> core::slice::Iter<'_, PMPRegion> {
        self.regions[..self.len].iter()
    }

    /// Write every region to `unit` in a single pass, in index order.
    ///
    /// Stops at the first region the unit rejects and returns its error; the
    /// caller must treat a partially committed table as fatal.
    pub fn commit<U: ProtectionUnit<Region = PMPRegion> + ?Sized>(
        &self,
        unit: &U,
    ) -> Result<(), ErrorCode> {
        unit.begin_commit();
        for region in self.iter() {
            unit.configure(region.index(), region)?;
        }
        Ok(())
    }
}

impl<const N: usize> Default for RegionTable<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> fmt::Display for RegionTable<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, " PMP region table -- {} of {} entries:\r\n", self.len, N)?;
        for region in self.iter() {
            write!(f, "{}\r\n", region)?;
        }
        Ok(())
    }
}

/// Register-level interface to a PMP implementation.
///
/// Methods take `&self`: the registers are hardware state, not memory owned
/// by the caller. Implementations report what the hardware actually holds
/// from the getters, so a write the hardware ignored is visible on read-back.
pub trait PhysicalPMP {
    /// Number of implemented entries.
    fn entries(&self) -> usize;

    /// Read the `pmpcfg` octet of entry `index`.
    fn cfg_get(&self, index: usize) -> u8;

    /// Write the `pmpcfg` octet of entry `index`.
    fn cfg_set(&self, index: usize, cfg: u8);

    /// Read the `pmpaddr` register of entry `index`.
    fn addr_get(&self, index: usize) -> usize;

    /// Write the `pmpaddr` register of entry `index`.
    fn addr_set(&self, index: usize, addr: usize);
}

/// Whether entry `index` matches the 4-byte word `word`.
fn entry_matches<H: PhysicalPMP + ?Sized>(hw: &H, index: usize, word: usize) -> bool {
    let pmpaddr = hw.addr_get(index);
    match PMPConfig::from_raw(hw.cfg_get(index)).mode() {
        AddressMode::Off => false,
        AddressMode::Tor => {
            let lower = if index > 0 { hw.addr_get(index - 1) } else { 0 };
            lower <= word && word < pmpaddr
        }
        AddressMode::Na4 => word == pmpaddr,
        AddressMode::Napot => {
            let (start, end) = napot_words(pmpaddr);
            start <= word && word <= end
        }
    }
}

/// Evaluate an access against the configuration held by `hw`.
///
/// The lowest-numbered matching entry decides. A matching entry restricts
/// machine mode only when it is locked. With no matching entry machine mode is
/// allowed and user mode is denied.
pub fn evaluate_access<H: PhysicalPMP + ?Sized>(
    hw: &H,
    level: PrivilegeLevel,
    address: usize,
    access: AccessType,
) -> bool {
    let word = address >> PMP_ADDR_SHIFT;
    for index in 0..hw.entries() {
        if entry_matches(hw, index, word) {
            let cfg = PMPConfig::from_raw(hw.cfg_get(index));
            if level == PrivilegeLevel::Machine && !cfg.is_locked() {
                return true;
            }
            return cfg.permissions().allows(access);
        }
    }

    level == PrivilegeLevel::Machine || hw.entries() == 0
}

/// Whether the registers of entry `index` can no longer be written.
///
/// An entry is locked by its own lock bit. Its address register is also
/// locked when the following entry is a locked TOR entry, since that address
/// is the following entry's lower bound.
fn entry_locked<H: PhysicalPMP + ?Sized>(hw: &H, index: usize) -> bool {
    if PMPConfig::from_raw(hw.cfg_get(index)).is_locked() {
        return true;
    }
    if index + 1 < hw.entries() {
        let next = PMPConfig::from_raw(hw.cfg_get(index + 1));
        return next.is_locked() && next.mode() == AddressMode::Tor;
    }
    false
}

/// Print a table of the configured PMP entries, read from the hardware.
pub struct PMPDump<'a, H: PhysicalPMP + ?Sized>(pub &'a H);

impl<H: PhysicalPMP + ?Sized> fmt::Display for PMPDump<'_, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hw = self.0;
        for i in 0..hw.entries() {
            let pmpcfg = PMPConfig::from_raw(hw.cfg_get(i));

            // The address interpretation is different for every mode. For
            // entries that are OFF, still expose the raw pmpaddrX value and
            // report 0 as the end.
            let (start_label, start, end) = match pmpcfg.mode() {
                AddressMode::Off => ("pmpaddr", hw.addr_get(i), 0),
                AddressMode::Tor => {
                    let start = if i > 0 { hw.addr_get(i - 1) } else { 0 };
                    (
                        "  start",
                        start.overflowing_shl(PMP_ADDR_SHIFT).0,
                        hw.addr_get(i)
                            .overflowing_shl(PMP_ADDR_SHIFT)
                            .0
                            .wrapping_sub(1),
                    )
                }
                AddressMode::Na4 => {
                    let addr = hw.addr_get(i).overflowing_shl(PMP_ADDR_SHIFT).0;
                    ("  start", addr, addr | 0b11)
                }
                AddressMode::Napot => {
                    let (start, end) = decode_napot(hw.addr_get(i));
                    ("  start", start, end)
                }
            };

            write!(
                f,
                "  [{:02}]: {}={:#010X}, end={:#010X}, {}\r\n",
                i, start_label, start, end, pmpcfg,
            )?;
        }

        Ok(())
    }
}

/// The commit driver for a PMP implementation.
///
/// Enforces the invariants the hardware itself does not report:
///
/// - within one commit pass, indices are strictly ascending,
/// - a locked entry (or an address register locked by a following locked TOR
///   entry) is never written,
/// - every write is read back, and a value the hardware did not retain is an
///   error rather than silently weaker protection.
pub struct KernelPMP<H: PhysicalPMP> {
    hw: H,
    /// Index configured last in the current commit pass.
    last_configured: Cell<Option<usize>>,
}

impl<H: PhysicalPMP> KernelPMP<H> {
    /// Take control of `hw`, bringing every unlocked entry to a known state.
    ///
    /// The power-on value of the PMP registers is not defined, so each
    /// unlocked entry is detected by flipping its permission bits, checked to
    /// hold the written value, and then turned off with a zero address.
    /// Locked entries are never touched: they may be what currently grants
    /// machine mode access to the code executing this.
    ///
    /// Returns `Err(ErrorCode::NODEVICE)` if an entry does not retain a
    /// written value, i.e. fewer entries are implemented than `hw` claims.
    pub fn new(hw: H) -> Result<Self, ErrorCode> {
        for i in 0..hw.entries() {
            let cfg = hw.cfg_get(i);
            if PMPConfig::from_raw(cfg).is_locked() {
                log::warn!("pmp: entry {} locked before initialization, skipped", i);
                continue;
            }

            let flipped = if cfg & 0b111 == 0b111 {
                PMPConfig::new(AddressMode::Off, Permissions::ReadOnly, false)
            } else {
                PMPConfig::new(AddressMode::Off, Permissions::ReadWriteExecute, false)
            };
            hw.cfg_set(i, flipped.get());
            if hw.cfg_get(i) != flipped.get() {
                return Err(ErrorCode::NODEVICE);
            }

            hw.cfg_set(i, PMPConfig::OFF.get());
            hw.addr_set(i, 0);
        }

        Ok(KernelPMP {
            hw,
            last_configured: Cell::new(None),
        })
    }

    /// The underlying register interface.
    pub fn hardware(&self) -> &H {
        &self.hw
    }
}

impl<H: PhysicalPMP> ProtectionUnit for KernelPMP<H> {
    type Region = PMPRegion;

    fn number_total_regions(&self) -> usize {
        self.hw.entries()
    }

    fn begin_commit(&self) {
        self.last_configured.set(None);
    }

    fn configure(&self, index: usize, region: &PMPRegion) -> Result<(), ErrorCode> {
        if region.index() != index {
            return Err(ErrorCode::INVAL);
        }
        if index >= self.hw.entries() {
            return Err(ErrorCode::SIZE);
        }
        if let Some(last) = self.last_configured.get() {
            if index <= last {
                return Err(ErrorCode::INVAL);
            }
        }
        if entry_locked(&self.hw, index) {
            return Err(ErrorCode::ALREADY);
        }

        // Address first: the octet activates the entry, and it must not match
        // with a stale address in between.
        self.hw.addr_set(index, region.address());
        self.hw.cfg_set(index, region.config().get());

        if self.hw.cfg_get(index) != region.config().get()
            || self.hw.addr_get(index) != region.address()
        {
            log::error!("pmp: entry {} not retained by hardware: {}", index, region);
            return Err(ErrorCode::FAIL);
        }

        self.last_configured.set(Some(index));
        log::debug!("pmp: configured {}", region);
        if config::CONFIG.trace_pmp {
            log::debug!(" PMP hardware configuration -- entries:\r\n{}", PMPDump(&self.hw));
        }
        Ok(())
    }

    fn check_access(&self, level: PrivilegeLevel, address: usize, access: AccessType) -> bool {
        evaluate_access(&self.hw, level, address, access)
    }
}

impl<H: PhysicalPMP> fmt::Display for KernelPMP<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            " PMP hardware configuration -- entries: \r\n{}",
            PMPDump(&self.hw)
        )
    }
}

/// The machine-mode PMP CSRs of the current hart.
///
/// `ENTRIES` is the number of entries implemented by the hart, at most 16 on
/// RV32. On RV32 four entry octets are packed into each `pmpcfgX` CSR, entry
/// `i` in bits `8 * (i % 4)..8 * (i % 4) + 8` of `pmpcfg(i / 4)`.
pub struct MachinePMP<const ENTRIES: usize>(());

impl<const ENTRIES: usize> MachinePMP<ENTRIES> {
    const CONST_ASSERT_CHECK: () = assert!(
        ENTRIES <= csr::PMPADDR_REGISTERS && ENTRIES <= csr::PMPCFG_REGISTERS * 4
    );

    /// # Safety
    ///
    /// The hart must implement at least `ENTRIES` PMP entries and the caller
    /// must be executing in machine mode. There must be only one instance.
    pub const unsafe fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let _: () = Self::CONST_ASSERT_CHECK;
        MachinePMP(())
    }
}

impl<const ENTRIES: usize> PhysicalPMP for MachinePMP<ENTRIES> {
    fn entries(&self) -> usize {
        ENTRIES
    }

    fn cfg_get(&self, index: usize) -> u8 {
        csr::CSR
            .pmpconfig_get(index / 4)
            .overflowing_shr(((index % 4) * 8) as u32)
            .0 as u8
    }

    fn cfg_set(&self, index: usize, cfg: u8) {
        let shift = (index % 4) * 8;
        let packed = csr::CSR.pmpconfig_get(index / 4);
        let packed = (packed & !(0xFF << shift)) | ((cfg as usize) << shift);
        csr::CSR.pmpconfig_set(index / 4, packed);
    }

    fn addr_get(&self, index: usize) -> usize {
        csr::CSR.pmpaddr_get(index)
    }

    fn addr_set(&self, index: usize, addr: usize) {
        csr::CSR.pmpaddr_set(index, addr);
    }
}

#[cfg(test)]
mod tests {
    use super::simulated::SimulatedPMP;
    use super::*;

    #[test]
    fn napot_ram_example() {
        // 16 KiB of DTIM at 0x8000_0000.
        let encoded = encode_napot(0x8000_0000, 0x4000);
        assert_eq!(encoded, 0x2000_07FF);
        // Register view: low bits are the (size >> 3) - 1 mask, the boundary
        // bit is clear.
        assert_eq!(encoded & 0xFFF, 0x7FF);
        // Byte view: low 13 bits set, bit 13 clear.
        let bytes = (encoded << PMP_ADDR_SHIFT) | 0b11;
        assert_eq!(bytes & 0x3FFF, 0x1FFF);
    }

    #[test]
    fn napot_privileged_functions_example() {
        let encoded = encode_napot(0x8000_0000, 0x8000);
        assert_eq!(encoded, 0x2000_0FFF);
        let bytes = (encoded << PMP_ADDR_SHIFT) | 0b11;
        assert_eq!(bytes & 0x7FFF, 0x3FFF);
        assert_eq!(bytes & (1 << 14), 0);
    }

    #[test]
    fn napot_smallest_region() {
        assert_eq!(encode_napot(0x2000_0008, 8), 0x0800_0002);
        assert_eq!(decode_napot(0x0800_0002), (0x2000_0008, 0x2000_000F));
    }

    #[test]
    fn napot_decodes_to_exact_range() {
        let bases = [0usize, 0x2000_0000, 0x8000_0000];
        for shift in 3..24 {
            let size = 1usize << shift;
            for base in bases {
                let base = base & !(size - 1);
                let encoded = encode_napot(base, size);
                assert_eq!(decode_napot(encoded), (base, base + size - 1));
                assert_eq!(
                    NAPOTRegionSpec::new(base, size).map(|s| s.napot_addr()),
                    Some(encoded)
                );
            }
        }
    }

    #[test]
    fn napot_spec_rejects_bad_geometry() {
        assert!(NAPOTRegionSpec::new(0x8000_0000, 0x3000).is_none());
        assert!(NAPOTRegionSpec::new(0x8000_0100, 0x200).is_none());
        assert!(NAPOTRegionSpec::new(0x8000_0000, 4).is_none());
        assert!(NAPOTRegionSpec::new(0x8000_0000, 0).is_none());
    }

    #[test]
    fn tor_drops_granularity_bits() {
        for base in [0usize, 4, 0x8000_1000, 0x8000_1003, 0xFFFF_FFFC] {
            assert_eq!(encode_tor(base), base >> 2);
        }
        assert!(PMPRegion::tor(3, 0x8000_1002, Permissions::ReadWriteOnly, true).is_none());
    }

    #[test]
    fn pmpcfg_bit_layout() {
        let cfg = |mode, perms, locked| PMPConfig::new(mode, perms, locked).get();
        assert_eq!(cfg(AddressMode::Napot, Permissions::ReadWriteOnly, true), 0x9B);
        assert_eq!(cfg(AddressMode::Napot, Permissions::ReadExecuteOnly, true), 0x9D);
        assert_eq!(cfg(AddressMode::Napot, Permissions::NoAccess, false), 0x18);
        assert_eq!(cfg(AddressMode::Tor, Permissions::ReadWriteOnly, true), 0x8B);
        assert_eq!(cfg(AddressMode::Tor, Permissions::ExecuteOnly, false), 0x0C);
        assert_eq!(cfg(AddressMode::Na4, Permissions::ReadOnly, false), 0x11);
        assert_eq!(PMPConfig::OFF.get(), 0);
    }

    #[test]
    fn pmpcfg_decodes_fields() {
        let cfg = PMPConfig::new(AddressMode::Tor, Permissions::ReadWriteOnly, true);
        assert_eq!(cfg.mode(), AddressMode::Tor);
        assert_eq!(cfg.permissions(), Permissions::ReadWriteOnly);
        assert!(cfg.is_locked());
        assert_eq!(PMPConfig::from_bits(0x8B), Ok(cfg));
    }

    #[test]
    fn pmpcfg_rejects_reserved_bits() {
        assert_eq!(PMPConfig::from_bits(0x1A).err(), Some(ErrorCode::RESERVE));
        assert_eq!(PMPConfig::from_bits(0x20).err(), Some(ErrorCode::RESERVE));
        assert_eq!(PMPConfig::from_raw(0x1A).permissions(), Permissions::NoAccess);
    }

    fn napot(index: usize, start: usize, size: usize, perms: Permissions, locked: bool) -> PMPRegion {
        let spec = NAPOTRegionSpec::new(start, size).unwrap();
        PMPRegion::napot(index, spec, perms, locked)
    }

    #[test]
    fn table_requires_contiguous_indices() {
        let mut table: RegionTable<2> = RegionTable::new();
        assert_eq!(
            table.push(napot(1, 0x8000_0000, 0x200, Permissions::NoAccess, false)),
            Err(ErrorCode::INVAL)
        );
        table
            .push(napot(0, 0x8000_0000, 0x200, Permissions::NoAccess, false))
            .unwrap();
        table
            .push(napot(1, 0x8000_0200, 0x200, Permissions::NoAccess, false))
            .unwrap();
        assert_eq!(
            table.push(napot(2, 0x8000_0400, 0x200, Permissions::NoAccess, false)),
            Err(ErrorCode::SIZE)
        );
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn table_rejects_empty_tor_range() {
        let mut table: RegionTable<2> = RegionTable::new();
        table
            .push(napot(0, 0x8000_0000, 0x200, Permissions::NoAccess, false))
            .unwrap();
        let below = PMPRegion::tor(1, 0x8000_0000, Permissions::ReadWriteOnly, true).unwrap();
        assert_eq!(table.push(below), Err(ErrorCode::INVAL));

        let mut first: RegionTable<1> = RegionTable::new();
        let zero = PMPRegion::tor(0, 0, Permissions::ReadWriteOnly, true).unwrap();
        assert_eq!(first.push(zero), Err(ErrorCode::INVAL));
    }

    #[test]
    fn configure_rejects_out_of_order_index() {
        let pmp = KernelPMP::new(SimulatedPMP::<8>::new()).unwrap();
        pmp.begin_commit();
        pmp.configure(2, &napot(2, 0x8000_0000, 0x200, Permissions::ReadOnly, false))
            .unwrap();
        assert_eq!(
            pmp.configure(1, &napot(1, 0x8000_0400, 0x200, Permissions::ReadOnly, false)),
            Err(ErrorCode::INVAL)
        );
        assert_eq!(
            pmp.configure(2, &napot(2, 0x8000_0400, 0x200, Permissions::ReadOnly, false)),
            Err(ErrorCode::INVAL)
        );
        // Nothing was applied for the rejected calls.
        assert_eq!(pmp.hardware().addr_get(1), 0);
        assert_eq!(pmp.hardware().addr_get(2), encode_napot(0x8000_0000, 0x200));

        // A new pass may start from any index again.
        pmp.begin_commit();
        pmp.configure(1, &napot(1, 0x8000_0400, 0x200, Permissions::ReadOnly, false))
            .unwrap();
    }

    #[test]
    fn configure_rejects_mismatched_descriptor_index() {
        let pmp = KernelPMP::new(SimulatedPMP::<4>::new()).unwrap();
        pmp.begin_commit();
        assert_eq!(
            pmp.configure(0, &napot(1, 0x8000_0000, 0x200, Permissions::ReadOnly, false)),
            Err(ErrorCode::INVAL)
        );
    }

    #[test]
    fn configure_rejects_unimplemented_entry() {
        let pmp = KernelPMP::new(SimulatedPMP::<4>::new()).unwrap();
        pmp.begin_commit();
        assert_eq!(
            pmp.configure(4, &PMPRegion::off(4)),
            Err(ErrorCode::SIZE)
        );
    }

    #[test]
    fn locked_entry_is_never_rewritten() {
        let pmp = KernelPMP::new(SimulatedPMP::<4>::new()).unwrap();
        let locked = napot(0, 0x8000_0000, 0x4000, Permissions::ReadWriteOnly, true);
        pmp.begin_commit();
        pmp.configure(0, &locked).unwrap();

        pmp.begin_commit();
        assert_eq!(
            pmp.configure(0, &napot(0, 0x8000_0000, 0x4000, Permissions::ReadWriteExecute, false)),
            Err(ErrorCode::ALREADY)
        );
        assert_eq!(pmp.hardware().cfg_get(0), locked.config().get());
        assert_eq!(pmp.hardware().addr_get(0), locked.address());
    }

    #[test]
    fn locked_tor_entry_locks_previous_address() {
        let pmp = KernelPMP::new(SimulatedPMP::<4>::new()).unwrap();
        pmp.begin_commit();
        pmp.configure(0, &napot(0, 0x8000_0000, 0x200, Permissions::NoAccess, false))
            .unwrap();
        pmp.configure(1, &PMPRegion::tor(1, 0x8000_1000, Permissions::ReadWriteOnly, true).unwrap())
            .unwrap();

        pmp.begin_commit();
        assert_eq!(
            pmp.configure(0, &napot(0, 0x8000_0800, 0x200, Permissions::NoAccess, false)),
            Err(ErrorCode::ALREADY)
        );
    }

    #[test]
    fn unretained_write_is_a_failure() {
        // 4 KiB granularity: a 512-byte NAPOT region can not be represented.
        let pmp = KernelPMP::new(SimulatedPMP::<4>::with_granularity(10)).unwrap();
        pmp.begin_commit();
        assert_eq!(
            pmp.configure(0, &napot(0, 0x8000_0000, 0x200, Permissions::NoAccess, false)),
            Err(ErrorCode::FAIL)
        );
        // A region matching the granularity is accepted.
        pmp.begin_commit();
        pmp.configure(0, &napot(0, 0x8000_0000, 0x4000, Permissions::NoAccess, false))
            .unwrap();
    }

    #[test]
    fn init_resets_unlocked_entries() {
        let hw = SimulatedPMP::<4>::new();
        hw.cfg_set(1, PMPConfig::new(AddressMode::Napot, Permissions::ReadWriteExecute, false).get());
        hw.addr_set(1, 0x1234);
        // Address first: once the octet is locked the address is frozen too.
        hw.addr_set(3, 0x5678);
        hw.cfg_set(3, PMPConfig::new(AddressMode::Napot, Permissions::ReadOnly, true).get());

        let pmp = KernelPMP::new(hw).unwrap();
        assert_eq!(pmp.hardware().cfg_get(1), 0);
        assert_eq!(pmp.hardware().addr_get(1), 0);
        // Locked entries survive initialization untouched.
        assert!(PMPConfig::from_raw(pmp.hardware().cfg_get(3)).is_locked());
        assert_eq!(pmp.hardware().addr_get(3), 0x5678);
    }

    /// Hardware that implements fewer entries than it claims.
    struct ShortPMP {
        inner: SimulatedPMP<4>,
        implemented: usize,
    }

    impl PhysicalPMP for ShortPMP {
        fn entries(&self) -> usize {
            4
        }
        fn cfg_get(&self, index: usize) -> u8 {
            self.inner.cfg_get(index)
        }
        fn cfg_set(&self, index: usize, cfg: u8) {
            if index < self.implemented {
                self.inner.cfg_set(index, cfg)
            }
        }
        fn addr_get(&self, index: usize) -> usize {
            self.inner.addr_get(index)
        }
        fn addr_set(&self, index: usize, addr: usize) {
            if index < self.implemented {
                self.inner.addr_set(index, addr)
            }
        }
    }

    #[test]
    fn init_detects_missing_entries() {
        let hw = ShortPMP {
            inner: SimulatedPMP::new(),
            implemented: 2,
        };
        assert_eq!(KernelPMP::new(hw).err(), Some(ErrorCode::NODEVICE));
    }

    #[test]
    fn dump_lists_every_entry() {
        extern crate std;
        use std::string::ToString;

        let pmp = KernelPMP::new(SimulatedPMP::<2>::new()).unwrap();
        pmp.begin_commit();
        pmp.configure(0, &napot(0, 0x8000_0000, 0x4000, Permissions::ReadWriteOnly, true))
            .unwrap();
        let dump = pmp.to_string();
        assert!(dump.contains("[00]:   start=0x80000000, end=0x80003FFF, cfg=0x9B (NAPOT) (lrw-)"));
        assert!(dump.contains("[01]: pmpaddr=0x00000000, end=0x00000000, cfg=0x00 (OFF  ) (----)"));
    }
}
