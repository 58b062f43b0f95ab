// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Isolation policies: the region tables that boot code commits to the PMP.
//!
//! A policy turns a [`MemoryLayout`] (zone boundaries fixed at link time) into
//! an ordered [`RegionTable`]. The table is committed in one pass by
//! [`install`]; any failure there leaves the PMP partially configured, so boot
//! code goes through [`install_or_halt`], which treats it as fatal.
//!
//! The dual-privilege policy relies on the PMP matching rules: an unlocked
//! entry with no permissions hides a zone from user mode while leaving machine
//! mode unrestricted, and a locked entry restricts both modes alike.

use core::fmt;

use isokernel::debug;
use isokernel::hil::led::Led;
use isokernel::platform::chip::InterruptControl;
use isokernel::platform::pmp::{Permissions, ProtectionUnit};
use isokernel::ErrorCode;

use crate::pmp::{NAPOTRegionSpec, PMPRegion, RegionTable};

/// Number of PMP entries used by any policy.
pub const POLICY_REGIONS: usize = 4;

/// Entry holding the whole-RAM user grant of
/// [`IsolationPolicy::EarlyBootDualPrivilege`], to be narrowed later with
/// [`replace_transitional`].
pub const TRANSITIONAL_REGION_INDEX: usize = 3;

/// Sizes of the NAPOT zones of the dual-privilege layout.
///
/// The zone start addresses come from the linker script, which must align
/// each zone to its size.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ZoneSizes {
    pub privileged_functions: usize,
    pub common_functions: usize,
    pub privileged_data: usize,
}

impl Default for ZoneSizes {
    /// HiFive1 Rev B.
    fn default() -> Self {
        ZoneSizes {
            privileged_functions: 0x8000,
            common_functions: 0x1_0000,
            privileged_data: 0x200,
        }
    }
}

/// The RAM of the board.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RamRegion {
    pub start: usize,
    pub size: usize,
}

impl Default for RamRegion {
    /// The 16 KiB DTIM of the HiFive1 Rev B.
    fn default() -> Self {
        RamRegion {
            start: 0x8000_0000,
            size: 0x4000,
        }
    }
}

/// Zone boundaries of the program image.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MemoryLayout {
    pub privileged_function_start: usize,
    pub privileged_data_start: usize,
    /// Start of the shared code zone, which holds the call gate.
    pub common_function_start: usize,
    /// End of the shared data and bss zone, exclusive.
    pub common_data_end: usize,
    pub sizes: ZoneSizes,
    pub ram: RamRegion,
}

impl MemoryLayout {
    /// A layout with the default zone sizes and RAM region.
    pub fn new(
        privileged_function_start: usize,
        privileged_data_start: usize,
        common_function_start: usize,
        common_data_end: usize,
    ) -> MemoryLayout {
        MemoryLayout {
            privileged_function_start,
            privileged_data_start,
            common_function_start,
            common_data_end,
            sizes: ZoneSizes::default(),
            ram: RamRegion::default(),
        }
    }

    /// Read the zone boundaries from the linker script symbols.
    ///
    /// # Safety
    ///
    /// The linker script must define `_privileged_function_start`,
    /// `_privileged_data_start`, `_common_function_start` and
    /// `_common_data_end`.
    #[cfg(all(target_arch = "riscv32", target_os = "none"))]
    pub unsafe fn from_linker_symbols() -> MemoryLayout {
        extern "C" {
            static _privileged_function_start: u8;
            static _privileged_data_start: u8;
            static _common_function_start: u8;
            static _common_data_end: u8;
        }

        unsafe {
            MemoryLayout::new(
                core::ptr::addr_of!(_privileged_function_start) as usize,
                core::ptr::addr_of!(_privileged_data_start) as usize,
                core::ptr::addr_of!(_common_function_start) as usize,
                core::ptr::addr_of!(_common_data_end) as usize,
            )
        }
    }

    // Host builds, where there is no linker script.
    ///
    /// # Safety
    ///
    /// See the bare-metal variant.
    #[cfg(not(all(target_arch = "riscv32", target_os = "none")))]
    pub unsafe fn from_linker_symbols() -> MemoryLayout {
        unimplemented!()
    }
}

/// The protection configurations boot code can install.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IsolationPolicy {
    /// No user mode. RAM is locked read/write, so it can never be executed
    /// from, not even by machine mode.
    PrivilegedOnly { ram: RamRegion },
    /// Kernel/user split: privileged code and data hidden from user mode,
    /// shared code executable by both, shared data writable by both.
    DualPrivilege { layout: MemoryLayout },
    /// [`IsolationPolicy::DualPrivilege`] for early boot, before task stacks
    /// exist: the last entry grants user mode read/write access to all of
    /// RAM and is left unlocked, so it can be narrowed with
    /// [`replace_transitional`].
    EarlyBootDualPrivilege { layout: MemoryLayout },
    /// A single locked read-only region, protecting constant data from writes
    /// in every mode.
    ReadOnlyGuard { start: usize, size: usize },
}

fn napot(
    index: usize,
    start: usize,
    size: usize,
    permissions: Permissions,
    locked: bool,
) -> Result<PMPRegion, ErrorCode> {
    let spec = NAPOTRegionSpec::new(start, size).ok_or(ErrorCode::INVAL)?;
    Ok(PMPRegion::napot(index, spec, permissions, locked))
}

impl IsolationPolicy {
    /// Build the ordered region table of this policy.
    ///
    /// Returns `Err(ErrorCode::INVAL)` if a zone does not satisfy the
    /// NAPOT or TOR alignment rules, or the shared data zone ends below the
    /// privileged data zone.
    pub fn region_table(&self) -> Result<RegionTable<POLICY_REGIONS>, ErrorCode> {
        let mut table = RegionTable::new();
        match self {
            IsolationPolicy::PrivilegedOnly { ram } => {
                table.push(napot(0, ram.start, ram.size, Permissions::ReadWriteOnly, true)?)?;
            }
            IsolationPolicy::DualPrivilege { layout } => {
                push_privileged_zones(&mut table, layout)?;
                let data = PMPRegion::tor(3, layout.common_data_end, Permissions::ReadWriteOnly, true)
                    .ok_or(ErrorCode::INVAL)?;
                table.push(data)?;
            }
            IsolationPolicy::EarlyBootDualPrivilege { layout } => {
                push_privileged_zones(&mut table, layout)?;
                table.push(napot(
                    TRANSITIONAL_REGION_INDEX,
                    layout.ram.start,
                    layout.ram.size,
                    Permissions::ReadWriteOnly,
                    false,
                )?)?;
            }
            IsolationPolicy::ReadOnlyGuard { start, size } => {
                table.push(napot(0, *start, *size, Permissions::ReadOnly, true)?)?;
            }
        }
        Ok(table)
    }

    /// Whether the policy is only meaningful on a hart with user mode.
    pub fn requires_user_mode(&self) -> bool {
        matches!(
            self,
            IsolationPolicy::DualPrivilege { .. } | IsolationPolicy::EarlyBootDualPrivilege { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            IsolationPolicy::PrivilegedOnly { .. } => "privileged-only",
            IsolationPolicy::DualPrivilege { .. } => "dual-privilege",
            IsolationPolicy::EarlyBootDualPrivilege { .. } => "early-boot dual-privilege",
            IsolationPolicy::ReadOnlyGuard { .. } => "read-only guard",
        }
    }
}

impl fmt::Display for IsolationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Entries 0 to 2 of both dual-privilege variants.
fn push_privileged_zones(
    table: &mut RegionTable<POLICY_REGIONS>,
    layout: &MemoryLayout,
) -> Result<(), ErrorCode> {
    // Unlocked: hidden from user mode, machine mode keeps full access.
    table.push(napot(
        0,
        layout.privileged_function_start,
        layout.sizes.privileged_functions,
        Permissions::NoAccess,
        false,
    )?)?;
    // Locked: no mode may modify shared code.
    table.push(napot(
        1,
        layout.common_function_start,
        layout.sizes.common_functions,
        Permissions::ReadExecuteOnly,
        true,
    )?)?;
    table.push(napot(
        2,
        layout.privileged_data_start,
        layout.sizes.privileged_data,
        Permissions::NoAccess,
        false,
    )?)
}

/// Commit `policy` to `unit` in a single pass.
///
/// Returns `Err(ErrorCode::NOSUPPORT)` for a dual-privilege policy on a hart
/// without user mode, otherwise the first error of the commit pass.
pub fn install<U: ProtectionUnit<Region = PMPRegion> + ?Sized>(
    unit: &U,
    policy: &IsolationPolicy,
    user_mode_supported: bool,
) -> Result<(), ErrorCode> {
    if policy.requires_user_mode() && !user_mode_supported {
        log::error!("isolation: {} policy needs user mode", policy);
        return Err(ErrorCode::NOSUPPORT);
    }

    let table = policy.region_table()?;
    if table.len() > unit.number_total_regions() {
        return Err(ErrorCode::SIZE);
    }
    table.commit(unit)?;

    log::info!("isolation: {} policy installed, {} regions", policy, table.len());
    Ok(())
}

/// Commit `policy` to `unit`, halting in the fatal diagnostic loop if the
/// protection unit does not accept it.
pub fn install_or_halt<U, C>(
    unit: &U,
    policy: &IsolationPolicy,
    user_mode_supported: bool,
    chip: &C,
    leds: &mut [&mut dyn Led],
) where
    U: ProtectionUnit<Region = PMPRegion> + ?Sized,
    C: InterruptControl + ?Sized,
{
    if let Err(e) = install(unit, policy, user_mode_supported) {
        debug::fatal(chip, leds, format_args!("installing {} policy: {}", policy, e));
    }
}

/// Replace the transitional whole-RAM entry left by
/// [`IsolationPolicy::EarlyBootDualPrivilege`], with interrupts masked.
///
/// The interrupt mask state of the caller is restored afterwards, so this can
/// be called from inside an already masked window.
///
/// Returns `Err(ErrorCode::INVAL)` if `region` is not for
/// [`TRANSITIONAL_REGION_INDEX`] and `Err(ErrorCode::ALREADY)` if that entry
/// has already been locked.
pub fn replace_transitional<U, C>(unit: &U, chip: &C, region: &PMPRegion) -> Result<(), ErrorCode>
where
    U: ProtectionUnit<Region = PMPRegion> + ?Sized,
    C: InterruptControl,
{
    if region.index() != TRANSITIONAL_REGION_INDEX {
        return Err(ErrorCode::INVAL);
    }
    chip.atomic(|| {
        unit.begin_commit();
        unit.configure(TRANSITIONAL_REGION_INDEX, region)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pmp::simulated::SimulatedPMP;
    use crate::pmp::{encode_napot, encode_tor, KernelPMP, PhysicalPMP};
    use core::cell::Cell;
    use isokernel::platform::pmp::AccessType::{Execute, Read, Write};
    use isokernel::platform::pmp::PrivilegeLevel::{Machine, User};

    const PRIV_FN: usize = 0x2040_0000;
    const COMMON_FN: usize = 0x2041_0000;
    const PRIV_DATA: usize = 0x8000_0000;
    const COMMON_DATA_END: usize = 0x8000_1000;

    fn layout() -> MemoryLayout {
        MemoryLayout::new(PRIV_FN, PRIV_DATA, COMMON_FN, COMMON_DATA_END)
    }

    fn pmp() -> KernelPMP<SimulatedPMP<8>> {
        KernelPMP::new(SimulatedPMP::new()).unwrap()
    }

    struct Chip {
        masked: Cell<bool>,
        masked_calls: Cell<usize>,
    }

    impl Chip {
        fn new() -> Chip {
            Chip {
                masked: Cell::new(false),
                masked_calls: Cell::new(0),
            }
        }
    }

    impl InterruptControl for Chip {
        fn disable_interrupts(&self) {
            self.masked.set(true);
            self.masked_calls.set(self.masked_calls.get() + 1);
        }
        fn enable_interrupts(&self) {
            self.masked.set(false);
        }
        fn interrupts_enabled(&self) -> bool {
            !self.masked.get()
        }
    }

    #[test]
    fn privileged_only_forbids_executing_ram() {
        let pmp = pmp();
        let policy = IsolationPolicy::PrivilegedOnly {
            ram: RamRegion::default(),
        };
        install(&pmp, &policy, false).unwrap();

        assert_eq!(pmp.hardware().cfg_get(0), 0x9B);
        assert_eq!(pmp.hardware().addr_get(0), 0x2000_07FF);
        for addr in [0x8000_0000, 0x8000_2000, 0x8000_3FFC] {
            assert!(!pmp.check_access(Machine, addr, Execute));
            assert!(!pmp.check_access(User, addr, Execute));
            assert!(pmp.check_access(Machine, addr, Read));
            assert!(pmp.check_access(Machine, addr, Write));
        }
        // Outside RAM machine mode is unaffected.
        assert!(pmp.check_access(Machine, 0x2040_0000, Execute));
    }

    #[test]
    fn dual_privilege_table_order() {
        let table = IsolationPolicy::DualPrivilege { layout: layout() }
            .region_table()
            .unwrap();
        let raw: [(u8, usize); 4] = core::array::from_fn(|i| {
            let region = table.get(i).unwrap();
            (region.config().get(), region.address())
        });
        assert_eq!(
            raw,
            [
                (0x18, encode_napot(PRIV_FN, 0x8000)),
                (0x9D, encode_napot(COMMON_FN, 0x1_0000)),
                (0x18, encode_napot(PRIV_DATA, 0x200)),
                (0x8B, encode_tor(COMMON_DATA_END)),
            ]
        );
    }

    #[test]
    fn dual_privilege_separates_modes() {
        let pmp = pmp();
        install(&pmp, &IsolationPolicy::DualPrivilege { layout: layout() }, true).unwrap();

        // Common data: read/write for both, never executable for user mode.
        assert!(pmp.check_access(User, 0x8000_0800, Read));
        assert!(pmp.check_access(User, 0x8000_0FFC, Write));
        assert!(!pmp.check_access(User, 0x8000_0800, Execute));
        assert!(!pmp.check_access(User, COMMON_DATA_END, Read));

        // Shared code: executable by both, writable by neither.
        assert!(pmp.check_access(User, COMMON_FN + 0x40, Execute));
        assert!(pmp.check_access(User, COMMON_FN + 0x40, Read));
        assert!(!pmp.check_access(User, COMMON_FN + 0x40, Write));
        assert!(!pmp.check_access(Machine, COMMON_FN + 0x40, Write));
        assert!(pmp.check_access(Machine, COMMON_FN + 0x40, Execute));

        // Privileged zones: hidden from user mode only.
        for access in [Read, Write, Execute] {
            assert!(!pmp.check_access(User, PRIV_FN + 0x100, access));
            assert!(!pmp.check_access(User, PRIV_DATA + 0x1FC, access));
            assert!(pmp.check_access(Machine, PRIV_FN + 0x100, access));
            assert!(pmp.check_access(Machine, PRIV_DATA + 0x1FC, access));
        }

        // Unmatched addresses.
        assert!(!pmp.check_access(User, 0x1000_0000, Read));
        assert!(pmp.check_access(Machine, 0x1000_0000, Read));
    }

    #[test]
    fn dual_privilege_needs_user_mode() {
        let pmp = pmp();
        assert_eq!(
            install(&pmp, &IsolationPolicy::DualPrivilege { layout: layout() }, false),
            Err(ErrorCode::NOSUPPORT)
        );
        // Nothing was committed.
        assert_eq!(pmp.hardware().cfg_get(0), 0);
    }

    #[test]
    fn misaligned_zone_is_rejected() {
        let mut bad = layout();
        bad.common_function_start = 0x2041_8000;
        assert_eq!(
            IsolationPolicy::DualPrivilege { layout: bad }.region_table().err(),
            Some(ErrorCode::INVAL)
        );

        let mut bad = layout();
        bad.common_data_end = PRIV_DATA;
        assert_eq!(
            IsolationPolicy::DualPrivilege { layout: bad }.region_table().err(),
            Some(ErrorCode::INVAL)
        );
    }

    #[test]
    fn locked_policy_can_not_be_reinstalled() {
        let pmp = pmp();
        let policy = IsolationPolicy::DualPrivilege { layout: layout() };
        install(&pmp, &policy, true).unwrap();
        // Entry 0 is unlocked and rewritten; entry 1 is locked.
        assert_eq!(install(&pmp, &policy, true), Err(ErrorCode::ALREADY));
    }

    #[test]
    fn too_few_entries() {
        let pmp = KernelPMP::new(SimulatedPMP::<2>::new()).unwrap();
        assert_eq!(
            install(&pmp, &IsolationPolicy::DualPrivilege { layout: layout() }, true),
            Err(ErrorCode::SIZE)
        );
    }

    #[test]
    fn early_boot_grants_ram_until_narrowed() {
        let pmp = pmp();
        let chip = Chip::new();
        install(&pmp, &IsolationPolicy::EarlyBootDualPrivilege { layout: layout() }, true)
            .unwrap();

        assert!(pmp.check_access(User, 0x8000_3000, Write));
        assert!(!pmp.check_access(User, PRIV_DATA, Read));

        let narrowed =
            PMPRegion::tor(3, COMMON_DATA_END, Permissions::ReadWriteOnly, true).unwrap();
        replace_transitional(&pmp, &chip, &narrowed).unwrap();
        assert_eq!(chip.masked_calls.get(), 1);
        assert!(!chip.masked.get());

        assert!(!pmp.check_access(User, 0x8000_3000, Write));
        assert!(pmp.check_access(User, 0x8000_0800, Write));

        // Locked now.
        assert_eq!(
            replace_transitional(&pmp, &chip, &narrowed),
            Err(ErrorCode::ALREADY)
        );
    }

    #[test]
    fn narrowing_in_masked_window_stays_masked() {
        let pmp = pmp();
        let chip = Chip::new();
        install(&pmp, &IsolationPolicy::EarlyBootDualPrivilege { layout: layout() }, true)
            .unwrap();

        chip.disable_interrupts();
        let narrowed =
            PMPRegion::tor(3, COMMON_DATA_END, Permissions::ReadWriteOnly, true).unwrap();
        replace_transitional(&pmp, &chip, &narrowed).unwrap();

        assert!(chip.masked.get());
        assert!(!pmp.check_access(User, 0x8000_3000, Write));
    }

    #[test]
    fn transitional_index_is_checked() {
        let pmp = pmp();
        let chip = Chip::new();
        let region = PMPRegion::tor(2, COMMON_DATA_END, Permissions::ReadWriteOnly, true).unwrap();
        assert_eq!(
            replace_transitional(&pmp, &chip, &region),
            Err(ErrorCode::INVAL)
        );
        assert_eq!(chip.masked_calls.get(), 0);
    }

    #[test]
    fn read_only_guard_blocks_writes_everywhere() {
        let pmp = pmp();
        install(
            &pmp,
            &IsolationPolicy::ReadOnlyGuard {
                start: 0x2040_8000,
                size: 0x400,
            },
            false,
        )
        .unwrap();

        assert!(pmp.check_access(Machine, 0x2040_8010, Read));
        assert!(!pmp.check_access(Machine, 0x2040_8010, Write));
        assert!(!pmp.check_access(Machine, 0x2040_8010, Execute));
        assert!(pmp.check_access(Machine, 0x2040_8400, Write));
    }

    struct LimitedLed(usize);

    impl Led for LimitedLed {
        fn init(&mut self) {}
        fn on(&mut self) {}
        fn off(&mut self) {}
        fn toggle(&mut self) {
            self.0 -= 1;
            if self.0 == 0 {
                panic!("halted in fatal loop");
            }
        }
        fn read(&self) -> bool {
            false
        }
    }

    #[test]
    #[should_panic(expected = "halted in fatal loop")]
    fn unretained_policy_halts() {
        // 16 KiB granularity: the 512-byte privileged data zone is rounded up.
        let pmp = KernelPMP::new(SimulatedPMP::<4>::with_granularity(12)).unwrap();
        let chip = Chip::new();
        install_or_halt(
            &pmp,
            &IsolationPolicy::DualPrivilege { layout: layout() },
            true,
            &chip,
            &mut [&mut LimitedLed(2)],
        );
    }

    #[test]
    fn accepted_policy_returns() {
        let pmp = pmp();
        let chip = Chip::new();
        install_or_halt(
            &pmp,
            &IsolationPolicy::PrivilegedOnly {
                ram: RamRegion::default(),
            },
            false,
            &chip,
            &mut [&mut LimitedLed(1)],
        );
        assert!(!chip.masked.get());
    }
}
