// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Interface for committing physical memory protection regions.
//!
//! A protection unit is a small, fixed number of statically ordered
//! address-range rules. The isolation core builds an ordered table of region
//! descriptors and writes it to the unit in a single pass through
//! [`ProtectionUnit::configure`], in strictly ascending index order. Regions
//! whose meaning depends on the previous entry (top-of-range matching) make
//! that order part of the protection boundary.

use core::fmt::{self, Display};

use crate::ErrorCode;

/// Access rights granted by a region.
///
/// Only combinations that the hardware can express are representable; in
/// particular there is no write-without-read variant.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Permissions {
    NoAccess,
    ReadWriteExecute,
    ReadWriteOnly,
    ReadExecuteOnly,
    ReadOnly,
    ExecuteOnly,
}

impl Permissions {
    /// Build a permission set from independent read/write/execute flags.
    ///
    /// Returns `Err(ErrorCode::RESERVE)` for write access without read
    /// access, which the architecture reserves.
    pub fn from_rwx(r: bool, w: bool, x: bool) -> Result<Permissions, ErrorCode> {
        match (r, w, x) {
            (false, false, false) => Ok(Permissions::NoAccess),
            (true, true, true) => Ok(Permissions::ReadWriteExecute),
            (true, true, false) => Ok(Permissions::ReadWriteOnly),
            (true, false, true) => Ok(Permissions::ReadExecuteOnly),
            (true, false, false) => Ok(Permissions::ReadOnly),
            (false, false, true) => Ok(Permissions::ExecuteOnly),
            (false, true, _) => Err(ErrorCode::RESERVE),
        }
    }

    pub fn read(&self) -> bool {
        matches!(
            self,
            Permissions::ReadWriteExecute
                | Permissions::ReadWriteOnly
                | Permissions::ReadExecuteOnly
                | Permissions::ReadOnly
        )
    }

    pub fn write(&self) -> bool {
        matches!(
            self,
            Permissions::ReadWriteExecute | Permissions::ReadWriteOnly
        )
    }

    pub fn execute(&self) -> bool {
        matches!(
            self,
            Permissions::ReadWriteExecute
                | Permissions::ReadExecuteOnly
                | Permissions::ExecuteOnly
        )
    }

    /// Whether these permissions allow an access of the given type.
    pub fn allows(&self, access: AccessType) -> bool {
        match access {
            AccessType::Read => self.read(),
            AccessType::Write => self.write(),
            AccessType::Execute => self.execute(),
        }
    }
}

impl Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |set: bool, c: char| if set { c } else { '-' };
        write!(
            f,
            "{}{}{}",
            flag(self.read(), 'r'),
            flag(self.write(), 'w'),
            flag(self.execute(), 'x')
        )
    }
}

/// Privilege level an access is issued from.
///
/// The isolation core distinguishes the most-privileged level (machine mode)
/// from a single secondary level (user mode).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PrivilegeLevel {
    Machine,
    User,
}

/// Kind of memory access being checked.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AccessType {
    Read,
    Write,
    Execute,
}

/// The commit interface of a physical memory protection unit.
///
/// Implementations enforce the ordering and locking invariants of the
/// hardware: an index that is not strictly greater than the previous one in
/// the current pass, or a region that is locked, is rejected and never
/// silently applied.
pub trait ProtectionUnit {
    /// Region descriptor understood by this unit.
    type Region: Copy + Display;

    /// Number of entries implemented by the hardware.
    fn number_total_regions(&self) -> usize;

    /// Start a new commit pass. Subsequent calls to
    /// [`ProtectionUnit::configure`] must use strictly ascending indices.
    fn begin_commit(&self);

    /// Write `region` to entry `index`.
    ///
    /// Returns `Err(ErrorCode::SIZE)` for an index beyond the implemented
    /// entries, `Err(ErrorCode::INVAL)` for an index out of commit order,
    /// `Err(ErrorCode::ALREADY)` if the entry is locked, and
    /// `Err(ErrorCode::FAIL)` if the hardware did not retain the
    /// configuration.
    fn configure(&self, index: usize, region: &Self::Region) -> Result<(), ErrorCode>;

    /// Whether an access of type `access` from `level` at `address` is allowed
    /// by the configuration currently held in hardware.
    fn check_access(&self, level: PrivilegeLevel, address: usize, access: AccessType) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_write_only_is_rejected() {
        assert_eq!(
            Permissions::from_rwx(false, true, false),
            Err(ErrorCode::RESERVE)
        );
        assert_eq!(
            Permissions::from_rwx(false, true, true),
            Err(ErrorCode::RESERVE)
        );
    }

    #[test]
    fn flags_round_trip_through_rwx() {
        for perms in [
            Permissions::NoAccess,
            Permissions::ReadWriteExecute,
            Permissions::ReadWriteOnly,
            Permissions::ReadExecuteOnly,
            Permissions::ReadOnly,
            Permissions::ExecuteOnly,
        ] {
            assert_eq!(
                Permissions::from_rwx(perms.read(), perms.write(), perms.execute()),
                Ok(perms)
            );
        }
    }

    #[test]
    fn read_execute_denies_write() {
        let perms = Permissions::ReadExecuteOnly;
        assert!(perms.allows(AccessType::Read));
        assert!(perms.allows(AccessType::Execute));
        assert!(!perms.allows(AccessType::Write));
    }
}
