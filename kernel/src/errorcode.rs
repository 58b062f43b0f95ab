// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Standard errors in the isolation core.

use core::fmt;

/// Standard errors in the isolation core.
///
/// Every fallible configuration operation returns `Result<(), ErrorCode>`.
/// Configuration errors are never retried: boot code turns them into the
/// fatal path.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(usize)]
pub enum ErrorCode {
    /// The hardware did not retain the written value.
    FAIL = 1,
    /// The target is locked until the next hardware reset.
    ALREADY = 2,
    /// Malformed argument: misaligned region, empty range, or an index out of
    /// commit order.
    INVAL = 3,
    /// Index beyond the number of implemented entries or table capacity.
    SIZE = 4,
    /// The operation is not supported by this hart or for this cause.
    NOSUPPORT = 5,
    /// An entry expected to exist is not implemented by the hardware.
    NODEVICE = 6,
    /// The requested combination is reserved by the architecture.
    RESERVE = 7,
}

impl From<ErrorCode> for usize {
    fn from(err: ErrorCode) -> usize {
        err as usize
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            ErrorCode::FAIL => "hardware did not retain the configuration",
            ErrorCode::ALREADY => "entry is locked",
            ErrorCode::INVAL => "invalid argument",
            ErrorCode::SIZE => "index out of range",
            ErrorCode::NOSUPPORT => "not supported",
            ErrorCode::NODEVICE => "entry not implemented",
            ErrorCode::RESERVE => "reserved encoding",
        };
        write!(f, "{:?}: {}", self, msg)
    }
}
