use std::{fmt::Display, ptr::NonNull};

use crate::{error::Result, platform};

/// Access level applied to a page range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    /// Any access traps. On Windows this is a single-shot guard page that
    /// reverts to read-write once it fires.
    NoAccess,
    /// Reads succeed, writes trap.
    ReadOnly,
    /// No trapping.
    ReadWrite,
}

impl Display for Protection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protection::NoAccess => "---".fmt(f),
            Protection::ReadOnly => "r--".fmt(f),
            Protection::ReadWrite => "rw-".fmt(f),
        }
    }
}

/// Changes the protection of the pages spanning `[address, address + len)`.
///
/// # Safety
///
/// The range must lie inside a mapping owned by the caller, and no live
/// reference may rely on the access level being removed.
pub unsafe fn protect(address: NonNull<u8>, len: usize, protection: Protection) -> Result<()> {
    platform::protect(address, len, protection)
}
