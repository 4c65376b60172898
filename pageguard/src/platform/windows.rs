use std::{ffi::c_void, ptr::NonNull};

use windows::Win32::System::{
    Memory::{
        VirtualAlloc, VirtualFree, VirtualProtect, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE,
        PAGE_GUARD, PAGE_PROTECTION_FLAGS, PAGE_READONLY, PAGE_READWRITE,
    },
    SystemInformation::{GetSystemInfo, SYSTEM_INFO},
};

use crate::{
    error::{Error, Result},
    protection::Protection,
};

pub fn system_page_size() -> usize {
    let mut info = SYSTEM_INFO::default();
    unsafe { GetSystemInfo(&mut info) };
    info.dwPageSize as usize
}

fn page_flags(protection: Protection) -> PAGE_PROTECTION_FLAGS {
    match protection {
        Protection::NoAccess => PAGE_READWRITE | PAGE_GUARD,
        Protection::ReadOnly => PAGE_READONLY,
        Protection::ReadWrite => PAGE_READWRITE,
    }
}

pub fn allocate(len: usize) -> Result<NonNull<u8>> {
    if len == 0 {
        return Err(Error::InvalidArgument("zero-sized allocation"));
    }

    let ptr = unsafe { VirtualAlloc(None, len, MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE) };
    NonNull::new(ptr as *mut u8).ok_or(Error::AllocationFailed(len))
}

pub unsafe fn free(address: NonNull<u8>, _len: usize) -> Result<()> {
    VirtualFree(address.as_ptr() as *mut c_void, 0, MEM_RELEASE)?;
    Ok(())
}

pub unsafe fn protect(address: NonNull<u8>, len: usize, protection: Protection) -> Result<()> {
    let mut old = PAGE_PROTECTION_FLAGS::default();
    VirtualProtect(
        address.as_ptr() as *const c_void,
        len,
        page_flags(protection),
        &mut old,
    )?;
    Ok(())
}
