use std::{num::NonZeroUsize, ptr::NonNull};

use nix::{
    libc,
    sys::mman::{mmap_anonymous, mprotect, munmap, MapFlags, ProtFlags},
};

use crate::{
    error::{Error, Result},
    protection::Protection,
};

pub fn system_page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

    if size <= 0 {
        4096
    } else {
        size as usize
    }
}

fn prot_flags(protection: Protection) -> ProtFlags {
    match protection {
        Protection::NoAccess => ProtFlags::PROT_NONE,
        Protection::ReadOnly => ProtFlags::PROT_READ,
        Protection::ReadWrite => ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
    }
}

pub fn allocate(len: usize) -> Result<NonNull<u8>> {
    let length = NonZeroUsize::new(len).ok_or(Error::InvalidArgument("zero-sized allocation"))?;

    let ptr = unsafe {
        mmap_anonymous(
            None,
            length,
            prot_flags(Protection::ReadWrite),
            MapFlags::MAP_PRIVATE,
        )
    }?;

    Ok(ptr.cast())
}

pub unsafe fn free(address: NonNull<u8>, len: usize) -> Result<()> {
    munmap(address.cast(), len)?;
    Ok(())
}

pub unsafe fn protect(address: NonNull<u8>, len: usize, protection: Protection) -> Result<()> {
    mprotect(address.cast(), len, prot_flags(protection))?;
    Ok(())
}
