use std::{ops::Range, ptr::NonNull};

use log::{error, trace};

use crate::{
    error::Result,
    page::{align_up, PAGESIZE},
    platform,
};

/// A page-aligned private buffer standing in for a caller's mapping.
///
/// The buffer is released exactly once, when the handle is dropped.
#[derive(Debug)]
pub struct ShadowMemory {
    ptr: NonNull<u8>,
    len: usize,
}

// The handle owns the mapping; all accesses through it are synchronized by the
// registry lock.
unsafe impl Send for ShadowMemory {}
unsafe impl Sync for ShadowMemory {}

impl ShadowMemory {
    /// Allocates at least `size` bytes, rounded up to whole pages.
    pub fn allocate(size: usize) -> Result<Self> {
        let len = align_up(size, *PAGESIZE);
        let ptr = platform::allocate(len)?;

        trace!("Allocated shadow memory {:p} ({} bytes)", ptr.as_ptr(), len);

        Ok(Self { ptr, len })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn as_non_null(&self) -> NonNull<u8> {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn address_range(&self) -> Range<usize> {
        let start = self.ptr.as_ptr() as usize;
        start..start + self.len
    }
}

impl Drop for ShadowMemory {
    fn drop(&mut self) {
        trace!("Freeing shadow memory {:p}", self.ptr.as_ptr());

        if let Err(e) = unsafe { platform::free(self.ptr, self.len) } {
            error!(
                "Failed to free shadow memory at {:p} ({} bytes): {}",
                self.ptr.as_ptr(),
                self.len,
                e
            );
        }
    }
}
