use std::{ptr::NonNull, sync::Once};

use pageguard::{ModifiedRange, PageGuardManager};
use parking_lot::{const_mutex, Mutex};

static INIT: Once = Once::new();

/// Soft-dirty resets are process-wide; tests relying on them take this lock.
pub static SOFT_DIRTY_LOCK: Mutex<()> = const_mutex(());

pub fn setup() {
    INIT.call_once(|| {
        let _ = pretty_env_logger::formatted_builder()
            .parse_default_env()
            .is_test(true)
            .try_init();
    });
}

pub fn ptr_of(buffer: &mut [u8]) -> NonNull<u8> {
    NonNull::new(buffer.as_mut_ptr()).unwrap()
}

/// Drains `memory_id` and returns the reported `(offset, len)` pairs.
pub fn drain(manager: &PageGuardManager, memory_id: u64) -> Vec<(usize, usize)> {
    let mut ranges = Vec::new();

    manager
        .process_memory_entry(memory_id, |range: ModifiedRange| {
            assert_eq!(range.memory_id, memory_id);
            ranges.push((range.offset, range.len));
        })
        .unwrap();

    ranges
}

pub fn write_byte(base: NonNull<u8>, offset: usize, value: u8) {
    unsafe { std::ptr::write_volatile(base.as_ptr().add(offset), value) };
}

pub fn read_byte(base: NonNull<u8>, offset: usize) -> u8 {
    unsafe { std::ptr::read_volatile(base.as_ptr().add(offset)) }
}

/// Page-aligned anonymous shared mapping. Shared mappings are never merged
/// with neighbouring allocations, which keeps their soft-dirty state isolated.
#[cfg(unix)]
pub struct SharedMapping {
    ptr: NonNull<u8>,
    len: usize,
}

#[cfg(unix)]
impl SharedMapping {
    pub fn new(len: usize) -> Self {
        use nix::sys::mman::{mmap_anonymous, MapFlags, ProtFlags};

        let ptr = unsafe {
            mmap_anonymous(
                None,
                std::num::NonZeroUsize::new(len).unwrap(),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
            )
        }
        .unwrap();

        Self {
            ptr: ptr.cast(),
            len,
        }
    }

    pub fn as_non_null(&self) -> NonNull<u8> {
        self.ptr
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn fill(&self, value: u8) {
        unsafe { std::ptr::write_bytes(self.ptr.as_ptr(), value, self.len) };
    }
}

#[cfg(unix)]
impl Drop for SharedMapping {
    fn drop(&mut self) {
        unsafe { nix::sys::mman::munmap(self.ptr.cast(), self.len) }.unwrap();
    }
}
