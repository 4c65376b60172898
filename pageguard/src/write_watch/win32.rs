use std::{ffi::c_void, ops::Range, ptr::null_mut};

use windows::Win32::System::Memory::{GetWriteWatch, ResetWriteWatch, WRITE_WATCH_FLAG_RESET};

use super::{ResetScope, WriteWatch};
use crate::{
    error::{Error, Result},
    page::{ceil_div, PAGESIZE},
};

/// `GetWriteWatch` on memory allocated with `MEM_WRITE_WATCH`.
pub struct Win32WriteWatch;

impl WriteWatch for Win32WriteWatch {
    fn name(&self) -> &'static str {
        "win32"
    }

    fn reset_scope(&self) -> ResetScope {
        ResetScope::Range
    }

    fn written_pages(&self, range: Range<usize>) -> Result<Vec<usize>> {
        let page_size = *PAGESIZE;
        let capacity = ceil_div(range.len(), page_size);
        let mut addresses: Vec<*mut c_void> = vec![null_mut(); capacity];
        let mut count = capacity;
        let mut granularity = 0u32;

        let ret = unsafe {
            GetWriteWatch(
                WRITE_WATCH_FLAG_RESET,
                range.start as *const c_void,
                range.len(),
                Some(addresses.as_mut_ptr()),
                Some(&mut count),
                Some(&mut granularity),
            )
        };

        if ret != 0 {
            return Err(Error::Windows(windows::core::Error::from_win32()));
        }

        Ok(addresses[..count]
            .iter()
            .map(|&address| (address as usize - range.start) / page_size)
            .collect())
    }

    fn reset(&self, range: Range<usize>) -> Result<()> {
        if unsafe { ResetWriteWatch(range.start as *const c_void, range.len()) } != 0 {
            return Err(Error::Windows(windows::core::Error::from_win32()));
        }
        Ok(())
    }
}
