use std::ops::Range;

use log::{debug, trace};
use procfs::process::{MemoryPageFlags, PageInfo, Process, SwapPageFlags};

use super::{ResetScope, WriteWatch};
use crate::{
    error::Result,
    page::{ceil_div, PAGESIZE},
};

const CLEAR_REFS_SOFT_DIRTY: &str = "4";

/// Write tracking through the kernel's soft-dirty PTE bit.
///
/// Clearing soft-dirty bits is only possible for the whole address space, so
/// a reset also drops pending writes of every other range.
pub struct SoftDirtyWriteWatch;

fn is_soft_dirty(pte: &PageInfo) -> bool {
    match pte {
        PageInfo::MemoryPage(flags) => flags.contains(MemoryPageFlags::SOFT_DIRTY),
        PageInfo::SwapPage(flags) => flags.contains(SwapPageFlags::SOFT_DIRTY),
    }
}

impl WriteWatch for SoftDirtyWriteWatch {
    fn name(&self) -> &'static str {
        "soft-dirty"
    }

    fn reset_scope(&self) -> ResetScope {
        ResetScope::Process
    }

    fn written_pages(&self, range: Range<usize>) -> Result<Vec<usize>> {
        let page_size = *PAGESIZE;
        let first_page = range.start / page_size;
        let end_page = ceil_div(range.end, page_size);

        let mut pagemap = Process::myself()?.pagemap()?;
        let range_info = pagemap.get_range_info(first_page..end_page)?;

        let pages: Vec<usize> = range_info
            .iter()
            .enumerate()
            .filter(|(_, pte)| is_soft_dirty(pte))
            .map(|(i, _)| i)
            .collect();

        trace!(
            "{:p}-{:p}: {} soft-dirty pages",
            range.start as *const u8,
            range.end as *const u8,
            pages.len()
        );

        Ok(pages)
    }

    fn reset(&self, _range: Range<usize>) -> Result<()> {
        debug!("Clearing soft-dirty bits");
        std::fs::write("/proc/self/clear_refs", CLEAR_REFS_SOFT_DIRTY)?;
        Ok(())
    }
}
