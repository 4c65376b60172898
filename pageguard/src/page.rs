use lazy_static::lazy_static;

use crate::platform;

lazy_static! {
    pub static ref PAGESIZE: usize = platform::system_page_size();
}

/// efficient way to calculate: ceil(x / y)
pub fn ceil_div(x: usize, y: usize) -> usize {
    x.div_ceil(y)
}

pub fn align_down(address: usize, page_size: usize) -> usize {
    address & !(page_size - 1)
}

pub fn page_offset(address: usize, page_size: usize) -> usize {
    address & (page_size - 1)
}

/// Rounds `size` up to a whole number of pages.
pub fn align_up(size: usize, page_size: usize) -> usize {
    ceil_div(size, page_size) * page_size
}

/// Page geometry of one tracked region.
///
/// Page indices count from the page-aligned base used for protection calls.
/// `aligned_offset` is the distance from that base to the first tracked byte,
/// which is only non-zero when the region is tracked in place and the caller's
/// pointer is not page-aligned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLayout {
    pub page_size: usize,
    pub aligned_offset: usize,
    pub total_pages: usize,
    pub last_segment_size: usize,
}

impl PageLayout {
    pub fn new(page_size: usize, aligned_offset: usize, size: usize) -> Self {
        debug_assert!(page_size.is_power_of_two());
        debug_assert!(aligned_offset < page_size);

        let guard_range = size + aligned_offset;
        let mut total_pages = guard_range / page_size;
        let mut last_segment_size = guard_range % page_size;

        if last_segment_size != 0 {
            total_pages += 1;
        } else {
            last_segment_size = page_size;
        }

        Self {
            page_size,
            aligned_offset,
            total_pages,
            last_segment_size,
        }
    }

    /// Bytes covered by the protection range, from the aligned base.
    pub fn guard_range(&self) -> usize {
        (self.total_pages - 1) * self.page_size + self.last_segment_size
    }

    /// Length of page `index`; only the last page can be partial.
    pub fn segment_size(&self, index: usize) -> usize {
        assert!(index < self.total_pages);

        if index + 1 < self.total_pages {
            self.page_size
        } else {
            self.last_segment_size
        }
    }

    pub fn page_index_of(&self, offset_from_base: usize) -> usize {
        offset_from_base / self.page_size
    }

    /// Converts the pages `[start, end)` to an `(offset, len)` pair relative to
    /// the first tracked byte, never extending past the registered size.
    pub fn byte_range(&self, start: usize, end: usize) -> (usize, usize) {
        assert!(start < end && end <= self.total_pages);

        let mut offset = start * self.page_size;
        let mut len = (end - start) * self.page_size;

        if end == self.total_pages {
            len -= self.page_size - self.last_segment_size;
        }

        if start == 0 {
            len -= self.aligned_offset;
        } else {
            offset -= self.aligned_offset;
        }

        (offset, len)
    }
}
