use bitvec::vec::BitVec;

/// Per-page tracking state of one region: three independent flags per page.
#[derive(Debug, Clone)]
pub struct PageStatusTracker {
    active_write: BitVec,
    active_read: BitVec,
    block_loaded: BitVec,
}

impl PageStatusTracker {
    pub fn new(total_pages: usize) -> Self {
        Self {
            active_write: BitVec::repeat(false, total_pages),
            active_read: BitVec::repeat(false, total_pages),
            block_loaded: BitVec::repeat(false, total_pages),
        }
    }

    pub fn len(&self) -> usize {
        self.active_write.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active_write.is_empty()
    }

    pub fn is_active_write(&self, index: usize) -> bool {
        self.active_write[index]
    }

    pub fn set_active_write(&mut self, index: usize, value: bool) {
        self.active_write.set(index, value)
    }

    pub fn is_active_read(&self, index: usize) -> bool {
        self.active_read[index]
    }

    pub fn set_active_read(&mut self, index: usize, value: bool) {
        self.active_read.set(index, value)
    }

    pub fn is_block_loaded(&self, index: usize) -> bool {
        self.block_loaded[index]
    }

    pub fn set_block_loaded(&mut self, index: usize, value: bool) {
        self.block_loaded.set(index, value)
    }

    pub fn set_all_active_write(&mut self) {
        self.active_write.fill(true);
    }

    pub fn nr_active_write(&self) -> usize {
        self.active_write.count_ones()
    }

    pub fn clear_all(&mut self) {
        self.active_write.fill(false);
        self.active_read.fill(false);
        self.block_loaded.fill(false);
    }
}
