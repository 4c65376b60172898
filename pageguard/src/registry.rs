use std::{
    collections::{hash_map::Entry, HashMap},
    fmt::Display,
    ops::Range,
    ptr::NonNull,
};

use crate::{
    error::{Error, Result},
    page::{align_down, page_offset, PageLayout},
    shadow::ShadowMemory,
    status::PageStatusTracker,
};

#[derive(Debug)]
pub enum RegionMode {
    /// Accesses go to a protected private copy, synchronized on drain.
    Shadow(ShadowMemory),
    /// Accesses go to the mapping itself; writes come from the write-watch
    /// backend.
    Direct,
    /// Guard setup failed; the whole region is reported on every drain.
    Unguarded,
}

impl Display for RegionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegionMode::Shadow(_) => write!(f, "shadow"),
            RegionMode::Direct => write!(f, "direct"),
            RegionMode::Unguarded => write!(f, "unguarded"),
        }
    }
}

/// Tracking state of one registered mapping.
#[derive(Debug)]
pub struct MemoryInfo {
    /// Caller-owned memory. Never freed here.
    pub mapped_memory: NonNull<u8>,
    pub mapped_range: usize,
    pub mode: RegionMode,
    /// Page-aligned base that page indices and protection calls refer to.
    pub aligned_address: usize,
    pub layout: PageLayout,
    /// `[start_address, end_address)` is the range handed out to the caller.
    pub start_address: usize,
    pub end_address: usize,
    pub status_tracker: PageStatusTracker,
    pub is_modified: bool,
}

// The mapped pointer is only dereferenced under the registry lock.
unsafe impl Send for MemoryInfo {}

impl MemoryInfo {
    pub fn shadowed(
        mapped_memory: NonNull<u8>,
        size: usize,
        shadow: ShadowMemory,
        page_size: usize,
    ) -> Self {
        debug_assert!(shadow.len() >= size);

        let layout = PageLayout::new(page_size, 0, size);
        let start_address = shadow.as_ptr() as usize;

        Self {
            mapped_memory,
            mapped_range: size,
            aligned_address: start_address,
            layout,
            start_address,
            end_address: start_address + size,
            status_tracker: PageStatusTracker::new(layout.total_pages),
            is_modified: false,
            mode: RegionMode::Shadow(shadow),
        }
    }

    /// Tracks the mapping where it is. `mode` is [`RegionMode::Direct`] or
    /// [`RegionMode::Unguarded`].
    pub fn in_place(
        mapped_memory: NonNull<u8>,
        size: usize,
        page_size: usize,
        mode: RegionMode,
    ) -> Self {
        debug_assert!(!matches!(mode, RegionMode::Shadow(_)));

        let start_address = mapped_memory.as_ptr() as usize;
        let layout = PageLayout::new(page_size, page_offset(start_address, page_size), size);

        Self {
            mapped_memory,
            mapped_range: size,
            mode,
            aligned_address: align_down(start_address, page_size),
            layout,
            start_address,
            end_address: start_address + size,
            status_tracker: PageStatusTracker::new(layout.total_pages),
            is_modified: false,
        }
    }

    pub fn shadow_memory(&self) -> Option<&ShadowMemory> {
        match &self.mode {
            RegionMode::Shadow(shadow) => Some(shadow),
            _ => None,
        }
    }

    pub fn is_guarded(&self) -> bool {
        matches!(self.mode, RegionMode::Shadow(_))
    }

    /// The pointer the caller must use for all accesses.
    pub fn effective_pointer(&self) -> NonNull<u8> {
        self.shadow_memory()
            .map_or(self.mapped_memory, |s| s.as_non_null())
    }

    pub fn contains(&self, address: usize) -> bool {
        address >= self.start_address && address < self.end_address
    }

    pub fn page_index_of(&self, address: usize) -> usize {
        debug_assert!(address >= self.aligned_address);
        self.layout.page_index_of(address - self.aligned_address)
    }

    /// Aligned address range covering every tracked page.
    pub fn watch_range(&self) -> Range<usize> {
        self.aligned_address..self.aligned_address + self.layout.guard_range()
    }
}

#[derive(Debug, Default)]
pub struct RegionRegistry {
    regions: HashMap<u64, MemoryInfo>,
}

impl RegionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, memory_id: u64, info: MemoryInfo) -> Result<&mut MemoryInfo> {
        match self.regions.entry(memory_id) {
            Entry::Occupied(_) => Err(Error::AlreadyRegistered(memory_id)),
            Entry::Vacant(entry) => Ok(entry.insert(info)),
        }
    }

    pub fn remove(&mut self, memory_id: u64) -> Option<MemoryInfo> {
        self.regions.remove(&memory_id)
    }

    pub fn contains(&self, memory_id: u64) -> bool {
        self.regions.contains_key(&memory_id)
    }

    pub fn get(&self, memory_id: u64) -> Option<&MemoryInfo> {
        self.regions.get(&memory_id)
    }

    pub fn get_mut(&mut self, memory_id: u64) -> Option<&mut MemoryInfo> {
        self.regions.get_mut(&memory_id)
    }

    /// Finds the shadowed region whose handed-out range contains `address`.
    /// Regions tracked in place are never protected, so they are skipped.
    pub fn find_guarded_mut(&mut self, address: usize) -> Option<&mut MemoryInfo> {
        self.regions
            .values_mut()
            .find(|info| info.is_guarded() && info.contains(address))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u64, &mut MemoryInfo)> {
        self.regions.iter_mut().map(|(id, info)| (*id, info))
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn nr_guarded(&self) -> usize {
        self.regions.values().filter(|info| info.is_guarded()).count()
    }

    pub fn clear(&mut self) {
        self.regions.clear();
    }
}
