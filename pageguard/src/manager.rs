use std::{
    ptr::NonNull,
    sync::{Arc, Weak},
};

use lazy_static::lazy_static;
use log::{debug, error, info, trace, warn};
use parking_lot::{Mutex, MutexGuard};
use scopeguard::ScopeGuard;

use crate::{
    config::PageGuardConfig,
    error::{Error, IgnoreNotSupportedErrorExt, Result},
    fault::{default_fault_source, FaultAccess, FaultResolver, FaultSource, GuardFault, HookId},
    page::PAGESIZE,
    protection::{protect, Protection},
    registry::{MemoryInfo, RegionMode, RegionRegistry},
    shadow::ShadowMemory,
    statistics::{guard::GuardStatistics, StatisticValue, StatisticsProvider},
    write_watch::{null::NullWriteWatch, ResetScope, WriteWatch, WriteWatchType},
};

/// A run of consecutive dirty pages of one region, reported by a drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModifiedRange {
    pub memory_id: u64,
    /// Start of the region's effective memory: the shadow buffer for shadowed
    /// regions, the caller's mapping otherwise.
    pub base: NonNull<u8>,
    /// Byte offset of the range from `base`.
    pub offset: usize,
    pub len: usize,
}

impl ModifiedRange {
    pub fn as_ptr(&self) -> *const u8 {
        self.base.as_ptr().wrapping_add(self.offset)
    }

    /// # Safety
    ///
    /// Only valid inside the drain callback that received this range.
    pub unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.as_ptr(), self.len)
    }
}

/// Tracking status of one page, as seen by the last fault or drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageStatus {
    pub active_write: bool,
    pub active_read: bool,
    pub block_loaded: bool,
}

type PeerList = Vec<Weak<GuardState>>;

lazy_static! {
    /// Direct-mode managers whose write-watch reset clears the whole process.
    /// Whoever resets must hold this lock, taken before any registry lock, and
    /// harvest every listed manager first.
    static ref PROCESS_WIDE_WATCHERS: Mutex<PeerList> = Mutex::new(Vec::new());
}

/// State shared between the manager, the fault hook and other managers
/// resetting a process-wide write-watch.
struct GuardState {
    config: PageGuardConfig,
    page_size: usize,
    separate_reads: bool,
    registry: Mutex<RegionRegistry>,
    stats: GuardStatistics,
    write_watch: Box<dyn WriteWatch>,
    process_wide_reset: bool,
}

impl GuardState {
    fn protect_page(&self, address: usize, len: usize, protection: Protection) {
        let Some(ptr) = NonNull::new(address as *mut u8) else {
            return;
        };

        if let Err(e) = unsafe { protect(ptr, len, protection) } {
            self.stats.record_protection_failure();
            error!("Failed to set {protection} on {address:#x} ({len} bytes): {e}");
        }
    }

    /// Fills in the write bits of regions that are not trapped.
    ///
    /// `target` limits the work to one region, except that `all_direct`
    /// queries every direct region. Returns whether any was queried.
    fn harvest_direct_regions(&self, registry: &mut RegionRegistry, target: Option<u64>, all_direct: bool) -> bool {
        let mut harvested = false;

        for (memory_id, info) in registry.iter_mut() {
            let selected = target.map_or(true, |t| t == memory_id);

            match info.mode {
                RegionMode::Shadow(_) => {}
                RegionMode::Unguarded if selected => Self::mark_fully_dirty(info),
                RegionMode::Unguarded => {}
                RegionMode::Direct if selected || all_direct => {
                    self.load_active_write_states(memory_id, info);
                    harvested = true;
                }
                RegionMode::Direct => {}
            }
        }

        harvested
    }

    fn load_active_write_states(&self, memory_id: u64, info: &mut MemoryInfo) {
        match self.write_watch.written_pages(info.watch_range()) {
            Ok(pages) => {
                let total_pages = info.layout.total_pages;

                for index in pages.into_iter().filter(|&i| i < total_pages) {
                    info.status_tracker.set_active_write(index, true);
                    info.is_modified = true;
                }
            }
            Err(Error::NotSupported(_)) => Self::mark_fully_dirty(info),
            Err(e) => {
                error!("Failed to query written pages of memory {memory_id:#x}, reporting all: {e}");
                Self::mark_fully_dirty(info);
            }
        }
    }

    fn mark_fully_dirty(info: &mut MemoryInfo) {
        info.status_tracker.set_all_active_write();
        info.is_modified = true;
    }

    /// Copies page `index` of the caller's mapping into the shadow buffer.
    ///
    /// The shadow page must be writable.
    fn load_page(info: &MemoryInfo, index: usize) {
        let start = index * info.layout.page_size;
        let len = info.layout.segment_size(index);

        unsafe {
            std::ptr::copy_nonoverlapping(
                info.mapped_memory.as_ptr().add(start),
                (info.aligned_address + start) as *mut u8,
                len,
            )
        };
    }
}

impl FaultResolver for GuardState {
    fn resolve(&self, fault: &GuardFault) -> bool {
        let mut registry = self.registry.lock();

        let Some(info) = registry.find_guarded_mut(fault.address) else {
            return false;
        };

        let is_write = !(self.separate_reads && fault.access == FaultAccess::Read);
        self.stats.record_fault(is_write);

        let index = info.page_index_of(fault.address);
        let page_address = info.aligned_address + index * self.page_size;
        let segment_size = info.layout.segment_size(index);

        trace!(
            "Guard fault at {:#x} (page {index}, {:?})",
            fault.address,
            fault.access
        );

        if !fault.guard_cleared {
            self.protect_page(page_address, segment_size, Protection::ReadWrite);
        }

        let lazy_copy = self.config.uses_lazy_copy();

        if is_write {
            if lazy_copy && !info.status_tracker.is_block_loaded(index) {
                Self::load_page(info, index);
                info.status_tracker.set_block_loaded(index, true);
            }

            info.status_tracker.set_active_write(index, true);
        } else {
            // Reads always see the mapping's current contents.
            Self::load_page(info, index);

            if lazy_copy {
                info.status_tracker.set_block_loaded(index, true);
            }

            info.status_tracker.set_active_read(index, true);

            if self.config.enable_read_write_same_page {
                info.status_tracker.set_active_write(index, true);
            } else {
                self.protect_page(page_address, segment_size, Protection::ReadOnly);
            }
        }

        info.is_modified = true;

        true
    }
}

#[derive(Debug, Default)]
struct HookState {
    id: Option<HookId>,
    users: usize,
}

/// Tracks which pages of registered memory regions are written between
/// drains.
///
/// In shadow mode every region is replaced by a protected private copy: the
/// first access to each page traps, is recorded and unprotects the page, and
/// a drain copies the dirty pages back before re-protecting them. In direct
/// mode the regions are left alone and the write-watch backend reports which
/// pages were written.
pub struct PageGuardManager {
    state: Arc<GuardState>,
    fault_source: Box<dyn FaultSource>,
    hook: Mutex<HookState>,
}

impl PageGuardManager {
    pub fn new(config: PageGuardConfig) -> Self {
        let write_watch: Box<dyn WriteWatch> = if config.enable_shadow_memory {
            Box::new(NullWriteWatch)
        } else {
            WriteWatchType::default().build()
        };

        Self::with_backends(config, default_fault_source(), write_watch)
    }

    pub fn with_backends(
        config: PageGuardConfig,
        fault_source: Box<dyn FaultSource>,
        write_watch: Box<dyn WriteWatch>,
    ) -> Self {
        let separate_reads = config.enable_separate_read_tracking && fault_source.reports_access_kind();

        if config.enable_separate_read_tracking && !separate_reads {
            warn!(
                "Fault source `{}` cannot tell reads from writes, all faults are recorded as writes",
                fault_source.name()
            );
        }

        if config.enable_lazy_copy && !config.enable_copy_on_map {
            warn!("Lazy copy has no effect without copy-on-map");
        }

        info!(
            "Page guard manager: {} mode, fault source `{}`, write-watch `{}`",
            if config.enable_shadow_memory { "shadow" } else { "direct" },
            fault_source.name(),
            write_watch.name()
        );

        let process_wide_reset = !config.enable_shadow_memory && write_watch.reset_scope() == ResetScope::Process;

        let state = Arc::new(GuardState {
            config,
            page_size: *PAGESIZE,
            separate_reads,
            registry: Mutex::new(RegionRegistry::new()),
            stats: GuardStatistics::new(),
            write_watch,
            process_wide_reset,
        });

        if process_wide_reset {
            let mut watchers = PROCESS_WIDE_WATCHERS.lock();
            watchers.retain(|peer| peer.strong_count() > 0);
            watchers.push(Arc::downgrade(&state));
        }

        Self {
            state,
            fault_source,
            hook: Mutex::new(HookState::default()),
        }
    }

    pub fn config(&self) -> &PageGuardConfig {
        &self.state.config
    }

    pub fn page_size(&self) -> usize {
        self.state.page_size
    }

    pub fn nr_regions(&self) -> usize {
        self.state.registry.lock().len()
    }

    pub fn is_fault_handler_installed(&self) -> bool {
        self.hook.lock().id.is_some()
    }

    pub fn statistics(&self) -> &GuardStatistics {
        &self.state.stats
    }

    /// Starts tracking `size` bytes at `mapped` under `memory_id`.
    ///
    /// Returns the pointer all further accesses must go through: a shadow
    /// buffer in shadow mode, `mapped` itself otherwise. If the shadow cannot
    /// be set up the region is still registered, untracked, and every drain
    /// reports it in full.
    ///
    /// # Safety
    ///
    /// `mapped` must be valid for reads and writes of `size` bytes until the
    /// region is removed or the manager is dropped.
    pub unsafe fn add_memory(&self, memory_id: u64, mapped: NonNull<u8>, size: usize) -> Result<NonNull<u8>> {
        if size == 0 {
            return Err(Error::InvalidArgument("memory region size must be non-zero"));
        }

        if self.state.registry.lock().contains(memory_id) {
            return Err(Error::AlreadyRegistered(memory_id));
        }

        if !self.state.config.enable_shadow_memory {
            let info = MemoryInfo::in_place(mapped, size, self.state.page_size, RegionMode::Direct);
            return self.insert_direct(memory_id, info);
        }

        let (info, hooked) = match self.prepare_shadow(mapped, size) {
            Ok(info) => (info, true),
            Err(e) => {
                error!(
                    "Failed to guard memory {memory_id:#x} at {:p} ({size} bytes), \
                     it will be reported fully dirty: {e}",
                    mapped.as_ptr()
                );
                let info = MemoryInfo::in_place(mapped, size, self.state.page_size, RegionMode::Unguarded);
                (info, false)
            }
        };

        let inserted = self
            .state
            .registry
            .lock()
            .insert(memory_id, info)
            .map(|info| (info.effective_pointer(), info.mode.to_string()));

        match inserted {
            Ok((effective, mode)) => {
                debug!(
                    "Tracking memory {memory_id:#x}: {:p} ({size} bytes) via {mode} {:p}",
                    mapped.as_ptr(),
                    effective.as_ptr()
                );
                Ok(effective)
            }
            Err(e) => {
                if hooked {
                    self.release_fault_hook();
                }
                Err(e)
            }
        }
    }

    fn prepare_shadow(&self, mapped: NonNull<u8>, size: usize) -> Result<MemoryInfo> {
        self.acquire_fault_hook()?;
        let hook = scopeguard::guard((), |_| self.release_fault_hook());

        let shadow = ShadowMemory::allocate(size)?;

        if self.state.config.uses_eager_copy() {
            unsafe { std::ptr::copy_nonoverlapping(mapped.as_ptr(), shadow.as_ptr(), size) };
        }

        let info = MemoryInfo::shadowed(mapped, size, shadow, self.state.page_size);

        if let Some(shadow) = info.shadow_memory() {
            unsafe { protect(shadow.as_non_null(), info.layout.guard_range(), Protection::NoAccess)? };
        }

        ScopeGuard::into_inner(hook);

        Ok(info)
    }

    fn insert_direct(&self, memory_id: u64, info: MemoryInfo) -> Result<NonNull<u8>> {
        let peers = self.lock_process_wide_watchers();
        let mut registry = self.state.registry.lock();
        let watch_range = info.watch_range();

        if let Some(peers) = peers.as_deref() {
            // The reset below forgets writes to every other region as well.
            self.state.harvest_direct_regions(&mut registry, None, true);
            self.harvest_other_managers(peers);
        }

        let info = registry.insert(memory_id, info)?;

        if let Err(e) = self.state.write_watch.reset(watch_range).ignore_not_supported_error() {
            warn!("Failed to reset write-watch for memory {memory_id:#x}: {e}");
        }

        debug!(
            "Tracking memory {memory_id:#x}: {:p} ({} bytes) in place",
            info.mapped_memory.as_ptr(),
            info.mapped_range
        );

        Ok(info.effective_pointer())
    }

    /// Stops tracking `memory_id`. Pending writes that have not been drained
    /// are lost. Unknown ids are ignored.
    pub fn remove_memory(&self, memory_id: u64) {
        let Some(info) = self.state.registry.lock().remove(memory_id) else {
            return;
        };

        debug!("Released memory {memory_id:#x} ({} mode)", info.mode);

        if info.is_guarded() {
            drop(info);
            self.release_fault_hook();
        }
    }

    pub fn get_memory(&self, memory_id: u64) -> Option<NonNull<u8>> {
        self.state
            .registry
            .lock()
            .get(memory_id)
            .map(|info| info.effective_pointer())
    }

    pub fn page_status(&self, memory_id: u64, page_index: usize) -> Option<PageStatus> {
        let registry = self.state.registry.lock();
        let info = registry.get(memory_id)?;

        (page_index < info.status_tracker.len()).then(|| PageStatus {
            active_write: info.status_tracker.is_active_write(page_index),
            active_read: info.status_tracker.is_active_read(page_index),
            block_loaded: info.status_tracker.is_block_loaded(page_index),
        })
    }

    /// Offers a fault to this manager directly, without going through the
    /// fault source. Returns `true` if it hit a guarded page.
    pub fn resolve_fault(&self, fault: &GuardFault) -> bool {
        self.state.resolve(fault)
    }

    /// Reports every run of dirty pages of `memory_id` to `callback` and
    /// starts a new tracking interval for the region.
    ///
    /// Shadowed pages are copied back to the caller's mapping before the
    /// callback runs. The registry stays locked for the whole drain: the
    /// callback may read the range it is given but must not touch other
    /// pages of guarded regions, nor call back into a direct-mode manager
    /// whose write-watch resets the whole process.
    pub fn process_memory_entry<F>(&self, memory_id: u64, mut callback: F) -> Result<()>
    where
        F: FnMut(ModifiedRange),
    {
        let peers = self.lock_process_wide_watchers();
        let mut registry = self.state.registry.lock();

        if !registry.contains(memory_id) {
            return Ok(());
        }

        self.state.stats.record_drain();
        self.harvest_written_pages(&mut registry, Some(memory_id), peers.as_deref().map(|v| v.as_slice()));

        if let Some(info) = registry.get_mut(memory_id) {
            if info.is_modified {
                self.process_entry(memory_id, info, &mut callback);
            }
        }

        Ok(())
    }

    /// Drains every registered region, see [`Self::process_memory_entry`].
    pub fn process_memory_entries<F>(&self, mut callback: F) -> Result<()>
    where
        F: FnMut(ModifiedRange),
    {
        let peers = self.lock_process_wide_watchers();
        let mut registry = self.state.registry.lock();

        self.state.stats.record_drain();
        self.harvest_written_pages(&mut registry, None, peers.as_deref().map(|v| v.as_slice()));

        for (memory_id, info) in registry.iter_mut() {
            if info.is_modified {
                self.process_entry(memory_id, info, &mut callback);
            }
        }

        Ok(())
    }

    /// Held while a process-wide write-watch may be reset, see
    /// [`PROCESS_WIDE_WATCHERS`].
    fn lock_process_wide_watchers(&self) -> Option<MutexGuard<'static, PeerList>> {
        self.state.process_wide_reset.then(|| PROCESS_WIDE_WATCHERS.lock())
    }

    /// Harvests the direct regions of all other managers sharing the
    /// process-wide write-watch. Returns whether any was queried.
    fn harvest_other_managers(&self, peers: &[Weak<GuardState>]) -> bool {
        let mut harvested = false;

        for peer in peers.iter().filter_map(Weak::upgrade) {
            if Arc::ptr_eq(&peer, &self.state) {
                continue;
            }

            // Listed managers run in direct mode and hold direct regions only.
            let mut peer_registry = peer.registry.lock();
            harvested |= peer.harvest_direct_regions(&mut peer_registry, None, true);
        }

        harvested
    }

    /// Fills in the write bits of regions that are not trapped, harvesting
    /// other managers first when the write-watch reset is process-wide.
    fn harvest_written_pages(
        &self,
        registry: &mut RegionRegistry,
        target: Option<u64>,
        peers: Option<&[Weak<GuardState>]>,
    ) {
        let Some(peers) = peers else {
            self.state.harvest_direct_regions(registry, target, false);
            return;
        };

        let harvested = self.state.harvest_direct_regions(registry, target, true) | self.harvest_other_managers(peers);

        if harvested {
            if let Err(e) = self.state.write_watch.reset(0..0).ignore_not_supported_error() {
                warn!("Failed to reset write-watch: {e}");
            }
        }
    }

    fn process_entry<F>(&self, memory_id: u64, info: &mut MemoryInfo, callback: &mut F)
    where
        F: FnMut(ModifiedRange),
    {
        let total_pages = info.layout.total_pages;
        let mut run_start = None;

        trace!(
            "Draining memory {memory_id:#x}: {} of {total_pages} pages written",
            info.status_tracker.nr_active_write()
        );

        info.is_modified = false;

        for index in 0..total_pages {
            if info.status_tracker.is_active_write(index) {
                info.status_tracker.set_active_write(index, false);
                info.status_tracker.set_active_read(index, false);
                run_start.get_or_insert(index);
                continue;
            }

            if info.status_tracker.is_active_read(index) {
                info.status_tracker.set_active_read(index, false);
                self.state.protect_page(
                    info.aligned_address + index * self.state.page_size,
                    info.layout.segment_size(index),
                    Protection::NoAccess,
                );
            }

            if let Some(start) = run_start.take() {
                self.process_active_range(memory_id, info, start, index, callback);
            }
        }

        if let Some(start) = run_start {
            self.process_active_range(memory_id, info, start, total_pages, callback);
        }
    }

    fn process_active_range<F>(
        &self,
        memory_id: u64,
        info: &MemoryInfo,
        start: usize,
        end: usize,
        callback: &mut F,
    ) where
        F: FnMut(ModifiedRange),
    {
        let (offset, len) = info.layout.byte_range(start, end);

        trace!("Memory {memory_id:#x}: pages [{start}, {end}) dirty, {len} bytes at +{offset:#x}");

        match &info.mode {
            RegionMode::Shadow(shadow) => {
                let address = shadow.as_ptr() as usize + offset;

                // Writers on other threads trap while the pages are copied out.
                self.state.protect_page(address, len, Protection::ReadOnly);

                unsafe {
                    std::ptr::copy_nonoverlapping(
                        address as *const u8,
                        info.mapped_memory.as_ptr().add(offset),
                        len,
                    )
                };

                callback(ModifiedRange {
                    memory_id,
                    base: shadow.as_non_null(),
                    offset,
                    len,
                });

                self.state.protect_page(address, len, Protection::NoAccess);
                self.state.stats.record_range(len, true);
            }
            RegionMode::Direct | RegionMode::Unguarded => {
                callback(ModifiedRange {
                    memory_id,
                    base: info.mapped_memory,
                    offset,
                    len,
                });

                self.state.stats.record_range(len, false);
            }
        }
    }

    fn acquire_fault_hook(&self) -> Result<()> {
        let mut hook = self.hook.lock();

        if hook.id.is_none() {
            let resolver: Arc<dyn FaultResolver> = self.state.clone();
            hook.id = Some(self.fault_source.attach(resolver)?);
            debug!("Attached to {} fault source", self.fault_source.name());
        }

        hook.users += 1;

        Ok(())
    }

    fn release_fault_hook(&self) {
        let mut hook = self.hook.lock();

        hook.users = hook.users.saturating_sub(1);

        if hook.users == 0 {
            if let Some(id) = hook.id.take() {
                match self.fault_source.detach(id) {
                    Ok(()) => debug!("Detached from {} fault source", self.fault_source.name()),
                    Err(e) => error!("Failed to detach from {} fault source: {e}", self.fault_source.name()),
                }
            }
        }
    }
}

impl StatisticsProvider for PageGuardManager {
    fn class_name(&self) -> &'static str {
        self.state.stats.class_name()
    }

    fn statistics(&self) -> Box<[(String, Box<dyn StatisticValue>)]> {
        self.state.stats.statistics()
    }
}

impl Drop for PageGuardManager {
    fn drop(&mut self) {
        if self.state.process_wide_reset {
            PROCESS_WIDE_WATCHERS
                .lock()
                .retain(|peer| peer.strong_count() > 0 && !std::ptr::eq(peer.as_ptr(), Arc::as_ptr(&self.state)));
        }

        // Unhook first so no fault can observe a freed shadow buffer.
        {
            let mut hook = self.hook.lock();
            hook.users = 0;

            if let Some(id) = hook.id.take() {
                if let Err(e) = self.fault_source.detach(id) {
                    error!("Failed to detach from {} fault source: {e}", self.fault_source.name());
                }
            }
        }

        let mut registry = self.state.registry.lock();

        if !registry.is_empty() {
            debug!(
                "Releasing {} tracked memory regions ({} guarded)",
                registry.len(),
                registry.nr_guarded()
            );
        }

        registry.clear();
    }
}
