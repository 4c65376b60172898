
use std::{collections::BTreeSet, ops::Range, ptr::NonNull, sync::Arc};

use pageguard::{
    fault::default_fault_source,
    page::{align_down, PAGESIZE},
    write_watch::{ResetScope, WriteWatch, WriteWatchType},
    PageGuardConfigBuilder, PageGuardManager, Result,
};
use parking_lot::Mutex;

use crate::common::{drain, ptr_of, setup};

/// Write-watch backend fed by the test instead of the hardware.
struct ScriptedWriteWatch {
    scope: ResetScope,
    written: Arc<Mutex<BTreeSet<usize>>>,
}

impl WriteWatch for ScriptedWriteWatch {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn reset_scope(&self) -> ResetScope {
        self.scope
    }

    fn written_pages(&self, range: Range<usize>) -> Result<Vec<usize>> {
        let page_size = *PAGESIZE;
        let mut written = self.written.lock();

        let pages: BTreeSet<usize> = written
            .iter()
            .filter(|address| range.contains(address))
            .map(|address| (address - range.start) / page_size)
            .collect();

        if self.scope == ResetScope::Range {
            written.retain(|address| !range.contains(address));
        }

        Ok(pages.into_iter().collect())
    }

    fn reset(&self, range: Range<usize>) -> Result<()> {
        let mut written = self.written.lock();

        match self.scope {
            ResetScope::Range => written.retain(|address| !range.contains(address)),
            ResetScope::Process => written.clear(),
        }

        Ok(())
    }
}

struct Harness {
    manager: PageGuardManager,
    written: Arc<Mutex<BTreeSet<usize>>>,
}

impl Harness {
    fn new(scope: ResetScope) -> Self {
        Self::with_written(scope, Arc::new(Mutex::new(BTreeSet::new())))
    }

    /// A second manager watching the same simulated hardware bits.
    fn sharing(&self, scope: ResetScope) -> Self {
        Self::with_written(scope, self.written.clone())
    }

    fn with_written(scope: ResetScope, written: Arc<Mutex<BTreeSet<usize>>>) -> Self {
        setup();

        let manager = PageGuardManager::with_backends(
            PageGuardConfigBuilder::direct().build().unwrap(),
            default_fault_source(),
            Box::new(ScriptedWriteWatch {
                scope,
                written: written.clone(),
            }),
        );

        Self { manager, written }
    }

    fn write(&self, base: NonNull<u8>, offset: usize, value: u8) {
        let address = base.as_ptr() as usize + offset;
        unsafe { std::ptr::write_volatile(address as *mut u8, value) };
        self.written.lock().insert(address);
    }
}

/// A buffer slice starting `misalignment` bytes past a page boundary.
fn unaligned_region(backing: &mut [u8], misalignment: usize) -> NonNull<u8> {
    let page_size = *PAGESIZE;
    let base = backing.as_ptr() as usize;
    let start = align_down(base, page_size) + page_size + misalignment;

    ptr_of(&mut backing[start - base..])
}

#[test]
fn unaligned_base_reports_offsets_from_region_start() {
    let harness = Harness::new(ResetScope::Range);
    let page_size = *PAGESIZE;
    let mut backing = vec![0u8; 5 * page_size];
    let region = unaligned_region(&mut backing, 100);
    let size = 2 * page_size;

    let effective = unsafe { harness.manager.add_memory(1, region, size).unwrap() };
    assert_eq!(effective, region);

    harness.write(region, 0, 1);
    harness.write(region, size - 1, 2);

    // The region spans three pages; the middle one is clean.
    assert_eq!(
        drain(&harness.manager, 1),
        vec![(0, page_size - 100), (2 * page_size - 100, 100)]
    );
    assert!(drain(&harness.manager, 1).is_empty());

    harness.write(region, page_size - 100, 3);
    assert_eq!(drain(&harness.manager, 1), vec![(page_size - 100, page_size)]);
}

#[test]
fn adjacent_pages_merge_into_one_range() {
    let harness = Harness::new(ResetScope::Range);
    let page_size = *PAGESIZE;
    let mut backing = vec![0u8; 5 * page_size];
    let region = unaligned_region(&mut backing, 100);
    let size = 2 * page_size;

    unsafe { harness.manager.add_memory(1, region, size).unwrap() };

    harness.write(region, 0, 1);
    harness.write(region, page_size, 2);

    assert_eq!(drain(&harness.manager, 1), vec![(0, 2 * page_size - 100)]);
}

#[test]
fn writes_before_registration_are_not_reported() {
    let harness = Harness::new(ResetScope::Range);
    let page_size = *PAGESIZE;
    let mut backing = vec![0u8; 4 * page_size];
    let region = unaligned_region(&mut backing, 0);

    harness.write(region, 10, 1);

    unsafe { harness.manager.add_memory(1, region, 2 * page_size).unwrap() };
    assert!(drain(&harness.manager, 1).is_empty());
}

#[test]
fn process_wide_reset_keeps_other_regions_pending() {
    let harness = Harness::new(ResetScope::Process);
    let page_size = *PAGESIZE;
    let mut first = vec![0u8; 4 * page_size];
    let mut second = vec![0u8; 4 * page_size];
    let a = unaligned_region(&mut first, 0);
    let b = unaligned_region(&mut second, 0);

    unsafe { harness.manager.add_memory(1, a, 2 * page_size).unwrap() };
    harness.write(a, page_size + 1, 1);

    // Registering the second region clears every write-watch bit.
    unsafe { harness.manager.add_memory(2, b, 2 * page_size).unwrap() };
    harness.write(b, 0, 2);

    assert_eq!(drain(&harness.manager, 1), vec![(page_size, page_size)]);
    // Harvested by the first drain before the backend was reset again.
    assert_eq!(drain(&harness.manager, 2), vec![(0, page_size)]);
    assert!(drain(&harness.manager, 1).is_empty());
    assert!(drain(&harness.manager, 2).is_empty());
}

#[test]
fn process_wide_reset_harvests_other_managers() {
    let first = Harness::new(ResetScope::Process);
    let second = first.sharing(ResetScope::Process);
    let page_size = *PAGESIZE;
    let mut first_backing = vec![0u8; 4 * page_size];
    let mut second_backing = vec![0u8; 4 * page_size];
    let a = unaligned_region(&mut first_backing, 0);
    let b = unaligned_region(&mut second_backing, 0);

    unsafe { first.manager.add_memory(1, a, 2 * page_size).unwrap() };
    first.write(a, 1, 1);

    // Registering with the other manager resets the shared bits.
    unsafe { second.manager.add_memory(2, b, 2 * page_size).unwrap() };
    second.write(b, page_size, 2);

    // Draining the other manager resets them again.
    assert_eq!(drain(&second.manager, 2), vec![(page_size, page_size)]);
    assert!(first.written.lock().is_empty());

    assert_eq!(drain(&first.manager, 1), vec![(0, page_size)]);
    assert!(drain(&first.manager, 1).is_empty());
    assert!(drain(&second.manager, 2).is_empty());

    drop(second);
    first.write(a, page_size, 3);
    assert_eq!(drain(&first.manager, 1), vec![(page_size, page_size)]);
}

#[test]
fn missing_backend_reports_whole_region() {
    setup();

    let manager = PageGuardManager::with_backends(
        PageGuardConfigBuilder::direct().build().unwrap(),
        default_fault_source(),
        WriteWatchType::None.build(),
    );
    let mut backing = vec![0u8; 3000];

    unsafe { manager.add_memory(1, ptr_of(&mut backing), 3000).unwrap() };

    let ranges = drain(&manager, 1);
    assert_eq!(ranges.iter().map(|(_, len)| len).sum::<usize>(), 3000);
    assert_eq!(ranges.first().map(|(offset, _)| *offset), Some(0));

    // No way to tell clean from dirty, so every drain reports everything.
    assert_eq!(drain(&manager, 1), ranges);
    assert!(!manager.is_fault_handler_installed());
}
