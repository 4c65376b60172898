use pageguard::{statistics::as_text, PageGuardConfig, PageGuardConfigBuilder, PageGuardManager};
use rand::Rng;

use crate::common::{drain, ptr_of, read_byte, setup, write_byte};

#[test]
fn single_write_reports_containing_page() {
    setup();

    let manager = PageGuardManager::new(PageGuardConfig::default());
    let page_size = manager.page_size();
    let mut backing = vec![0u8; 10000];

    let shadow = unsafe { manager.add_memory(1, ptr_of(&mut backing), 10000).unwrap() };
    assert_ne!(shadow, ptr_of(&mut backing));
    assert_eq!(manager.get_memory(1), Some(shadow));

    write_byte(shadow, 5000, 0xab);

    let page_start = 5000 / page_size * page_size;
    let page_len = page_size.min(10000 - page_start);
    assert_eq!(drain(&manager, 1), vec![(page_start, page_len)]);
    assert_eq!(backing[5000], 0xab);

    // Nothing was written since the last drain.
    assert!(drain(&manager, 1).is_empty());

    manager.remove_memory(1);
}

#[test]
fn partial_last_page_is_trimmed() {
    setup();

    let manager = PageGuardManager::new(PageGuardConfig::default());
    let page_size = manager.page_size();
    let size = 2 * page_size + 100;
    let mut backing = vec![0u8; size];

    let shadow = unsafe { manager.add_memory(1, ptr_of(&mut backing), size).unwrap() };
    write_byte(shadow, size - 1, 7);

    assert_eq!(drain(&manager, 1), vec![(2 * page_size, 100)]);
    assert_eq!(backing[size - 1], 7);
}

#[test]
fn separated_pages_are_separate_ranges() {
    setup();

    let manager = PageGuardManager::new(PageGuardConfig::default());
    let page_size = manager.page_size();
    let mut backing = vec![0u8; 6 * page_size];

    let shadow = unsafe { manager.add_memory(1, ptr_of(&mut backing), backing.len()).unwrap() };

    write_byte(shadow, page_size, 1);
    write_byte(shadow, 2 * page_size + 3, 2);
    write_byte(shadow, 4 * page_size + 5, 3);

    assert_eq!(
        drain(&manager, 1),
        vec![(page_size, 2 * page_size), (4 * page_size, page_size)]
    );
    assert_eq!(backing[page_size], 1);
    assert_eq!(backing[2 * page_size + 3], 2);
    assert_eq!(backing[4 * page_size + 5], 3);
}

#[test]
fn random_writes_round_trip() {
    setup();

    let manager = PageGuardManager::new(PageGuardConfig::default());
    let size = 64 * manager.page_size() + 123;
    let mut backing = vec![0u8; size];
    let mut expected = backing.clone();

    let shadow = unsafe { manager.add_memory(9, ptr_of(&mut backing), size).unwrap() };
    let mut rng = rand::thread_rng();

    for round in 0..5u8 {
        for _ in 0..200 {
            let offset = rng.gen_range(0..size);
            write_byte(shadow, offset, round + 1);
            expected[offset] = round + 1;
        }

        let mut covered = vec![false; size];
        manager
            .process_memory_entry(9, |range| {
                let data = unsafe { range.as_slice() };
                assert_eq!(data, &expected[range.offset..range.offset + range.len]);
                covered[range.offset..range.offset + range.len].fill(true);
            })
            .unwrap();

        assert_eq!(backing, expected);
        assert!(expected
            .iter()
            .zip(&covered)
            .all(|(&value, &covered)| value != round + 1 || covered));
    }

    let snapshot = manager.statistics().snapshot();
    assert!(snapshot.faults > 0);
    assert_eq!(snapshot.drains, 5);
    assert!(as_text(&manager).contains("page_guard.faults="));
}

#[test]
fn existing_contents_are_copied_on_map() {
    setup();

    let manager = PageGuardManager::new(PageGuardConfig::default());
    let page_size = manager.page_size();
    let mut backing: Vec<u8> = (0..2 * page_size).map(|i| i as u8).collect();

    let shadow = unsafe { manager.add_memory(1, ptr_of(&mut backing), backing.len()).unwrap() };

    assert_eq!(read_byte(shadow, page_size + 17), (page_size + 17) as u8);

    // A read without separate read tracking counts as a write.
    assert_eq!(drain(&manager, 1), vec![(page_size, page_size)]);
}

#[test]
fn lazy_copy_loads_on_first_touch() {
    setup();

    let config = PageGuardConfigBuilder::default()
        .enable_lazy_copy(true)
        .build()
        .unwrap();
    let manager = PageGuardManager::new(config);
    let page_size = manager.page_size();
    let mut backing = vec![0x5au8; 3 * page_size];

    let shadow = unsafe { manager.add_memory(1, ptr_of(&mut backing), backing.len()).unwrap() };

    write_byte(shadow, page_size, 0x11);
    assert!(manager.page_status(1, 1).unwrap().block_loaded);
    assert!(!manager.page_status(1, 2).unwrap().block_loaded);

    assert_eq!(read_byte(shadow, page_size + 1), 0x5a);
    assert_eq!(read_byte(shadow, 2 * page_size), 0x5a);

    drain(&manager, 1);

    assert_eq!(backing[page_size], 0x11);
    assert!(backing[page_size + 1..].iter().all(|&b| b == 0x5a));
    assert!(backing[..page_size].iter().all(|&b| b == 0x5a));
}

#[test]
fn without_copy_on_map_shadow_starts_zeroed() {
    setup();

    let config = PageGuardConfigBuilder::default()
        .enable_copy_on_map(false)
        .build()
        .unwrap();
    let manager = PageGuardManager::new(config);
    let page_size = manager.page_size();
    let mut backing = vec![0xffu8; page_size];

    let shadow = unsafe { manager.add_memory(1, ptr_of(&mut backing), page_size).unwrap() };
    write_byte(shadow, 10, 1);

    assert_eq!(drain(&manager, 1), vec![(0, page_size)]);
    assert_eq!(backing[10], 1);
    assert_eq!(backing[11], 0);
}

#[test]
fn drain_all_visits_every_region() {
    setup();

    let manager = PageGuardManager::new(PageGuardConfig::default());
    let page_size = manager.page_size();
    let mut first = vec![0u8; 2 * page_size];
    let mut second = vec![0u8; 2 * page_size];
    let mut untouched = vec![0u8; page_size];

    let (a, b) = unsafe {
        let a = manager.add_memory(10, ptr_of(&mut first), first.len()).unwrap();
        let b = manager.add_memory(20, ptr_of(&mut second), second.len()).unwrap();
        manager.add_memory(30, ptr_of(&mut untouched), page_size).unwrap();
        (a, b)
    };

    write_byte(a, 0, 1);
    write_byte(b, page_size, 2);

    let mut ranges = Vec::new();
    manager
        .process_memory_entries(|range| ranges.push((range.memory_id, range.offset, range.len)))
        .unwrap();
    ranges.sort();

    assert_eq!(ranges, vec![(10, 0, page_size), (20, page_size, page_size)]);
    assert_eq!(first[0], 1);
    assert_eq!(second[page_size], 2);
    assert_eq!(manager.nr_regions(), 3);
}
