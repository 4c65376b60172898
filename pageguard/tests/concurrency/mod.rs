use std::{
    ptr::NonNull,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use pageguard::{PageGuardConfig, PageGuardManager};
use rand::Rng;

use crate::common::{drain, ptr_of, setup, write_byte};

const NR_THREADS: usize = 4;
const NR_PAGES: usize = 16;

#[test]
fn disjoint_regions_on_many_threads() {
    setup();

    let manager = Arc::new(PageGuardManager::new(PageGuardConfig::default()));
    let page_size = manager.page_size();

    let handles = (0..NR_THREADS)
        .map(|i| {
            let manager = manager.clone();

            thread::spawn(move || {
                let memory_id = i as u64;
                let mut backing = vec![0u8; NR_PAGES * page_size];
                let mut expected = backing.clone();
                let mut rng = rand::thread_rng();

                let shadow = unsafe {
                    manager
                        .add_memory(memory_id, ptr_of(&mut backing), backing.len())
                        .unwrap()
                };

                for round in 1..=20u8 {
                    for _ in 0..32 {
                        let offset = rng.gen_range(0..backing.len());
                        write_byte(shadow, offset, round);
                        expected[offset] = round;
                    }

                    drain(&manager, memory_id);
                    assert_eq!(backing, expected);
                }

                manager.remove_memory(memory_id);
            })
        })
        .collect::<Vec<_>>();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(manager.nr_regions(), 0);
    assert!(!manager.is_fault_handler_installed());
}

#[test]
fn writes_racing_with_drains_are_not_lost() {
    setup();

    let manager = Arc::new(PageGuardManager::new(PageGuardConfig::default()));
    let page_size = manager.page_size();
    let mut backing = vec![0u8; NR_PAGES * page_size];

    let shadow = unsafe { manager.add_memory(1, ptr_of(&mut backing), backing.len()).unwrap() };
    // Raw pointers are not `Send`.
    let shadow_address = shadow.as_ptr() as usize;
    let stop = Arc::new(AtomicBool::new(false));

    let writers = (0..NR_THREADS)
        .map(|i| {
            thread::spawn(move || {
                let shadow = NonNull::new(shadow_address as *mut u8).unwrap();
                let mut rng = rand::thread_rng();

                for round in 0..2000usize {
                    // Each writer owns every NR_THREADS-th byte.
                    let page = rng.gen_range(0..NR_PAGES);
                    let offset = page * page_size + i + NR_THREADS * (round % 64);
                    write_byte(shadow, offset, (round % 251) as u8 + 1);
                }
            })
        })
        .collect::<Vec<_>>();

    let drainer = {
        let manager = manager.clone();
        let stop = stop.clone();

        thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                drain(&manager, 1);
            }
        })
    };

    for writer in writers {
        writer.join().unwrap();
    }
    stop.store(true, Ordering::Relaxed);
    drainer.join().unwrap();

    drain(&manager, 1);

    let shadow_contents = unsafe {
        pageguard::protection::protect(shadow, backing.len(), pageguard::protection::Protection::ReadOnly)
            .unwrap();
        std::slice::from_raw_parts(shadow.as_ptr(), backing.len()).to_vec()
    };
    assert_eq!(backing, shadow_contents);

    manager.remove_memory(1);
}
