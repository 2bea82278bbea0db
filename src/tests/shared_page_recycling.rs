use crate::util::alloc::{LocalFreeLists, SegregatedFreeList};
use crate::util::constants::*;
use crate::util::heap::PageType;
use crate::util::test_util::fixtures::*;
use crate::util::test_util::panic_after;
use crate::util::Address;
use crate::vm::object_model;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

const PAGES: usize = 512;
const SIZE: usize = 48;

/// Allocate and free random cells of one size class, checking that no cell
/// is handed out twice: each live cell carries a stamp only its owner writes.
fn churn(sfl: &SegregatedFreeList, thread: u16, rounds: usize) {
    let mut rng = ChaCha8Rng::seed_from_u64(thread as u64);
    let mut local = LocalFreeLists::new(thread);
    let mut live: Vec<(Address, usize)> = vec![];
    for round in 0..rounds {
        if live.is_empty() || (live.len() < 400 && rng.random_bool(0.55)) {
            let start = sfl.alloc(&mut local, SIZE).unwrap();
            let object = init_byte_vector(start, SIZE - 3 * BYTES_IN_WORD);
            let stamp = (thread as usize) << 32 | round;
            unsafe { object_model::element_address(object, 0).store(stamp) };
            live.push((start, stamp));
        } else {
            let (start, stamp) = live.swap_remove(rng.random_range(0..live.len()));
            let object = crate::util::ObjectReference::from_object_start(start);
            assert_eq!(unsafe { object_model::element_address(object, 0).load::<usize>() }, stamp);
            sfl.free_object(start);
        }
    }
    for (start, _) in live {
        sfl.free_object(start);
    }
    sfl.flush_local(&mut local);
}

#[test]
fn two_allocators_and_a_recycler() {
    panic_after(60000, || {
        let pages = new_page_manager(PAGES);
        let in_use = pages.in_use_pages();
        let sfl = Arc::new(SegregatedFreeList::new(pages.clone(), PageType::Owner(0)));
        let done = Arc::new(AtomicBool::new(false));
        let recycled = Arc::new(AtomicUsize::new(0));

        let recycler = {
            let (sfl, done, recycled) = (sfl.clone(), done.clone(), recycled.clone());
            std::thread::spawn(move || {
                while !done.load(Ordering::SeqCst) {
                    recycled.fetch_add(sfl.recycle_global_pages(), Ordering::SeqCst);
                    // Wrapped accounting shows up as an absurd total.
                    assert!(sfl.total_bytes() <= PAGES * BYTES_IN_PAGE);
                }
            })
        };
        let workers: Vec<_> = (1..=2)
            .map(|thread| {
                let sfl = sfl.clone();
                std::thread::spawn(move || churn(&sfl, thread, 20000))
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        done.store(true, Ordering::SeqCst);
        recycler.join().unwrap();

        assert_eq!(sfl.total_bytes(), 0);
        sfl.recycle_global_pages();
        pages.verify();
        assert_eq!(pages.in_use_pages(), in_use);
    })
}
