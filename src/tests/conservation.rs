use super::*;
use crate::util::test_util::fixtures::*;
use crate::vm::object_model;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

const SLOTS: usize = 128;

/// Random allocation, linking and dropping under mark-sweep. After every
/// collection the allocator accounts for exactly the reachable objects,
/// rounded up to their cells, and no unreachable object is left.
#[test]
fn accounting_matches_live_objects() {
    let heap = test_heap(CollectorSelector::MarkSweep, 2048, "");
    let thread = heap.bind_mutator().unwrap();
    let roots = Roots::new(&heap, SLOTS);
    let mut rng = ChaCha8Rng::seed_from_u64(42);

    for round in 0..4000 {
        let slot = rng.random_range(0..SLOTS);
        match rng.random_range(0..10) {
            0..=3 => {
                let node = heap.alloc_object(&thread, &NODE).unwrap();
                roots.set(slot, node);
            }
            4..=5 => {
                let pair = heap.alloc_object(&thread, &PAIR).unwrap();
                heap.write_field(&thread, pair, 1, roots.get(rng.random_range(0..SLOTS)));
                heap.write_field(&thread, pair, 3, roots.get(rng.random_range(0..SLOTS)));
                roots.set(slot, pair);
            }
            6 => {
                // Now and then larger than a page.
                let len = if rng.random_bool(0.1) { 10000 } else { rng.random_range(0..600) };
                roots.set(slot, heap.alloc_vector(&thread, &VECTOR_BYTES, len).unwrap());
            }
            7..=8 => roots.set(slot, ObjectReference::NULL),
            _ => {
                heap.collect(Some(&thread), 0);
                check(&heap, &roots);
            }
        }
        if round % 500 == 499 {
            heap.collect(Some(&thread), 0);
            check(&heap, &roots);
        }
    }
    (0..SLOTS).for_each(|i| roots.set(i, ObjectReference::NULL));
    heap.collect(Some(&thread), 0);
    assert_eq!(heap.allocated_bytes(), 0);
    heap.destroy_mutator(&thread);
}

fn check(heap: &Heap, roots: &Roots) {
    let root_values: Vec<ObjectReference> = (0..SLOTS).map(|i| roots.get(i)).collect();
    let live = reachable(&root_values);
    let expected: usize = live.iter().map(|o| accounted_bytes(object_model::size(*o))).sum();
    assert_eq!(heap.allocated_bytes(), expected);
    let objects = all_objects(heap);
    assert_eq!(objects.len(), live.len());
    assert!(objects.iter().all(|o| live.contains(o)));
}
