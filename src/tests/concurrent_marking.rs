use super::*;
use crate::plan::collector::Phase;
use crate::plan::concurrent::ConcurrentMSCollector;
use crate::util::alloc::size_class::{cell_size, size_class};
use crate::util::test_util::fixtures::*;
use crate::util::test_util::panic_after;
use crate::vm::object_model;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;

#[test]
fn overwritten_and_stored_values_are_shaded() {
    let heap = test_heap(CollectorSelector::Concurrent, 256, "");
    let thread = heap.bind_mutator().unwrap();
    let roots = Roots::new(&heap, 1);
    let holder = heap.alloc_object(&thread, &NODE).unwrap();
    let a = heap.alloc_object(&thread, &NODE).unwrap();
    let b = heap.alloc_object(&thread, &NODE).unwrap();
    roots.set(0, holder);
    heap.write_field(&thread, holder, 1, a);

    let marks = heap
        .collector_as::<ConcurrentMSCollector>()
        .unwrap()
        .mark_state();
    marks.start_cycle();
    marks.set_phase(Phase::Tracing);
    // The sole reference to `a` is replaced by one to `b`, which only the
    // mutator holds.
    heap.write_field(&thread, holder, 1, b);
    assert!(marks.is_live(a));
    assert!(marks.is_live(b));
    assert!(!marks.is_live(holder));
    let mut gray = thread.gray_queue.take_all();
    gray.sort();
    let mut expected = vec![a, b];
    expected.sort();
    assert_eq!(gray, expected);

    // Shading is idempotent.
    heap.write_field(&thread, holder, 1, a);
    assert!(thread.gray_queue.is_empty());
    marks.set_phase(Phase::Idle);
    heap.destroy_mutator(&thread);
}

#[test]
fn overwrite_during_tracing_keeps_both_values() {
    panic_after(60000, || {
        let heap = test_heap(CollectorSelector::Concurrent, 256, "");
        let thread = heap.bind_mutator().unwrap();
        let roots = Roots::new(&heap, 2);
        let holder = heap.alloc_object(&thread, &PAIR).unwrap();
        let a = heap.alloc_object(&thread, &NODE).unwrap();
        let b = heap.alloc_object(&thread, &NODE).unwrap();
        roots.set(0, holder);
        roots.set(1, b);
        heap.write_field(&thread, holder, 1, a);

        let collector = heap.collector_as::<ConcurrentMSCollector>().unwrap();
        let cycle = collector.request_cycle();
        // The trace cannot finish without a handshake from this thread, so
        // the store below lands while the markers are tracing.
        loop {
            heap.check_for_needed_gc_work(&thread);
            if collector.mark_state().phase() == Phase::Tracing {
                break;
            }
            std::thread::yield_now();
        }
        heap.write_field(&thread, holder, 1, b);
        roots.set(1, ObjectReference::NULL);
        collector.wait_for_cycle(Some(&thread), cycle);

        let objects = all_objects(&heap);
        assert!(objects.contains(&a), "{} was swept while shaded", a);
        assert!(objects.contains(&b), "{} was swept while shaded", b);
        assert_eq!(field(holder, 1), b);
        heap.verify_heap();

        // Nothing shades `a` in the next cycle.
        heap.collect(Some(&thread), 0);
        let objects = all_objects(&heap);
        assert!(!objects.contains(&a));
        assert!(objects.contains(&b));
        heap.destroy_mutator(&thread);
    })
}

#[test]
fn verify_heap_holds_across_color_rotations() {
    let heap = test_heap(CollectorSelector::Concurrent, 256, "");
    let thread = heap.bind_mutator().unwrap();
    let roots = Roots::new(&heap, 1);
    let object = heap.alloc_object(&thread, &NODE).unwrap();
    roots.set(0, object);
    heap.destroy_mutator(&thread);

    let marks = heap
        .collector_as::<ConcurrentMSCollector>()
        .unwrap()
        .mark_state();
    let mut colors = std::collections::HashSet::new();
    // Every color comes round once in three cycles.
    for _ in 0..4 {
        heap.collect(None, 0);
        heap.verify_heap();
        assert_eq!(roots.get(0), object);
        assert!(!object_model::is_forwarded(object));
        colors.insert(object_model::color(object));
        assert_eq!(object_model::color(object), marks.unmarked());
        assert_eq!(heap.allocated_bytes(), cell_size(size_class(NODE.instance_size(0))));
    }
    assert_eq!(colors.len(), 3);
}

#[test]
fn weak_loads_are_shaded_while_snooping() {
    let heap = test_heap(CollectorSelector::Concurrent, 256, "");
    let thread = heap.bind_mutator().unwrap();
    let object = heap.alloc_object(&thread, &NODE).unwrap();
    let handle = heap.new_weak_handle(object, crate::plan::WeakKind::Short);
    let marks = heap
        .collector_as::<ConcurrentMSCollector>()
        .unwrap()
        .mark_state();
    marks.start_cycle();
    marks.set_phase(Phase::ComputingRoots);
    assert_eq!(heap.load_weak(&thread, &handle), object);
    assert!(marks.is_live(object));
    assert_eq!(thread.gray_queue.take_all(), vec![object]);
    marks.set_phase(Phase::Idle);
    heap.destroy_mutator(&thread);
}

const RING: usize = 64;

/// Rewire a ring of chains of pairs, rooted in a static vector, while
/// cycles run.
fn mutate(heap: &Heap, roots: &Roots, index: usize, seed: u64, rounds: usize) {
    let thread = heap.bind_mutator().unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let ring = heap.alloc_vector(&thread, &REFS, RING).unwrap();
    roots.set(index, ring);
    for round in 0..rounds {
        let i = rng.random_range(0..RING);
        let slot = object_model::element_address(ring, i);
        let pair = heap.alloc_object(&thread, &PAIR).unwrap();
        unsafe { object_model::field_address(pair, 2).store(round) };
        if rng.random_range(0..8) != 0 {
            let previous = object_model::load_reference(slot);
            heap.write_field(&thread, pair, 1, previous);
        }
        heap.write_barrier().write_reference(&thread, slot, pair);
        if round % 16 == 0 {
            heap.check_for_needed_gc_work(&thread);
        }
    }
    heap.destroy_mutator(&thread);
}

/// Every chain hanging off the ring is made of intact pairs.
fn check_ring(ring: ObjectReference) -> usize {
    assert_eq!(object_model::type_descriptor(ring).name, REFS.name);
    let mut pairs = 0;
    for i in 0..object_model::length(ring) {
        let mut next = object_model::load_reference(object_model::element_address(ring, i));
        while !next.is_null() {
            assert_eq!(object_model::type_descriptor(next).name, PAIR.name);
            pairs += 1;
            next = field(next, 1);
        }
    }
    pairs
}

#[test]
fn mutators_run_during_cycles() {
    panic_after(120000, || {
        let heap = Arc::new(test_heap(
            CollectorSelector::Concurrent,
            2048,
            "concurrent_trigger_bytes=65536 concurrent_marker_threads=2",
        ));
        let roots = Arc::new(Roots::new(&heap, 2));
        let mutators: Vec<_> = (0..2)
            .map(|i| {
                let (heap, roots) = (heap.clone(), roots.clone());
                std::thread::spawn(move || mutate(&heap, &roots, i, i as u64 + 7, 20000))
            })
            .collect();
        for m in mutators {
            m.join().unwrap();
        }
        let collector = heap.collector_as::<ConcurrentMSCollector>().unwrap();
        assert!(collector.cycles() > 0, "the trigger never fired");

        heap.collect(None, 0);
        heap.verify_heap();
        let pairs: usize = (0..2).map(|i| check_ring(roots.get(i))).sum();
        assert!(pairs > 0);
        // The rings and their chains are all that is left.
        let cell = |bytes: usize| cell_size(size_class(bytes));
        let expected = 2 * cell(REFS.instance_size(RING)) + pairs * cell(PAIR.instance_size(0));
        assert_eq!(heap.allocated_bytes(), expected);
    })
}
