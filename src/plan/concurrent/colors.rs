//! Mark colors of the concurrent collector.
//!
//! The GC bits of a type word hold one of three colors. Which of them means
//! *marked*, *unmarked* and *reclaim* rotates at the end of every marking
//! cycle: marked objects become unmarked for the next cycle, unmarked objects
//! become the garbage the sweeper frees, and the color the sweeper has already
//! freed becomes the new marked color. No object has to be recolored to start
//! a cycle.

use crate::plan::collector::Phase;
use crate::plan::concurrent::thread_header_queue::ThreadHeaderQueue;
use crate::util::ObjectReference;
use crate::vm::object_model;
use atomic::Atomic;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Marking state shared by the collector threads and the write barrier.
pub struct MarkState {
    phase: Atomic<Phase>,
    marked: AtomicUsize,
    unmarked: AtomicUsize,
    reclaim: AtomicUsize,
    alloc_color: AtomicUsize,
}

impl MarkState {
    pub fn new() -> Self {
        MarkState {
            phase: Atomic::new(Phase::Idle),
            marked: AtomicUsize::new(2),
            unmarked: AtomicUsize::new(1),
            reclaim: AtomicUsize::new(3),
            alloc_color: AtomicUsize::new(1),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase.load(Ordering::SeqCst)
    }

    pub fn set_phase(&self, phase: Phase) {
        debug!("marking phase {:?} -> {:?}", self.phase(), phase);
        self.phase.store(phase, Ordering::SeqCst)
    }

    /// The barrier must report overwritten and stored values.
    pub fn is_snooping(&self) -> bool {
        self.phase().is_snooping()
    }

    pub fn marked(&self) -> usize {
        self.marked.load(Ordering::SeqCst)
    }

    pub fn unmarked(&self) -> usize {
        self.unmarked.load(Ordering::SeqCst)
    }

    pub fn reclaim(&self) -> usize {
        self.reclaim.load(Ordering::SeqCst)
    }

    /// The color of new objects.
    pub fn alloc_color(&self) -> usize {
        self.alloc_color.load(Ordering::SeqCst)
    }

    /// New objects are born marked until the cycle ends.
    pub fn start_cycle(&self) {
        self.alloc_color.store(self.marked(), Ordering::SeqCst)
    }

    /// Advance the colors at the end of a marking cycle. The sweep of the
    /// previous reclaim color must be complete.
    pub fn rotate(&self) {
        let (m, u, r) = (self.marked(), self.unmarked(), self.reclaim());
        self.marked.store(r, Ordering::SeqCst);
        self.unmarked.store(m, Ordering::SeqCst);
        self.reclaim.store(u, Ordering::SeqCst);
        // Same value as the marked color new objects got during the cycle.
        self.alloc_color.store(m, Ordering::SeqCst);
        debug!("colors rotated: marked {}, unmarked {}, reclaim {}", r, m, u);
    }

    /// Whether `object` has survived this cycle so far.
    pub fn is_live(&self, object: ObjectReference) -> bool {
        object_model::color(object) != self.unmarked()
    }

    /// Recolor an unmarked object. Returns true if this call did it; the
    /// caller then owns the object's scan.
    pub fn try_shade(&self, object: ObjectReference) -> bool {
        object_model::compare_exchange_color(object, self.unmarked(), self.marked())
    }

    /// Mark an unmarked object gray: recolor it and queue it for scanning.
    /// Returns true if this call did it.
    pub fn shade(&self, object: ObjectReference, queue: &ThreadHeaderQueue) -> bool {
        if self.try_shade(object) {
            queue.push(object);
            true
        } else {
            false
        }
    }
}

impl Default for MarkState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::fixtures::*;
    use crate::util::Address;
    use crate::vm::object_model;

    #[test]
    fn rotation_cycles_through_all_colors() {
        let state = MarkState::new();
        let mut seen = vec![];
        for _ in 0..3 {
            seen.push((state.marked(), state.unmarked(), state.reclaim()));
            state.start_cycle();
            assert_eq!(state.alloc_color(), state.marked());
            state.rotate();
            assert_eq!(state.alloc_color(), state.unmarked());
        }
        assert_eq!(seen, vec![(2, 1, 3), (3, 2, 1), (1, 3, 2)]);
        assert_eq!((state.marked(), state.unmarked(), state.reclaim()), (2, 1, 3));
    }

    #[test]
    fn shade_once() {
        let mut storage = [0usize; 4];
        let start = Address::from_mut_ptr(storage.as_mut_ptr());
        let object = init_node(start);
        let state = MarkState::new();
        object_model::HeaderWord::of(object).set_gc_bits(state.alloc_color());
        let queue = ThreadHeaderQueue::new();
        assert!(!state.is_live(object));
        assert!(state.shade(object, &queue));
        assert!(!state.shade(object, &queue));
        assert!(state.is_live(object));
        assert_eq!(queue.pop(), Some(object));
        assert!(queue.pop().is_none());
    }
}
