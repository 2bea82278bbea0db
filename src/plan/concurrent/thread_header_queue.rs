//! A per-thread queue of gray objects, linked through the objects' pre-header words.
//!
//! Any thread may push (a mutator shading through its barrier, a collector
//! scanning a dormant thread's stack). Markers steal the whole chain at once
//! and then pop from their own queue. An object is pushed at most once per
//! cycle (the push follows a successful recoloring), so a stolen chain never
//! sees a node come back while it is walked.

use crate::util::atomic_chain::{AtomicChain, ChainIter};
use crate::util::{Address, ObjectReference};
use crate::vm::object_model;
use crossbeam::utils::CachePadded;

pub struct ThreadHeaderQueue {
    head: CachePadded<AtomicChain>,
}

impl ThreadHeaderQueue {
    pub const fn new() -> Self {
        ThreadHeaderQueue {
            head: CachePadded::new(AtomicChain::new()),
        }
    }

    /// Push a gray object. Its pre-header must not be linked on any queue.
    pub fn push(&self, object: ObjectReference) {
        debug_assert!(object_model::link(object).is_zero());
        unsafe { self.head.push(object_model::link_address(object)) }
    }

    /// Remove one object.
    pub fn pop(&self) -> Option<ObjectReference> {
        let node = self.head.pop()?;
        Some(ObjectReference::from_object_start(node))
    }

    /// Move everything queued on `victim` to this queue. Returns false if
    /// there was nothing to take.
    pub fn steal_from(&self, victim: &ThreadHeaderQueue) -> bool {
        let first = victim.head.take_all();
        if first.is_zero() {
            return false;
        }
        let last = unsafe { ChainIter::new(first) }
            .last()
            .unwrap_or(first);
        unsafe { self.head.push_chain(first, last) };
        true
    }

    /// Detach every queued object, clearing their links.
    pub fn take_all(&self) -> Vec<ObjectReference> {
        let first = self.head.take_all();
        let nodes: Vec<Address> = unsafe { ChainIter::new(first) }.collect();
        nodes
            .into_iter()
            .map(|node| {
                let object = ObjectReference::from_object_start(node);
                object_model::clear_link(object);
                object
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_empty()
    }

    /// Between cycles every queue must be empty.
    pub fn reset(&self) {
        assert!(
            self.head.is_empty(),
            "gray queue still holds {} at the end of a cycle",
            self.head.peek()
        );
    }
}

impl Default for ThreadHeaderQueue {
    fn default() -> Self {
        Self::new()
    }
}
