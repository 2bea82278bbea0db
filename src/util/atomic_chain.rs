//! An intrusive lock-free stack of raw memory blocks.
//!
//! A node is any word-aligned address whose first word may be used as the link.
//! Segregated pages link through their page header, free cells through their
//! first word and gray objects through their pre-header word, so one type serves
//! all three.
//!
//! Only pushes use compare-and-swap. Consumers remove the whole chain at once
//! with [`AtomicChain::take_all`], which cannot suffer from ABA: a node that has
//! been stolen is owned by the thief and is never observed half-unlinked.

use crate::util::Address;
use crossbeam::utils::Backoff;
use std::sync::atomic::{AtomicUsize, Ordering};

/// The head word of a chain. Shared chains are wrapped in
/// [`crossbeam::utils::CachePadded`] by their owners; the one embedded in a
/// page header is not.
#[repr(transparent)]
pub struct AtomicChain {
    head: AtomicUsize,
}

impl AtomicChain {
    pub const fn new() -> Self {
        AtomicChain {
            head: AtomicUsize::new(0),
        }
    }

    /// The link word stored in `node`.
    ///
    /// # Safety
    /// `node` must be a live node of a chain the caller may read.
    pub unsafe fn next_of(node: Address) -> Address {
        Address::from_usize(node.atomic_load::<AtomicUsize>(Ordering::Acquire))
    }

    /// Overwrite the link word stored in `node`.
    ///
    /// # Safety
    /// `node` must be owned by the caller.
    pub unsafe fn set_next(node: Address, next: Address) {
        node.atomic_store::<AtomicUsize>(next.as_usize(), Ordering::Release)
    }

    /// Push a single node.
    ///
    /// # Safety
    /// `node` must be owned by the caller and not be on any chain.
    pub unsafe fn push(&self, node: Address) {
        self.push_chain(node, node)
    }

    /// Push an already linked chain `first ..= last` in one step.
    ///
    /// # Safety
    /// The chain must be owned by the caller and `last` must be reachable from `first`.
    pub unsafe fn push_chain(&self, first: Address, last: Address) {
        debug_assert!(!first.is_zero() && !last.is_zero());
        let backoff = Backoff::new();
        let mut old = self.head.load(Ordering::Relaxed);
        loop {
            Self::set_next(last, Address::from_usize(old));
            match self.head.compare_exchange_weak(
                old,
                first.as_usize(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(current) => {
                    old = current;
                    backoff.spin();
                }
            }
        }
    }

    /// Detach the whole chain. The caller owns every node reachable from the result.
    pub fn take_all(&self) -> Address {
        unsafe { Address::from_usize(self.head.swap(0, Ordering::AcqRel)) }
    }

    /// Remove one node: steal everything, keep the first node and push the rest back.
    pub fn pop(&self) -> Option<Address> {
        let first = self.take_all();
        if first.is_zero() {
            return None;
        }
        unsafe {
            let rest = Self::next_of(first);
            if !rest.is_zero() {
                let mut last = rest;
                loop {
                    let next = Self::next_of(last);
                    if next.is_zero() {
                        break;
                    }
                    last = next;
                }
                self.push_chain(rest, last);
            }
            Self::set_next(first, Address::ZERO);
        }
        Some(first)
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == 0
    }

    /// The current head, for diagnostics.
    pub fn peek(&self) -> Address {
        unsafe { Address::from_usize(self.head.load(Ordering::Acquire)) }
    }
}

impl Default for AtomicChain {
    fn default() -> Self {
        Self::new()
    }
}

/// Walks a detached chain.
pub struct ChainIter {
    cursor: Address,
}

impl ChainIter {
    /// # Safety
    /// The chain starting at `first` must not be modified while it is walked.
    pub unsafe fn new(first: Address) -> Self {
        ChainIter { cursor: first }
    }
}

impl Iterator for ChainIter {
    type Item = Address;

    fn next(&mut self) -> Option<Address> {
        if self.cursor.is_zero() {
            return None;
        }
        let node = self.cursor;
        self.cursor = unsafe { AtomicChain::next_of(node) };
        Some(node)
    }
}
