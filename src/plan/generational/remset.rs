//! The remembered set: heap slots of older generations that may point into
//! younger ones.

use crate::util::Address;
use std::sync::{Mutex, MutexGuard};

/// Slots recorded by the store buffers of the mutators and by the collector.
/// A slot may be recorded many times; [`RememberedSet::take`] hands each out once.
#[derive(Default)]
pub struct RememberedSet {
    slots: Mutex<Vec<Address>>,
}

impl RememberedSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Address>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record(&self, slot: Address) {
        self.lock().push(slot)
    }

    /// Move the contents of a store buffer into the set.
    pub fn add_all(&self, buffer: &mut Vec<Address>) {
        if buffer.is_empty() {
            return;
        }
        trace!("remembered set takes {} slots", buffer.len());
        self.lock().append(buffer)
    }

    /// Empty the set. The slots come out sorted and without duplicates.
    pub fn take(&self) -> Vec<Address> {
        let mut slots = std::mem::take(&mut *self.lock());
        slots.sort_unstable();
        slots.dedup();
        slots
    }

    /// A copy of the recorded slots.
    pub fn slots(&self) -> Vec<Address> {
        self.lock().clone()
    }

    /// Recorded slots, duplicates included.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
