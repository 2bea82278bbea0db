//! One byte per 512-byte card of the heap reservation. A card is dirtied by
//! every reference store into it; a generational collection scans the objects
//! overlapping dirty cards instead of a remembered set.

use crate::util::Address;
use std::sync::atomic::{AtomicU8, Ordering};

pub const LOG_BYTES_IN_CARD: usize = 9;
pub const BYTES_IN_CARD: usize = 1 << LOG_BYTES_IN_CARD;

const CLEAN: u8 = 0;
const DIRTY: u8 = 1;

pub struct CardTable {
    base: Address,
    cards: Vec<AtomicU8>,
}

impl CardTable {
    /// Cards covering `bytes` bytes from `base`.
    pub fn new(base: Address, bytes: usize) -> Self {
        let count = (bytes + BYTES_IN_CARD - 1) >> LOG_BYTES_IN_CARD;
        CardTable {
            base,
            cards: (0..count).map(|_| AtomicU8::new(CLEAN)).collect(),
        }
    }

    fn index(&self, addr: Address) -> Option<usize> {
        if addr < self.base {
            return None;
        }
        let index = (addr - self.base) >> LOG_BYTES_IN_CARD;
        (index < self.cards.len()).then_some(index)
    }

    pub fn card_start(&self, addr: Address) -> Address {
        addr.align_down(BYTES_IN_CARD)
    }

    /// Dirty the card of `addr`. Addresses outside the table are ignored.
    pub fn dirty(&self, addr: Address) {
        if let Some(i) = self.index(addr) {
            // Most stores hit a dirty card; skip the write then.
            if self.cards[i].load(Ordering::Relaxed) != DIRTY {
                self.cards[i].store(DIRTY, Ordering::Relaxed);
            }
        }
    }

    pub fn is_dirty(&self, addr: Address) -> bool {
        self.index(addr)
            .map_or(false, |i| self.cards[i].load(Ordering::Relaxed) == DIRTY)
    }

    /// Whether any card overlapping `[start, end)` is dirty.
    pub fn any_dirty(&self, start: Address, end: Address) -> bool {
        let mut card = self.card_start(start);
        while card < end {
            if self.is_dirty(card) {
                return true;
            }
            card += BYTES_IN_CARD;
        }
        false
    }

    /// Clean every card and return the start addresses of the dirty ones, in
    /// address order.
    pub fn take_dirty(&self) -> Vec<Address> {
        self.cards
            .iter()
            .enumerate()
            .filter(|(_, c)| c.swap(CLEAN, Ordering::Relaxed) == DIRTY)
            .map(|(i, _)| self.base + (i << LOG_BYTES_IN_CARD))
            .collect()
    }

    pub fn dirty_count(&self) -> usize {
        self.cards
            .iter()
            .filter(|c| c.load(Ordering::Relaxed) == DIRTY)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dirty_and_take() {
        let base = unsafe { Address::from_usize(0x10000) };
        let table = CardTable::new(base, 16 * BYTES_IN_CARD);
        table.dirty(base + 3 * BYTES_IN_CARD + 8usize);
        table.dirty(base + 3 * BYTES_IN_CARD + 16usize);
        table.dirty(base + 7 * BYTES_IN_CARD);
        // outside the table
        table.dirty(base + 16 * BYTES_IN_CARD);
        assert_eq!(table.dirty_count(), 2);
        assert!(table.any_dirty(base + 2 * BYTES_IN_CARD, base + 3 * BYTES_IN_CARD + 1usize));
        assert!(!table.any_dirty(base, base + 3 * BYTES_IN_CARD));
        assert_eq!(
            table.take_dirty(),
            vec![base + 3 * BYTES_IN_CARD, base + 7 * BYTES_IN_CARD]
        );
        assert_eq!(table.dirty_count(), 0);
    }
}
