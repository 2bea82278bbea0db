//! The index of unused page regions.
//!
//! Every contiguous run of unused pages carries an [`UnusedBlockHeader`] in its
//! first page and a copy in its last page. The tail copy points back at the head
//! (`curr`), so a region freed just above can find the start of its lower
//! neighbour in constant time. Heads are doubly linked into one list per
//! `floor(log2(count))`.

use crate::util::constants::*;
use crate::util::Address;
use std::mem::size_of;

pub const UNUSED_BLOCK_MAGIC: usize = 0x756e_7573_6564_2121;

/// One list per power of two; regions of 2^31 pages and more share the last one.
pub const UNUSED_BUCKETS: usize = 32;

#[repr(C)]
#[derive(Debug)]
pub struct UnusedBlockHeader {
    pub magic: usize,
    pub count: usize,
    pub next: Address,
    pub prev: Address,
    /// The head of the region this header belongs to.
    pub curr: Address,
}

pub const UNUSED_BLOCK_HEADER_BYTES: usize = size_of::<UnusedBlockHeader>();

/// The bucket of a region of `count` pages.
pub const fn slot_from_count(count: usize) -> usize {
    debug_assert!(count > 0);
    let log = (usize::BITS - 1 - count.leading_zeros()) as usize;
    if log < UNUSED_BUCKETS {
        log
    } else {
        UNUSED_BUCKETS - 1
    }
}

/// Read the header stored at `page`, checking its magic.
///
/// # Safety
/// `page` must be the head or tail page of an unused region.
pub unsafe fn header<'a>(page: Address) -> &'a mut UnusedBlockHeader {
    let h = &mut *page.to_mut_ptr::<UnusedBlockHeader>();
    assert!(
        h.magic == UNUSED_BLOCK_MAGIC,
        "unused block header at {} is corrupt (magic {:#x})",
        page,
        h.magic
    );
    h
}

/// Zero the header words at `page`.
///
/// # Safety
/// `page` must be in the heap and not hold anything else.
pub unsafe fn clear_header(page: Address) {
    crate::util::memory::zero(page, UNUSED_BLOCK_HEADER_BYTES);
}

/// Write the head and tail headers of a region. The region is not linked.
///
/// # Safety
/// The pages must be unused and owned by the caller.
pub unsafe fn write_region(head: Address, count: usize) {
    head.store(UnusedBlockHeader {
        magic: UNUSED_BLOCK_MAGIC,
        count,
        next: Address::ZERO,
        prev: Address::ZERO,
        curr: head,
    });
    if count > 1 {
        tail_page(head, count).store(UnusedBlockHeader {
            magic: UNUSED_BLOCK_MAGIC,
            count,
            next: Address::ZERO,
            prev: Address::ZERO,
            curr: head,
        });
    }
}

pub fn tail_page(head: Address, count: usize) -> Address {
    head + ((count - 1) << LOG_BYTES_IN_PAGE)
}

/// The bucketed lists of region heads.
pub struct FreeRegionIndex {
    buckets: [Address; UNUSED_BUCKETS],
}

impl FreeRegionIndex {
    pub const fn new() -> Self {
        FreeRegionIndex {
            buckets: [Address::ZERO; UNUSED_BUCKETS],
        }
    }

    /// # Safety
    /// `head` must hold a fresh header written by [`write_region`].
    pub unsafe fn link(&mut self, head: Address) {
        let h = header(head);
        debug_assert!(h.curr == head);
        let slot = slot_from_count(h.count);
        let first = self.buckets[slot];
        h.prev = Address::ZERO;
        h.next = first;
        if !first.is_zero() {
            header(first).prev = head;
        }
        self.buckets[slot] = head;
    }

    /// # Safety
    /// `head` must be a linked region head.
    pub unsafe fn unlink(&mut self, head: Address) {
        let h = header(head);
        let slot = slot_from_count(h.count);
        if h.prev.is_zero() {
            debug_assert!(self.buckets[slot] == head);
            self.buckets[slot] = h.next;
        } else {
            header(h.prev).next = h.next;
        }
        if !h.next.is_zero() {
            header(h.next).prev = h.prev;
        }
        h.next = Address::ZERO;
        h.prev = Address::ZERO;
    }

    /// The first region with at least `count` pages, scanning buckets from
    /// `slot_from_count(count)` upward.
    pub fn first_fit(&self, count: usize) -> Option<Address> {
        for slot in slot_from_count(count)..UNUSED_BUCKETS {
            let mut cursor = self.buckets[slot];
            while !cursor.is_zero() {
                let h = unsafe { header(cursor) };
                if h.count >= count {
                    return Some(cursor);
                }
                cursor = h.next;
            }
        }
        None
    }

    /// All linked region heads, smallest bucket first.
    pub fn regions(&self) -> Vec<(Address, usize)> {
        let mut out = vec![];
        for &first in &self.buckets {
            let mut cursor = first;
            while !cursor.is_zero() {
                let h = unsafe { header(cursor) };
                out.push((cursor, h.count));
                cursor = h.next;
            }
        }
        out
    }

    /// Check every linked header: magic, bucket, and the tail pointing back at the head.
    pub fn verify(&self) {
        for (slot, &first) in self.buckets.iter().enumerate() {
            let mut prev = Address::ZERO;
            let mut cursor = first;
            while !cursor.is_zero() {
                let h = unsafe { header(cursor) };
                assert_eq!(h.curr, cursor);
                assert_eq!(h.prev, prev);
                assert_eq!(slot_from_count(h.count), slot);
                let tail = unsafe { header(tail_page(cursor, h.count)) };
                assert_eq!(tail.curr, cursor);
                assert_eq!(tail.count, h.count);
                prev = cursor;
                cursor = h.next;
            }
        }
    }
}

impl Default for FreeRegionIndex {
    fn default() -> Self {
        Self::new()
    }
}
