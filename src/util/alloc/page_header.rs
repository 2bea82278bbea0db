//! The header at the start of every segregated free-list page.

use super::size_class::*;
use crate::util::atomic_chain::AtomicChain;
use crate::util::Address;
use std::sync::atomic::{fence, AtomicI32, AtomicUsize, Ordering};

pub const SFL_PAGE_MAGIC: usize = 0x5346_4c50_6167_6521;

/// Nobody owns the page and it is on no chain.
pub const PAGE_IDLE: usize = 0;
/// The page is on a global chain, or held by whoever stole it from one.
pub const PAGE_LISTED: usize = 1;
const OWNER_BASE: usize = 2;

/// A segregated page: this header, then `capacity` cells of `cell_size` bytes.
///
/// `free_count` counts every free cell of the page, whether it is on the
/// shared `free_list` or on the owning thread's local list. A freeing thread
/// bumps it after pushing its cell, so the owner may take the cell and count it
/// first: the count can dip below zero for a moment. It only reaches `capacity`
/// once no freeing thread is still working on the page.
///
/// `state` is `PAGE_IDLE`, `PAGE_LISTED`, or an owner thread index plus
/// `OWNER_BASE`. Only a thread that takes the page from a chain may make it
/// owned; a freeing thread lists an idle page with a compare-and-swap, so an
/// owned page is never on a chain.
#[repr(C)]
pub struct PageHeader {
    /// The chain link. It must stay at offset 0.
    pub next: AtomicUsize,
    pub magic: usize,
    pub free_list: AtomicChain,
    pub free_count: AtomicI32,
    pub capacity: u32,
    pub cell_size: u32,
    pub size_class: u32,
    pub state: AtomicUsize,
}

static_assertions::const_assert!(std::mem::size_of::<PageHeader>() <= PAGE_HEADER_BYTES);
static_assertions::const_assert_eq!(memoffset::offset_of!(PageHeader, next), 0);

impl PageHeader {
    /// Format a fresh page for `class`. The cells are left as they are.
    ///
    /// # Safety
    /// `page` must be a page the caller owns.
    pub unsafe fn init<'a>(page: Address, class: usize, owner: u16) -> &'a PageHeader {
        page.store(PageHeader {
            next: AtomicUsize::new(0),
            magic: SFL_PAGE_MAGIC,
            free_list: AtomicChain::new(),
            free_count: AtomicI32::new(cells_per_page(class) as i32),
            capacity: cells_per_page(class) as u32,
            cell_size: cell_size(class) as u32,
            size_class: class as u32,
            state: AtomicUsize::new(owner as usize + OWNER_BASE),
        });
        Self::of(page)
    }

    /// The header of the segregated page at `page`.
    ///
    /// # Safety
    /// `page` must be a segregated page.
    pub unsafe fn of<'a>(page: Address) -> &'a PageHeader {
        let h = page.as_ref::<PageHeader>();
        assert!(
            h.magic == SFL_PAGE_MAGIC,
            "segregated page header at {} is corrupt (magic {:#x})",
            page,
            h.magic
        );
        h
    }

    pub fn page(&self) -> Address {
        Address::from_ref(self)
    }

    pub fn first_cell(&self) -> Address {
        self.page() + PAGE_HEADER_BYTES
    }

    pub fn cell(&self, index: usize) -> Address {
        debug_assert!(index < self.capacity as usize);
        self.first_cell() + index * self.cell_size as usize
    }

    pub fn cells(&self) -> impl Iterator<Item = Address> + '_ {
        (0..self.capacity as usize).map(move |i| self.cell(i))
    }

    /// The cell containing `addr`, if `addr` is in the cell area.
    pub fn cell_containing(&self, addr: Address) -> Option<Address> {
        let first = self.first_cell();
        if addr < first {
            return None;
        }
        let index = (addr - first) / self.cell_size as usize;
        if index < self.capacity as usize {
            Some(self.cell(index))
        } else {
            None
        }
    }

    pub fn owner(&self) -> Option<u16> {
        match self.state.load(Ordering::SeqCst) {
            s if s >= OWNER_BASE => Some((s - OWNER_BASE) as u16),
            _ => None,
        }
    }

    /// Claim a page just taken off a chain.
    pub fn take_ownership(&self, owner: u16) {
        let prev = self.state.swap(owner as usize + OWNER_BASE, Ordering::SeqCst);
        assert_eq!(prev, PAGE_LISTED, "took an unlisted page {}", self.page());
    }

    /// Give up ownership. Returns true if the caller must now put the page on
    /// a chain, because it has free cells nobody else will list it for.
    pub fn relinquish(&self) -> bool {
        debug_assert!(self.owner().is_some());
        self.state.store(PAGE_IDLE, Ordering::SeqCst);
        fence(Ordering::SeqCst);
        !self.free_list.is_empty() && self.try_list()
    }

    /// Move an idle page to listed. Returns true if this call did it.
    pub fn try_list(&self) -> bool {
        self.state
            .compare_exchange(PAGE_IDLE, PAGE_LISTED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Return a cell to the page. Returns true if the caller must put the page
    /// on a chain. The free count is bumped last: once it reaches the capacity
    /// nobody touches the page any more.
    ///
    /// # Safety
    /// `cell` must be an allocated cell of this page.
    pub unsafe fn free_cell(&self, cell: Address) -> bool {
        self.free_list.push(cell);
        fence(Ordering::SeqCst);
        self.try_list()
    }

    /// Finish a [`Self::free_cell`] (after the page was listed, if it had to be).
    pub fn count_freed(&self, cells: u32) {
        let prev = self.free_count.fetch_add(cells as i32, Ordering::SeqCst);
        assert!(
            prev + cells as i32 <= self.capacity as i32,
            "page {} has more free cells than it can hold",
            self.page()
        );
    }

    pub fn count_allocated(&self) {
        let prev = self.free_count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > -(self.capacity as i32), "page {} over-allocated", self.page());
    }

    /// Every cell is free and no thread is freeing into the page.
    pub fn is_empty(&self) -> bool {
        self.free_count.load(Ordering::SeqCst) == self.capacity as i32
    }
}
