//! The page manager hands out and takes back runs of pages of the reserved heap.
//!
//! Unused runs live in a [`FreeRegionIndex`]; pages above the high-water mark
//! have never been handed out. Requests are served first fit from the index,
//! then from above the high-water mark. Released runs are merged with unused
//! neighbours on both sides.
//!
//! The page table and the index are protected by one lock. While the world is
//! stopped the collector owns the page manager alone and the lock is elided
//! (see [`PageManager::enter_single_threaded`]).

use super::accounting::PageAccounting;
use super::page_table::{PageEntry, PageTable, PageType, NO_OBJECT_START};
use super::unused_block::{self, FreeRegionIndex};
use crate::util::alloc::AllocationError;
use crate::util::constants::*;
use crate::util::conversions::*;
use crate::util::memory;
use crate::util::options::PageLockKind;
use crate::util::Address;
use std::cell::UnsafeCell;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

enum PageLock {
    Spin(spin::Mutex<()>),
    Blocking(std::sync::Mutex<()>),
}

enum PageLockGuard<'a> {
    Spin(#[allow(dead_code)] spin::MutexGuard<'a, ()>),
    Blocking(#[allow(dead_code)] std::sync::MutexGuard<'a, ()>),
    Elided,
}

struct ManagerState {
    index: FreeRegionIndex,
}

pub struct PageManager {
    table: PageTable,
    lock: PageLock,
    single_threaded: AtomicBool,
    /// Pages below this index have been handed out at least once.
    high_water: AtomicUsize,
    state: UnsafeCell<ManagerState>,
    accounting: PageAccounting,
}

// The state cell is only reached through `with_state`, under the lock or with the world stopped.
unsafe impl Sync for PageManager {}
unsafe impl Send for PageManager {}

impl PageManager {
    /// Reserve `heap_size` bytes (rounded up to pages) of address space.
    pub fn new(heap_size: usize, lock: PageLockKind) -> std::io::Result<Self> {
        let pages = bytes_to_pages_up(heap_size);
        let base = memory::mmap_noreserve(pages_to_bytes(pages))?;
        let lock = match lock.resolve() {
            PageLockKind::Blocking => PageLock::Blocking(std::sync::Mutex::new(())),
            _ => PageLock::Spin(spin::Mutex::new(())),
        };
        debug!(
            "Reserved {} of heap at {}",
            bytes_to_formatted_string(pages_to_bytes(pages)),
            base
        );
        Ok(PageManager {
            table: PageTable::new(base, pages),
            lock,
            single_threaded: AtomicBool::new(false),
            high_water: AtomicUsize::new(0),
            state: UnsafeCell::new(ManagerState {
                index: FreeRegionIndex::new(),
            }),
            accounting: PageAccounting::new(),
        })
    }

    fn lock(&self) -> PageLockGuard<'_> {
        if self.single_threaded.load(Ordering::Acquire) {
            return PageLockGuard::Elided;
        }
        match &self.lock {
            PageLock::Spin(l) => PageLockGuard::Spin(l.lock()),
            PageLock::Blocking(l) => {
                PageLockGuard::Blocking(l.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
            }
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut ManagerState) -> R) -> R {
        let _guard = self.lock();
        f(unsafe { &mut *self.state.get() })
    }

    /// Elide the lock: the caller is the only thread touching the page manager
    /// until [`Self::leave_single_threaded`].
    pub fn enter_single_threaded(&self) {
        let _guard = self.lock();
        let was = self.single_threaded.swap(true, Ordering::AcqRel);
        assert!(!was, "the page manager is already single threaded");
    }

    pub fn leave_single_threaded(&self) {
        let was = self.single_threaded.swap(false, Ordering::AcqRel);
        assert!(was, "the page manager is not single threaded");
    }

    pub fn is_single_threaded(&self) -> bool {
        self.single_threaded.load(Ordering::Acquire)
    }

    /// Find or create `count` contiguous pages and give them `page_type`.
    ///
    /// If `*clean` is true on entry and any returned page may hold stale data it
    /// is set to false; the caller then zeroes what it needs. The unused-region
    /// header words are zeroed either way.
    pub fn ensure_pages(
        &self,
        thread: u16,
        count: usize,
        page_type: PageType,
        clean: &mut bool,
    ) -> Result<Address, AllocationError> {
        assert!(count > 0);
        assert!(
            !page_type.is_unused() && page_type != PageType::Unallocated,
            "cannot hand out pages as {:?}",
            page_type
        );
        if count > self.table.pages() {
            return Err(AllocationError::MmapOutOfMemory);
        }
        self.with_state(|state| {
            let start = match state.index.first_fit(count) {
                Some(head) => unsafe { self.take_from_region(state, head, count) },
                None => self.take_fresh(count)?,
            };
            let first = self.table.page_index(start);
            let mut dirty = false;
            let mut newly_committed = 0;
            for i in first..first + count {
                match self.table.page_type(i) {
                    PageType::UnusedDirty => dirty = true,
                    PageType::UnusedClean | PageType::Unallocated => newly_committed += 1,
                    other => panic!("page {} is handed out twice (it is {:?})", i, other),
                }
            }
            // Heap pages start without an object start; the allocators fill in bricks
            // or the size class once the page is formatted.
            let extra = match page_type {
                PageType::Stack => thread,
                t if t.is_heap() => NO_OBJECT_START,
                _ => 0,
            };
            self.table.set_range(
                first,
                count,
                PageEntry {
                    page_type,
                    process: 0,
                    extra,
                },
            );
            if dirty {
                *clean = false;
            }
            self.accounting.acquire(count, newly_committed);
            trace!(
                "thread {} got {} {:?} pages at {} (dirty: {})",
                thread,
                count,
                page_type,
                start,
                dirty
            );
            Ok(start)
        })
    }

    unsafe fn take_from_region(&self, state: &mut ManagerState, head: Address, count: usize) -> Address {
        state.index.unlink(head);
        let region = unused_block::header(head).count;
        debug_assert!(region >= count);
        let tail = unused_block::tail_page(head, region);
        unused_block::clear_header(head);
        if region == count {
            if region > 1 {
                unused_block::clear_header(tail);
            }
        } else {
            let rest = head + pages_to_bytes(count);
            unused_block::write_region(rest, region - count);
            state.index.link(rest);
        }
        head
    }

    fn take_fresh(&self, count: usize) -> Result<Address, AllocationError> {
        let start = self.high_water.load(Ordering::Relaxed);
        if start + count > self.table.pages() {
            return Err(AllocationError::HeapOutOfMemory);
        }
        self.high_water.store(start + count, Ordering::Release);
        Ok(self.table.page_address(start))
    }

    /// Return `count` pages starting at `start`. With `clean`, the caller
    /// promises the pages read as zero.
    pub fn release_unused_pages(&self, start: Address, count: usize, clean: bool) {
        debug_assert!(is_page_aligned(start));
        let first = self.table.page_index(start);
        self.with_state(|state| unsafe {
            self.mark_unused_pages(first, count, clean);
            self.link_unused_pages(state, first, count);
        });
        trace!("released {} pages at {} (clean: {})", count, start, clean);
    }

    /// Return the pages of `[start, end)` as dirty pages.
    pub fn free_page_range(&self, start: Address, end: Address) {
        debug_assert!(is_page_aligned(end));
        self.release_unused_pages(start, (end - start) >> LOG_BYTES_IN_PAGE, false)
    }

    fn mark_unused_pages(&self, first: usize, count: usize, clean: bool) {
        let page_type = if clean {
            PageType::UnusedClean
        } else {
            PageType::UnusedDirty
        };
        for i in first..first + count {
            let old = self.table.page_type(i);
            assert!(
                !old.is_unused() && old != PageType::Unallocated,
                "page {} at {} is released twice (it is {:?})",
                i,
                self.table.page_address(i),
                old
            );
            self.table.set_entry(
                i,
                PageEntry {
                    page_type,
                    process: 0,
                    extra: 0,
                },
            );
        }
        self.accounting.release(count, clean);
    }

    /// Merge `[first, first + count)` with unused neighbours and link the result.
    unsafe fn link_unused_pages(&self, state: &mut ManagerState, first: usize, count: usize) {
        let mut head = first;
        let mut total = count;
        if first > 0 && self.table.page_type(first - 1).is_unused() {
            let below_tail = self.table.page_address(first - 1);
            let below_head = unused_block::header(below_tail).curr;
            let below_count = self.unlink_unused_pages(state, below_head);
            if below_count > 1 {
                unused_block::clear_header(below_tail);
            }
            head = self.table.page_index(below_head);
            total += below_count;
        }
        let end = first + count;
        if end < self.high_water.load(Ordering::Relaxed) && self.table.page_type(end).is_unused() {
            let above_head = self.table.page_address(end);
            let above_count = self.unlink_unused_pages(state, above_head);
            unused_block::clear_header(above_head);
            total += above_count;
        }
        let head = self.table.page_address(head);
        unused_block::write_region(head, total);
        state.index.link(head);
    }

    unsafe fn unlink_unused_pages(&self, state: &mut ManagerState, head: Address) -> usize {
        let count = unused_block::header(head).count;
        state.index.unlink(head);
        count
    }

    /// Hand the memory of dirty unused regions back to the OS, up to roughly
    /// `max_pages` pages. Returns the number of pages decommitted.
    pub fn decommit_unused_pages(&self, max_pages: usize) -> std::io::Result<usize> {
        self.with_state(|state| {
            let mut done = 0;
            for (head, count) in state.index.regions() {
                if done >= max_pages {
                    break;
                }
                let first = self.table.page_index(head);
                let dirty = (first..first + count)
                    .filter(|&i| self.table.page_type(i) == PageType::UnusedDirty)
                    .count();
                if dirty == 0 {
                    continue;
                }
                unsafe {
                    state.index.unlink(head);
                    let result = memory::decommit(head, pages_to_bytes(count));
                    // The headers are gone even if madvise failed half way; rewrite them.
                    unused_block::write_region(head, count);
                    state.index.link(head);
                    result?;
                }
                for i in first..first + count {
                    self.table.set_page_type(i, PageType::UnusedClean);
                }
                self.accounting.uncommit(dirty);
                done += count;
            }
            if done > 0 {
                debug!("Decommitted {} unused pages", done);
            }
            Ok(done)
        })
    }

    /// Pages for a thread stack. They are not zeroed.
    pub fn allocate_stack(&self, thread: u16, pages: usize) -> Result<Address, AllocationError> {
        let mut clean = false;
        self.ensure_pages(thread, pages, PageType::Stack, &mut clean)
    }

    pub fn free_stack(&self, start: Address, pages: usize) {
        let first = self.table.page_index(start);
        for i in first..first + pages {
            assert_eq!(self.table.page_type(i), PageType::Stack);
        }
        self.release_unused_pages(start, pages, false);
    }

    pub fn table(&self) -> &PageTable {
        &self.table
    }

    pub fn page_type(&self, addr: Address) -> PageType {
        self.table.page_type(self.table.page_index(addr))
    }

    pub fn set_page_type(&self, index: usize, page_type: PageType) {
        self.table.set_page_type(index, page_type)
    }

    pub fn extra(&self, index: usize) -> u16 {
        self.table.extra(index)
    }

    pub fn set_extra(&self, index: usize, extra: u16) {
        self.table.set_extra(index, extra)
    }

    pub fn page_index(&self, addr: Address) -> usize {
        self.table.page_index(addr)
    }

    pub fn page_address(&self, index: usize) -> Address {
        self.table.page_address(index)
    }

    /// Is `addr` in a page that has been handed out at least once?
    pub fn in_heap(&self, addr: Address) -> bool {
        self.table.contains(addr) && self.table.page_index(addr) < self.high_water_page()
    }

    pub fn high_water_page(&self) -> usize {
        self.high_water.load(Ordering::Acquire)
    }

    pub fn base(&self) -> Address {
        self.table.base()
    }

    /// Runs of consecutive page indices below the high-water mark whose type satisfies `pred`.
    pub fn find_pages(&self, pred: impl Fn(PageType) -> bool) -> Vec<Range<usize>> {
        let mut runs: Vec<Range<usize>> = vec![];
        for i in 0..self.high_water_page() {
            if pred(self.table.page_type(i)) {
                match runs.last_mut() {
                    Some(r) if r.end == i => r.end = i + 1,
                    _ => runs.push(i..i + 1),
                }
            }
        }
        runs
    }

    pub fn find_pages_of_type(&self, page_type: PageType) -> Vec<Range<usize>> {
        self.find_pages(|t| t == page_type)
    }

    pub fn in_use_pages(&self) -> usize {
        self.accounting.get_in_use_pages()
    }

    pub fn committed_pages(&self) -> usize {
        self.accounting.get_committed_pages()
    }

    /// The number of pages in the free-region index.
    pub fn unused_pages(&self) -> usize {
        self.with_state(|state| state.index.regions().iter().map(|(_, c)| c).sum())
    }

    /// Check the free-region index against the page table.
    pub fn verify(&self) {
        self.with_state(|state| {
            state.index.verify();
            let mut indexed = 0;
            for (head, count) in state.index.regions() {
                let first = self.table.page_index(head);
                for i in first..first + count {
                    assert!(self.table.page_type(i).is_unused());
                }
                indexed += count;
            }
            let marked = (0..self.high_water_page())
                .filter(|&i| self.table.page_type(i).is_unused())
                .count();
            assert_eq!(indexed, marked, "unused pages missing from the free-region index");
        })
    }
}

impl Drop for PageManager {
    fn drop(&mut self) {
        let _ = memory::munmap(self.table.base(), pages_to_bytes(self.table.pages()));
    }
}
