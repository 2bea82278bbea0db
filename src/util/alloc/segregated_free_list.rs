//! The segregated free-list allocator used by the mark-sweep collectors.
//!
//! Small objects live in cells of single pages formatted for one of the
//! [`NUM_SIZE_CLASSES`] size classes. Each thread allocates from a page it owns
//! through a thread-local free list; other threads (and the sweeper) return
//! cells to the page's shared free list. Pages with free cells that nobody owns
//! wait on a per-class chain until a thread adopts them:
//!
//! * `recycle`: pages listed by whoever freed the first cell of an idle page,
//! * `partial`: pages sorted out by [`SegregatedFreeList::recycle_global_pages`].
//!
//! Objects larger than [`LARGE_OBJECT_THRESHOLD`] get a run of pages of their own,
//! brick 0 on the first page.

use super::allocator::AllocationError;
use super::page_header::PageHeader;
use super::size_class::*;
use crate::util::atomic_chain::{AtomicChain, ChainIter};
use crate::util::constants::*;
use crate::util::conversions::*;
use crate::util::heap::page_table::{PageType, CELL_PAGE, NO_OBJECT_START};
use crate::util::heap::PageManager;
use crate::util::memory;
use crate::util::{Address, ObjectReference};
use crate::vm::object_model;
use crossbeam::utils::CachePadded;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A thread's view of one size class.
#[derive(Copy, Clone)]
struct LocalClass {
    /// The page this thread owns for the class, or zero.
    page: Address,
    /// Free cells of `page` only this thread can see, linked through their first word.
    free: Address,
}

/// Per-thread free lists. Owned by the mutator; the collector only touches
/// them while the thread is stopped or dormant.
pub struct LocalFreeLists {
    thread: u16,
    classes: [LocalClass; NUM_SIZE_CLASSES],
}

impl LocalFreeLists {
    pub fn new(thread: u16) -> Self {
        LocalFreeLists {
            thread,
            classes: [LocalClass {
                page: Address::ZERO,
                free: Address::ZERO,
            }; NUM_SIZE_CLASSES],
        }
    }

    pub fn thread(&self) -> u16 {
        self.thread
    }
}

pub struct SegregatedFreeList {
    pages: Arc<PageManager>,
    page_type: PageType,
    partial: [CachePadded<AtomicChain>; NUM_SIZE_CLASSES],
    recycle: [CachePadded<AtomicChain>; NUM_SIZE_CLASSES],
    /// Cell bytes handed out plus large-object page bytes.
    total_bytes: AtomicUsize,
    /// Bytes freed by sweeping that [`Self::commit_freed_data`] has not subtracted yet.
    freed_bytes_pending: AtomicUsize,
}

impl SegregatedFreeList {
    pub fn new(pages: Arc<PageManager>, page_type: PageType) -> Self {
        debug_assert!(page_type.is_heap());
        SegregatedFreeList {
            pages,
            page_type,
            partial: std::array::from_fn(|_| CachePadded::new(AtomicChain::new())),
            recycle: std::array::from_fn(|_| CachePadded::new(AtomicChain::new())),
            total_bytes: AtomicUsize::new(0),
            freed_bytes_pending: AtomicUsize::new(0),
        }
    }

    pub fn page_manager(&self) -> &Arc<PageManager> {
        &self.pages
    }

    pub fn page_type(&self) -> PageType {
        self.page_type
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes.load(Ordering::SeqCst)
    }

    /// Allocate `size` bytes of zeroed memory and return its start (the
    /// pre-header address).
    pub fn alloc(&self, local: &mut LocalFreeLists, size: usize) -> Result<Address, AllocationError> {
        debug_assert!(size >= MIN_OBJECT_BYTES);
        if size > LARGE_OBJECT_THRESHOLD {
            return self.alloc_large(local.thread, size);
        }
        let class = size_class(size);
        if local.classes[class].free.is_zero() {
            self.refill(local, class)?;
        }
        let slot = &mut local.classes[class];
        let cell = slot.free;
        slot.free = unsafe { AtomicChain::next_of(cell) };
        let header = unsafe { PageHeader::of(slot.page) };
        header.count_allocated();
        memory::zero(cell, cell_size(class));
        self.total_bytes.fetch_add(cell_size(class), Ordering::SeqCst);
        Ok(cell)
    }

    /// Give `local` free cells of `class`: from its own page's shared list,
    /// then from an unowned page, then from a new page.
    fn refill(&self, local: &mut LocalFreeLists, class: usize) -> Result<(), AllocationError> {
        let thread = local.thread;
        let slot = &mut local.classes[class];
        if !slot.page.is_zero() {
            let header = unsafe { PageHeader::of(slot.page) };
            let chain = header.free_list.take_all();
            if !chain.is_zero() {
                slot.free = chain;
                return Ok(());
            }
            if header.relinquish() {
                unsafe { self.recycle[class].push(slot.page) };
            }
            slot.page = Address::ZERO;
        }

        while let Some(page) = self.partial[class]
            .pop()
            .or_else(|| self.recycle[class].pop())
        {
            let header = unsafe { PageHeader::of(page) };
            header.take_ownership(thread);
            let chain = header.free_list.take_all();
            if chain.is_zero() {
                // Emptied by another thread between listing and now.
                if header.relinquish() {
                    unsafe { self.recycle[class].push(page) };
                }
                continue;
            }
            trace!("thread {} adopts {:?} page {}", thread, class, page);
            slot.page = page;
            slot.free = chain;
            return Ok(());
        }

        let page = self.new_local_page(thread, class)?;
        slot.page = page;
        slot.free = unsafe { PageHeader::of(page) }.first_cell();
        Ok(())
    }

    /// Format a fresh page for `class`, owned by `thread`, with every cell on a
    /// local chain starting at the first cell.
    fn new_local_page(&self, thread: u16, class: usize) -> Result<Address, AllocationError> {
        let mut clean = true;
        let page = self.pages.ensure_pages(thread, 1, self.page_type, &mut clean)?;
        if !clean {
            memory::zero(page, BYTES_IN_PAGE);
        }
        let header = unsafe { PageHeader::init(page, class, thread) };
        let cells: Vec<Address> = header.cells().collect();
        for pair in cells.windows(2) {
            unsafe { AtomicChain::set_next(pair[0], pair[1]) };
        }
        // Publish the class only once the header is in place: sweepers look for it.
        self.pages
            .set_extra(self.pages.page_index(page), CELL_PAGE | class as u16);
        trace!("thread {} formats page {} for class {}", thread, page, class);
        Ok(page)
    }

    fn alloc_large(&self, thread: u16, size: usize) -> Result<Address, AllocationError> {
        let count = bytes_to_pages_up(size);
        let mut clean = true;
        let start = self.pages.ensure_pages(thread, count, self.page_type, &mut clean)?;
        if !clean {
            memory::zero(start, pages_to_bytes(count));
        }
        self.pages.set_extra(self.pages.page_index(start), 0);
        self.total_bytes
            .fetch_add(pages_to_bytes(count), Ordering::SeqCst);
        trace!("large object of {} bytes at {}", size, start);
        Ok(start)
    }

    /// Free the object starting at `start` now, accounting included.
    pub fn free_object(&self, start: Address) {
        let index = self.pages.page_index(start);
        let extra = self.pages.extra(index);
        if extra & CELL_PAGE != 0 {
            let size = unsafe { self.free_cell(start) };
            self.subtract_total(size);
        } else {
            debug_assert_eq!(start, self.pages.page_address(index));
            debug_assert_eq!(extra, 0, "{} is not the start of a large object", start);
            let size = self.free_large(start);
            self.subtract_total(size);
        }
    }

    /// Free a cell found dead by a sweep. The bytes are subtracted from the
    /// total by the next [`Self::commit_freed_data`].
    ///
    /// # Safety
    /// `cell` must be an allocated cell.
    pub unsafe fn free_cell_for_sweep(&self, cell: Address) {
        let size = self.free_cell(cell);
        self.freed_bytes_pending.fetch_add(size, Ordering::SeqCst);
    }

    unsafe fn free_cell(&self, cell: Address) -> usize {
        let header = PageHeader::of(page_align_down(cell));
        debug_assert_eq!(header.cell_containing(cell), Some(cell));
        object_model::clear_type_word(ObjectReference::from_object_start(cell));
        if header.free_cell(cell) {
            self.recycle[header.size_class as usize].push(header.page());
        }
        header.count_freed(1);
        header.cell_size as usize
    }

    fn free_large(&self, start: Address) -> usize {
        let size = object_model::size(ObjectReference::from_object_start(start));
        let count = bytes_to_pages_up(size);
        object_model::clear_type_word(ObjectReference::from_object_start(start));
        self.pages.release_unused_pages(start, count, false);
        pages_to_bytes(count)
    }

    fn subtract_total(&self, bytes: usize) {
        let prev = self.total_bytes.fetch_sub(bytes, Ordering::SeqCst);
        assert!(
            prev >= bytes,
            "allocated bytes would become negative ({} - {})",
            prev,
            bytes
        );
    }

    /// Subtract the bytes freed by sweeping. Returns them.
    pub fn commit_freed_data(&self) -> usize {
        let freed = self.freed_bytes_pending.swap(0, Ordering::SeqCst);
        self.subtract_total(freed);
        freed
    }

    /// Return every page `local` owns, with its local free cells.
    pub fn flush_local(&self, local: &mut LocalFreeLists) {
        for (class, slot) in local.classes.iter_mut().enumerate() {
            if slot.page.is_zero() {
                continue;
            }
            let header = unsafe { PageHeader::of(slot.page) };
            if !slot.free.is_zero() {
                let mut last = slot.free;
                unsafe {
                    loop {
                        let next = AtomicChain::next_of(last);
                        if next.is_zero() {
                            break;
                        }
                        last = next;
                    }
                    header.free_list.push_chain(slot.free, last);
                }
            }
            if header.relinquish() {
                unsafe { self.recycle[class].push(slot.page) };
            }
            *slot = LocalClass {
                page: Address::ZERO,
                free: Address::ZERO,
            };
        }
    }

    /// Sort the listed pages of every class: empty pages go back to the page
    /// manager, pages with free cells to `partial`. Returns the pages released.
    pub fn recycle_global_pages(&self) -> usize {
        let mut released = 0;
        for class in 0..NUM_SIZE_CLASSES {
            let stolen = [self.recycle[class].take_all(), self.partial[class].take_all()];
            for first in stolen {
                for page in unsafe { ChainIter::new(first) } {
                    let header = unsafe { PageHeader::of(page) };
                    if header.is_empty() {
                        self.release_cell_page(page);
                        released += 1;
                    } else if !header.free_list.is_empty() {
                        unsafe { self.partial[class].push(page) };
                    } else {
                        // Full. A freeing thread lists it again when it frees a cell.
                        header.state.store(super::page_header::PAGE_IDLE, Ordering::SeqCst);
                        std::sync::atomic::fence(Ordering::SeqCst);
                        if !header.free_list.is_empty() && header.try_list() {
                            unsafe { self.partial[class].push(page) };
                        }
                    }
                }
            }
        }
        if released > 0 {
            debug!("recycled {} empty free-list pages", released);
        }
        released
    }

    fn release_cell_page(&self, page: Address) {
        unsafe { (page + memoffset::offset_of!(PageHeader, magic)).store(0usize) };
        let index = self.pages.page_index(page);
        self.pages.set_extra(index, NO_OBJECT_START);
        self.pages.release_unused_pages(page, 1, false);
    }

    /// Free every allocated cell and large object for which `is_live` is false.
    /// `is_live` may change the GC bits of the objects it keeps. Freed bytes are
    /// pending until [`Self::commit_freed_data`]. Returns the objects freed.
    pub fn sweep(&self, mut is_live: impl FnMut(ObjectReference) -> bool) -> usize {
        let mut freed = 0;
        for range in self.pages.find_pages_of_type(self.page_type) {
            for index in range {
                // Re-read: pages are formatted and released while we walk.
                if self.pages.page_type(self.pages.page_address(index)) != self.page_type {
                    continue;
                }
                let extra = self.pages.extra(index);
                let page = self.pages.page_address(index);
                if extra & CELL_PAGE != 0 {
                    let header = unsafe { PageHeader::of(page) };
                    for cell in header.cells() {
                        let object = ObjectReference::from_object_start(cell);
                        if object_model::load_type_word(object) == 0 {
                            continue;
                        }
                        if !is_live(object) {
                            unsafe { self.free_cell_for_sweep(cell) };
                            freed += 1;
                        }
                    }
                } else if extra == 0 {
                    let object = ObjectReference::from_object_start(page);
                    if object_model::load_type_word(object) == 0 {
                        continue;
                    }
                    if !is_live(object) {
                        let bytes = self.free_large(page);
                        self.freed_bytes_pending.fetch_add(bytes, Ordering::SeqCst);
                        freed += 1;
                    }
                }
            }
        }
        trace!("swept {} dead objects", freed);
        freed
    }

    /// The start of the cell or large object containing `addr`, if `addr` is
    /// in a page of this allocator.
    pub fn find_start(&self, addr: Address) -> Option<Address> {
        if !self.pages.in_heap(addr) || self.pages.page_type(addr) != self.page_type {
            return None;
        }
        let mut index = self.pages.page_index(addr);
        let extra = self.pages.extra(index);
        if extra & CELL_PAGE != 0 {
            return unsafe { PageHeader::of(self.pages.page_address(index)) }.cell_containing(addr);
        }
        // Walk back to the first page of the large object.
        loop {
            match self.pages.extra(index) {
                0 => return Some(self.pages.page_address(index)),
                NO_OBJECT_START if index > 0 => index -= 1,
                _ => return None,
            }
            if self.pages.table().page_type(index) != self.page_type {
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::options::PageLockKind;
    use crate::util::test_util::fixtures::*;

    fn new_sfl(pages: usize) -> SegregatedFreeList {
        let pm = PageManager::new(pages * BYTES_IN_PAGE, PageLockKind::Spin).unwrap();
        SegregatedFreeList::new(Arc::new(pm), PageType::Owner(0))
    }

    #[test]
    fn alloc_and_free_cells() {
        let sfl = new_sfl(64);
        let mut local = LocalFreeLists::new(1);
        let a = sfl.alloc(&mut local, 24).unwrap();
        let b = sfl.alloc(&mut local, 24).unwrap();
        assert_ne!(a, b);
        assert_eq!(page_align_down(a), page_align_down(b));
        assert_eq!(sfl.total_bytes(), 48);
        init_node(a);
        sfl.free_object(a);
        assert_eq!(sfl.total_bytes(), 24);
        assert_eq!(sfl.find_start(b + 10usize), Some(b));
    }

    #[test]
    fn freed_cells_are_reused() {
        let sfl = new_sfl(64);
        let mut local = LocalFreeLists::new(1);
        let cells: Vec<Address> = (0..cells_per_page(1))
            .map(|_| sfl.alloc(&mut local, 24).unwrap())
            .collect();
        let page = page_align_down(cells[0]);
        assert!(cells.iter().all(|c| page_align_down(*c) == page));
        init_node(cells[5]);
        sfl.free_object(cells[5]);
        // the local list is exhausted, the shared list has one cell
        assert_eq!(sfl.alloc(&mut local, 24).unwrap(), cells[5]);
    }

    #[test]
    fn flushed_empty_pages_are_released() {
        let sfl = new_sfl(64);
        let mut local = LocalFreeLists::new(1);
        let a = sfl.alloc(&mut local, 100).unwrap();
        init_node(a);
        let in_use = sfl.page_manager().in_use_pages();
        sfl.free_object(a);
        sfl.flush_local(&mut local);
        assert_eq!(sfl.recycle_global_pages(), 1);
        assert_eq!(sfl.page_manager().in_use_pages(), in_use - 1);
        assert_eq!(sfl.total_bytes(), 0);
    }

    #[test]
    fn large_objects() {
        let sfl = new_sfl(64);
        let mut local = LocalFreeLists::new(1);
        let a = sfl.alloc(&mut local, 3 * BYTES_IN_PAGE).unwrap();
        assert!(is_page_aligned(a));
        assert_eq!(sfl.total_bytes(), 3 * BYTES_IN_PAGE);
        init_byte_vector(a, 3 * BYTES_IN_PAGE - 8 - 16);
        assert_eq!(sfl.find_start(a + 2 * BYTES_IN_PAGE + 5usize), Some(a));
        sfl.free_object(a);
        assert_eq!(sfl.total_bytes(), 0);
    }

    #[test]
    fn sweep_frees_dead_objects() {
        let sfl = new_sfl(64);
        let mut local = LocalFreeLists::new(1);
        let live = sfl.alloc(&mut local, 24).unwrap();
        let dead = sfl.alloc(&mut local, 24).unwrap();
        let big = sfl.alloc(&mut local, 2 * BYTES_IN_PAGE).unwrap();
        init_node(live);
        init_node(dead);
        init_byte_vector(big, 2 * BYTES_IN_PAGE - 24);
        let keep = ObjectReference::from_object_start(live);
        assert_eq!(sfl.sweep(|o| o == keep), 2);
        assert_eq!(sfl.total_bytes(), 24 + 24 + 2 * BYTES_IN_PAGE);
        assert_eq!(sfl.commit_freed_data(), 24 + 2 * BYTES_IN_PAGE);
        assert_eq!(sfl.total_bytes(), 24);
    }
}
