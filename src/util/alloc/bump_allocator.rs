use super::allocator::{align_allocation, fill_alignment_gap, AllocationError};
use crate::util::constants::*;
use crate::util::conversions::*;
use crate::util::heap::page_table::{PageType, NO_OBJECT_START};
use crate::util::heap::PageManager;
use crate::util::memory;
use crate::util::Address;

/// Where a bump allocator gets its chunks from.
pub trait ChunkSource {
    fn page_manager(&self) -> &PageManager;

    /// Return at least `pages` contiguous zeroed pages typed `page_type`, and
    /// how many pages were actually handed out.
    fn get_chunk(
        &self,
        thread: u16,
        pages: usize,
        page_type: PageType,
    ) -> Result<(Address, usize), AllocationError>;
}

impl ChunkSource for PageManager {
    fn page_manager(&self) -> &PageManager {
        self
    }

    fn get_chunk(
        &self,
        thread: u16,
        pages: usize,
        page_type: PageType,
    ) -> Result<(Address, usize), AllocationError> {
        let mut clean = true;
        let start = self.ensure_pages(thread, pages, page_type, &mut clean)?;
        if !clean {
            memory::zero(start, pages_to_bytes(pages));
        }
        Ok((start, pages))
    }
}

/// A pointer-bump allocator over chunks of whole pages.
///
/// Every page records the offset of the first object that starts in it (its
/// brick), so the objects of a page can be walked without the rest of the
/// chunk. The memory beyond the cursor is always zero and the cursor always
/// stays one word short of the limit, so a walk finds a zero type word at the
/// cursor without leaving the chunk.
pub struct BumpAllocator {
    thread: u16,
    cursor: Address,
    limit: Address,
    page_type: PageType,
    chunk_pages: usize,
}

impl BumpAllocator {
    pub fn new(thread: u16, page_type: PageType, chunk_pages: usize) -> Self {
        debug_assert!(chunk_pages > 0);
        BumpAllocator {
            thread,
            cursor: Address::ZERO,
            limit: Address::ZERO,
            page_type,
            chunk_pages,
        }
    }

    pub fn page_type(&self) -> PageType {
        self.page_type
    }

    pub fn set_page_type(&mut self, page_type: PageType) {
        debug_assert!(self.cursor.is_zero(), "retarget a bump allocator with a chunk");
        self.page_type = page_type;
    }

    pub fn cursor(&self) -> Address {
        self.cursor
    }

    pub fn limit(&self) -> Address {
        self.limit
    }

    /// Allocate `size` bytes of zeroed memory so that the object reference
    /// (one pre-header word in) is aligned to `align`. Returns the start.
    pub fn alloc(
        &mut self,
        source: &dyn ChunkSource,
        size: usize,
        align: usize,
    ) -> Result<Address, AllocationError> {
        let start = align_allocation(self.cursor, align, PREHEADER_BYTES);
        let new_cursor = start + size;
        if self.cursor.is_zero() || new_cursor + PREHEADER_BYTES > self.limit {
            self.alloc_slow(source, size, align)
        } else {
            fill_alignment_gap(self.cursor, start);
            self.cursor = new_cursor;
            set_brick(source.page_manager(), start);
            Ok(start)
        }
    }

    fn alloc_slow(
        &mut self,
        source: &dyn ChunkSource,
        size: usize,
        align: usize,
    ) -> Result<Address, AllocationError> {
        self.truncate(source.page_manager());
        let needed = bytes_to_pages_up(size + align - MIN_ALIGNMENT + PREHEADER_BYTES);
        let (start, pages) = source.get_chunk(
            self.thread,
            usize::max(needed, self.chunk_pages),
            self.page_type,
        )?;
        trace!(
            "thread {} bump chunk of {} pages at {} ({:?})",
            self.thread,
            pages,
            start,
            self.page_type
        );
        self.cursor = start;
        self.limit = start + pages_to_bytes(pages);
        self.alloc(source, size, align)
    }

    /// Give the untouched whole pages after the cursor back to the page
    /// manager and drop the chunk.
    pub fn truncate(&mut self, pages: &PageManager) {
        if self.cursor.is_zero() {
            return;
        }
        let first_free = (self.cursor + PREHEADER_BYTES).align_up(BYTES_IN_PAGE);
        if first_free < self.limit {
            let count = (self.limit - first_free) >> LOG_BYTES_IN_PAGE;
            pages.release_unused_pages(first_free, count, true);
            trace!("thread {} returns {} unused bump pages", self.thread, count);
        }
        self.cursor = Address::ZERO;
        self.limit = Address::ZERO;
    }
}

/// Record `start` as the brick of its page unless an earlier object already did.
fn set_brick(pages: &PageManager, start: Address) {
    let index = pages.page_index(start);
    if pages.extra(index) == NO_OBJECT_START {
        pages.set_extra(index, (start - page_align_down(start)) as u16);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::options::PageLockKind;

    #[test]
    fn bump_and_bricks() {
        let pm = PageManager::new(64 * BYTES_IN_PAGE, PageLockKind::Spin).unwrap();
        let mut bump = BumpAllocator::new(0, PageType::Owner(0), 4);
        let a = bump.alloc(&pm, 1000, 8).unwrap();
        let b = bump.alloc(&pm, 4000, 8).unwrap();
        let c = bump.alloc(&pm, 64, 64).unwrap();
        assert_eq!(b, a + 1000usize);
        assert!((c + PREHEADER_BYTES).is_aligned_to(64));
        assert_eq!(pm.extra(pm.page_index(a)), 0);
        // b starts in the first page, c in the second
        assert_eq!(pm.extra(pm.page_index(a) + 1) as usize, c - page_align_down(c));
        assert_eq!(pm.in_use_pages(), 4);
        bump.truncate(&pm);
        assert_eq!(pm.in_use_pages(), 2);
    }

    #[test]
    fn chunks_grow_for_big_objects() {
        let pm = PageManager::new(64 * BYTES_IN_PAGE, PageLockKind::Spin).unwrap();
        let mut bump = BumpAllocator::new(0, PageType::Owner(1), 2);
        let a = bump.alloc(&pm, 5 * BYTES_IN_PAGE, 8).unwrap();
        assert_eq!(pm.page_type(a), PageType::Owner(1));
        assert_eq!(pm.extra(pm.page_index(a) + 3), NO_OBJECT_START);
        assert_eq!(bump.limit() - bump.cursor(), BYTES_IN_PAGE);
    }
}
