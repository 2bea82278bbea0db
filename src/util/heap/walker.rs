//! Enumerate the objects of heap pages from the page table alone.
//!
//! Segregated pages are walked cell by cell. Every other heap page is walked
//! from its brick (the first object starting in the page) until a zero type
//! word or the end of the page. Each object is reported by the page it starts in.

use super::page_table::{PageType, CELL_PAGE, NO_OBJECT_START};
use super::PageManager;
use crate::util::alloc::allocator::ALIGNMENT_VALUE;
use crate::util::alloc::page_header::PageHeader;
use crate::util::constants::*;
use crate::util::{Address, ObjectReference};
use crate::vm::object_model;

/// Call `f` for every object that starts in page `index`.
pub fn walk_page(pages: &PageManager, index: usize, f: &mut impl FnMut(ObjectReference)) {
    let extra = pages.extra(index);
    let page = pages.page_address(index);
    if extra & CELL_PAGE != 0 {
        let header = unsafe { PageHeader::of(page) };
        for cell in header.cells() {
            let object = ObjectReference::from_object_start(cell);
            if object_model::load_type_word(object) != 0 {
                f(object);
            }
        }
    } else if extra != NO_OBJECT_START {
        walk_bricks(page + extra as usize, page + BYTES_IN_PAGE, f);
    }
}

/// Walk objects starting in `[cursor, end)`. `cursor` must be an object start
/// or an alignment gap.
fn walk_bricks(mut cursor: Address, end: Address, f: &mut impl FnMut(ObjectReference)) {
    while cursor < end {
        if unsafe { cursor.load::<usize>() } == ALIGNMENT_VALUE {
            cursor += BYTES_IN_WORD;
            continue;
        }
        let object = ObjectReference::from_object_start(cursor);
        if object_model::load_type_word(object) == 0 {
            return;
        }
        f(object);
        cursor += object_model::size(object);
    }
}

/// Call `f` for every object starting in a page of `[low, high)` whose type
/// satisfies `pred`.
pub fn walk_objects(
    pages: &PageManager,
    low: Address,
    high: Address,
    pred: impl Fn(PageType) -> bool,
    f: &mut impl FnMut(ObjectReference),
) {
    let low = if low < pages.base() { pages.base() } else { low };
    let high = std::cmp::min(high, pages.page_address(pages.high_water_page()));
    if low >= high {
        return;
    }
    let first = pages.page_index(low);
    let last = pages.page_index(high - 1usize);
    for index in first..=last {
        if !pred(pages.table().page_type(index)) {
            continue;
        }
        walk_page(pages, index, &mut |object| {
            if object.to_raw_address() >= low && object.to_raw_address() < high {
                f(object)
            }
        });
    }
}

/// Every object in a heap page.
pub fn walk_heap(pages: &PageManager, f: &mut impl FnMut(ObjectReference)) {
    walk_objects(
        pages,
        pages.base(),
        pages.page_address(pages.high_water_page()),
        |t| t.is_heap(),
        f,
    )
}

/// The object whose memory (pre-header included) contains `addr`.
pub fn find_object_containing(pages: &PageManager, addr: Address) -> Option<ObjectReference> {
    if !pages.in_heap(addr) || !pages.page_type(addr).is_heap() {
        return None;
    }
    let index = pages.page_index(addr);
    let extra = pages.extra(index);
    if extra & CELL_PAGE != 0 {
        let header = unsafe { PageHeader::of(pages.page_address(index)) };
        let object = ObjectReference::from_object_start(header.cell_containing(addr)?);
        return if object_model::load_type_word(object) != 0 {
            Some(object)
        } else {
            None
        };
    }
    // Back to the nearest page whose first object starts at or below addr.
    let mut start_page = index;
    loop {
        let brick = pages.extra(start_page);
        let page = pages.page_address(start_page);
        if brick != NO_OBJECT_START && brick & CELL_PAGE == 0 && page + brick as usize <= addr {
            break;
        }
        if start_page == 0 || !pages.table().page_type(start_page - 1).is_heap() {
            return None;
        }
        start_page -= 1;
    }
    let mut found = None;
    let end = pages.page_address(index) + BYTES_IN_PAGE;
    let mut cursor = pages.page_address(start_page) + pages.extra(start_page) as usize;
    while cursor < end && cursor <= addr {
        if unsafe { cursor.load::<usize>() } == ALIGNMENT_VALUE {
            cursor += BYTES_IN_WORD;
            continue;
        }
        let object = ObjectReference::from_object_start(cursor);
        if object_model::load_type_word(object) == 0 {
            break;
        }
        let size = object_model::size(object);
        if addr < cursor + size {
            found = Some(object);
            break;
        }
        cursor += size;
    }
    found
}
