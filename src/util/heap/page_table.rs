//! One packed entry per page of the reserved heap.
//!
//! ```text
//!  31            16 15      8 7       0
//! +----------------+---------+---------+
//! |     extra      | process |  type   |
//! +----------------+---------+---------+
//! ```

use crate::util::constants::*;
use crate::util::Address;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// `extra` of a page in which no object starts (it continues an earlier object,
/// or it is a segregated page seen by a brick walker).
pub const NO_OBJECT_START: u16 = 0x7FFF;
/// `extra` flag of a segregated free-list page; the low bits hold the size class.
pub const CELL_PAGE: u16 = 0x8000;

#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub enum PageType {
    /// Above the high-water mark, never handed out.
    Unallocated,
    /// In the free-region index, known to read as zero (apart from region headers).
    UnusedClean,
    /// In the free-region index, contents unknown.
    UnusedDirty,
    /// Runtime data that is not a heap object (tables, thread records).
    System,
    /// A thread stack. `extra` is the thread index.
    Stack,
    /// A live heap page of the given generation (or owner, for the non-generational collectors).
    Owner(u8),
    /// A from-space page of the given generation during a generational collection.
    Zombie(u8),
}

const OWNER_BASE: u8 = 0x10;
const ZOMBIE_BASE: u8 = 0x20;

impl PageType {
    pub const fn to_raw(self) -> u8 {
        match self {
            PageType::Unallocated => 0,
            PageType::UnusedClean => 1,
            PageType::UnusedDirty => 2,
            PageType::System => 3,
            PageType::Stack => 4,
            PageType::Owner(g) => OWNER_BASE + g,
            PageType::Zombie(g) => ZOMBIE_BASE + g,
        }
    }

    pub fn from_raw(raw: u8) -> PageType {
        match raw {
            0 => PageType::Unallocated,
            1 => PageType::UnusedClean,
            2 => PageType::UnusedDirty,
            3 => PageType::System,
            4 => PageType::Stack,
            r if (OWNER_BASE..OWNER_BASE + MAX_GENERATIONS as u8).contains(&r) => {
                PageType::Owner(r - OWNER_BASE)
            }
            r if (ZOMBIE_BASE..ZOMBIE_BASE + MAX_GENERATIONS as u8).contains(&r) => {
                PageType::Zombie(r - ZOMBIE_BASE)
            }
            _ => panic!("corrupt page type {:#x}", raw),
        }
    }

    pub const fn is_unused(self) -> bool {
        matches!(self, PageType::UnusedClean | PageType::UnusedDirty)
    }

    /// Pages holding objects, live or condemned.
    pub const fn is_heap(self) -> bool {
        matches!(self, PageType::Owner(_) | PageType::Zombie(_))
    }

    pub const fn generation(self) -> Option<u8> {
        match self {
            PageType::Owner(g) => Some(g),
            _ => None,
        }
    }
}

impl fmt::Debug for PageType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PageType::Unallocated => write!(f, "Unallocated"),
            PageType::UnusedClean => write!(f, "UnusedClean"),
            PageType::UnusedDirty => write!(f, "UnusedDirty"),
            PageType::System => write!(f, "System"),
            PageType::Stack => write!(f, "Stack"),
            PageType::Owner(g) => write!(f, "Owner({})", g),
            PageType::Zombie(g) => write!(f, "Zombie({})", g),
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct PageEntry {
    pub page_type: PageType,
    pub process: u8,
    pub extra: u16,
}

impl PageEntry {
    const fn pack(self) -> u32 {
        self.page_type.to_raw() as u32 | (self.process as u32) << 8 | (self.extra as u32) << 16
    }

    fn unpack(raw: u32) -> PageEntry {
        PageEntry {
            page_type: PageType::from_raw(raw as u8),
            process: (raw >> 8) as u8,
            extra: (raw >> 16) as u16,
        }
    }
}

pub struct PageTable {
    base: Address,
    entries: Box<[AtomicU32]>,
}

impl PageTable {
    pub fn new(base: Address, pages: usize) -> Self {
        debug_assert!(base.is_aligned_to(BYTES_IN_PAGE));
        PageTable {
            base,
            entries: (0..pages).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    pub fn base(&self) -> Address {
        self.base
    }

    pub fn pages(&self) -> usize {
        self.entries.len()
    }

    pub fn limit(&self) -> Address {
        self.base + (self.entries.len() << LOG_BYTES_IN_PAGE)
    }

    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.base && addr < self.limit()
    }

    pub fn page_index(&self, addr: Address) -> usize {
        debug_assert!(self.contains(addr), "{} is outside the heap", addr);
        (addr - self.base) >> LOG_BYTES_IN_PAGE
    }

    pub fn page_address(&self, index: usize) -> Address {
        debug_assert!(index <= self.entries.len());
        self.base + (index << LOG_BYTES_IN_PAGE)
    }

    pub fn entry(&self, index: usize) -> PageEntry {
        PageEntry::unpack(self.entries[index].load(Ordering::Acquire))
    }

    pub fn set_entry(&self, index: usize, entry: PageEntry) {
        self.entries[index].store(entry.pack(), Ordering::Release)
    }

    pub fn page_type(&self, index: usize) -> PageType {
        self.entry(index).page_type
    }

    pub fn extra(&self, index: usize) -> u16 {
        self.entry(index).extra
    }

    fn update(&self, index: usize, f: impl Fn(PageEntry) -> PageEntry) {
        let _ = self.entries[index].fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
            Some(f(PageEntry::unpack(raw)).pack())
        });
    }

    pub fn set_page_type(&self, index: usize, page_type: PageType) {
        self.update(index, |e| PageEntry { page_type, ..e })
    }

    pub fn set_extra(&self, index: usize, extra: u16) {
        self.update(index, |e| PageEntry { extra, ..e })
    }

    /// Set every page of `[start, start + count)` to the same entry.
    pub fn set_range(&self, start: usize, count: usize, entry: PageEntry) {
        let raw = entry.pack();
        for e in &self.entries[start..start + count] {
            e.store(raw, Ordering::Release);
        }
    }
}
