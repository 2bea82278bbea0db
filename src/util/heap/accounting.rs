use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

/// Page usage of a page manager.
///
/// `in_use` counts pages handed out and not yet released. `committed` counts
/// pages that may be backed by physical memory: pages in use plus unused pages
/// that were released dirty and not decommitted since.
pub struct PageAccounting {
    in_use: AtomicUsize,
    committed: AtomicUsize,
}

impl PageAccounting {
    pub fn new() -> Self {
        Self {
            in_use: AtomicUsize::new(0),
            committed: AtomicUsize::new(0),
        }
    }

    /// Pages were handed out; `newly_committed` of them were not backed before.
    pub fn acquire(&self, pages: usize, newly_committed: usize) {
        debug_assert!(newly_committed <= pages);
        self.in_use.fetch_add(pages, Ordering::Relaxed);
        self.committed.fetch_add(newly_committed, Ordering::Relaxed);
    }

    /// Pages came back. Clean pages are counted as no longer committed.
    pub fn release(&self, pages: usize, clean: bool) {
        let _prev = self.in_use.fetch_sub(pages, Ordering::Relaxed);
        debug_assert!(_prev >= pages);
        if clean {
            self.uncommit(pages);
        }
    }

    /// Dirty unused pages were returned to the OS.
    pub fn uncommit(&self, pages: usize) {
        let _prev = self.committed.fetch_sub(pages, Ordering::Relaxed);
        debug_assert!(_prev >= pages);
    }

    pub fn get_in_use_pages(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    pub fn get_committed_pages(&self) -> usize {
        self.committed.load(Ordering::Relaxed)
    }
}

impl Default for PageAccounting {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_release() {
        let pa = PageAccounting::new();
        pa.acquire(10, 4);
        assert_eq!(pa.get_in_use_pages(), 10);
        assert_eq!(pa.get_committed_pages(), 4);
        pa.release(3, false);
        assert_eq!(pa.get_in_use_pages(), 7);
        assert_eq!(pa.get_committed_pages(), 4);
        pa.release(2, true);
        assert_eq!(pa.get_committed_pages(), 2);
        pa.uncommit(2);
        assert_eq!(pa.get_committed_pages(), 0);
    }
}
