use crate::util::constants::BYTES_IN_WORD;
use crate::util::Address;
use std::sync::RwLock;

/// Static data areas holding references: every word of a registered area is
/// a reference slot (null or an object reference).
#[derive(Default)]
pub struct StaticRoots {
    areas: RwLock<Vec<(Address, usize)>>,
}

impl StaticRoots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `words` reference slots starting at `start`.
    pub fn add_area(&self, start: Address, words: usize) {
        debug_assert!(start.is_aligned_to(BYTES_IN_WORD));
        self.areas
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((start, words));
    }

    pub fn remove_area(&self, start: Address) {
        let mut areas = self.areas.write().unwrap_or_else(|e| e.into_inner());
        let before = areas.len();
        areas.retain(|(s, _)| *s != start);
        assert!(areas.len() < before, "no static area at {}", start);
    }

    /// Call `f` with every slot of every area.
    pub fn visit_slots(&self, mut f: impl FnMut(Address)) {
        for &(start, words) in self.areas.read().unwrap_or_else(|e| e.into_inner()).iter() {
            for i in 0..words {
                f(start + i * BYTES_IN_WORD);
            }
        }
    }
}
