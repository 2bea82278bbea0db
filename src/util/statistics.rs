//! Collection counters of a heap.

use enum_map::{Enum, EnumMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use strum_macros::Display;

#[derive(Copy, Clone, Debug, Display, Enum, PartialEq, Eq)]
pub enum CollectionKind {
    /// A stop-the-world mark-sweep collection.
    MarkSweep,
    /// A generational collection of the nursery only.
    Nursery,
    /// A generational collection of an older generation (and everything younger).
    Mature,
    /// A concurrent marking cycle.
    ConcurrentCycle,
}

#[derive(Default)]
pub struct GcStats {
    collections: EnumMap<CollectionKind, AtomicUsize>,
    pause_nanos: AtomicU64,
    bytes_freed: AtomicUsize,
    pages_released: AtomicUsize,
}

/// A copy of the counters at one moment.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub collections: EnumMap<CollectionKind, usize>,
    /// Time the world was stopped, or for concurrent cycles the cycle time.
    pub pause_time: Duration,
    pub bytes_freed: usize,
    pub pages_released: usize,
}

impl StatsSnapshot {
    pub fn total_collections(&self) -> usize {
        self.collections.values().sum()
    }
}

impl GcStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, kind: CollectionKind, started: Instant, bytes_freed: usize, pages_released: usize) {
        let elapsed = started.elapsed();
        self.collections[kind].fetch_add(1, Ordering::Relaxed);
        self.pause_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        self.bytes_freed.fetch_add(bytes_freed, Ordering::Relaxed);
        self.pages_released
            .fetch_add(pages_released, Ordering::Relaxed);
        info!(
            "{} collection: {} bytes freed, {} pages released, {:?}",
            kind, bytes_freed, pages_released, elapsed
        );
    }

    pub fn collections(&self, kind: CollectionKind) -> usize {
        self.collections[kind].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            collections: EnumMap::from_fn(|k| self.collections[k].load(Ordering::Relaxed)),
            pause_time: Duration::from_nanos(self.pause_nanos.load(Ordering::Relaxed)),
            bytes_freed: self.bytes_freed.load(Ordering::Relaxed),
            pages_released: self.pages_released.load(Ordering::Relaxed),
        }
    }
}
