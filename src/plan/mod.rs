//! Garbage collectors.
//!
//! A heap runs one [`Collector`]. Every collector allocates from pages of the
//! shared [`PageManager`](crate::util::heap::PageManager), finds its roots
//! through the [`GcContext`] and processes weak handles and finalization
//! through the same [`ReferenceProcessor`]. They differ in how they
//! allocate, trace and reclaim:
//!
//! * [`MarkSweepCollector`]: stop-the-world, non-moving, free-list allocation.
//! * [`GenerationalCollector`]: stop-the-world, copying, bump allocation into
//!   a nursery, with a remembered set or a card table for old-to-young pointers.
//! * [`ConcurrentMSCollector`]: marking and sweeping on background threads,
//!   synchronized with mutators by handshakes.

pub mod barriers;
pub mod collector;
pub mod concurrent;
pub mod generational;
pub mod global;
pub mod marksweep;
pub mod reference_processor;
pub mod stop_the_world;
pub mod tracing;
pub mod verify;

pub use self::barriers::WriteBarrier;
pub use self::collector::{Collector, Phase};
pub use self::concurrent::ConcurrentMSCollector;
pub use self::generational::GenerationalCollector;
pub use self::global::{create_collector, GcContext};
pub use self::marksweep::MarkSweepCollector;
pub use self::reference_processor::{ReferenceProcessor, WeakHandle, WeakKind};
pub use self::verify::{Census, CensusProfiler, HeapProfiler, HeapSummary};
