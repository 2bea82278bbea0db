//! The stop-the-world mark-sweep collector.

mod gc_work;
mod global;

pub use self::global::MarkSweepCollector;
