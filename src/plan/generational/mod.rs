//! The generational copying collector.

pub mod card_table;
mod gc_work;
mod global;
pub mod remset;

pub use self::global::GenerationalCollector;
