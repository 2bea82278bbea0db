//! Utilities below the collectors: addresses, options, OS memory, the page
//! manager and the allocators.

pub mod address;
pub mod alloc;
pub mod atomic_chain;
pub mod constants;
pub mod conversions;
pub mod heap;
pub mod logger;
pub mod memory;
pub mod options;
pub mod statistics;
#[cfg(test)]
pub mod test_util;

pub use self::address::Address;
pub use self::address::ObjectReference;
