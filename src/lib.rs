#![allow(clippy::new_without_default)]
#![allow(clippy::missing_safety_doc)]

//! rtgc is the memory-management core of a runtime: a page manager, bump and
//! segregated-free-list allocators, and three interchangeable garbage
//! collectors (stop-the-world mark-sweep, generational copying and on-the-fly
//! concurrent mark-sweep) with their write barriers and a precise stack scanner.
//!
//! A runtime builds a [`Heap`] with a [`HeapBuilder`], binds each of its
//! threads with [`Heap::bind_mutator`], describes its types with
//! [`TypeDescriptor`](vm::TypeDescriptor)s and its compiled frames with
//! [`CodeModule`](vm::stack::CodeModule)s, and then allocates and stores
//! references through the heap. [`memory_manager`] has the same operations
//! as free functions.

#[cfg(test)]
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;

pub mod build_info;
mod heap;
pub mod memory_manager;
pub mod plan;
pub mod util;
pub mod vm;

#[cfg(test)]
mod tests;

pub use crate::heap::{Heap, HeapBuilder};
pub use crate::plan::{Collector, Phase};
pub use crate::util::alloc::AllocationError;
pub use crate::util::options::{CollectorSelector, Options};
pub use crate::util::{Address, ObjectReference};
