//! Allocators: the segregated free list of the mark-sweep collectors and the
//! bump allocator of the generational collector.

pub mod allocator;
pub mod bump_allocator;
pub mod page_header;
pub mod segregated_free_list;
pub mod size_class;

pub use self::allocator::AllocationError;
pub use self::bump_allocator::{BumpAllocator, ChunkSource};
pub use self::segregated_free_list::{LocalFreeLists, SegregatedFreeList};

/// A mutator's allocation state. Which variant a thread carries depends on the
/// heap's collector.
pub enum MutatorAllocState {
    FreeList(LocalFreeLists),
    Bump(BumpAllocator),
}

impl MutatorAllocState {
    pub fn free_lists(&mut self) -> &mut LocalFreeLists {
        match self {
            MutatorAllocState::FreeList(f) => f,
            MutatorAllocState::Bump(_) => panic!("this heap allocates with a bump allocator"),
        }
    }

    pub fn bump(&mut self) -> &mut BumpAllocator {
        match self {
            MutatorAllocState::Bump(b) => b,
            MutatorAllocState::FreeList(_) => panic!("this heap allocates from free lists"),
        }
    }
}
