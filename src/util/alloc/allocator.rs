use crate::util::constants::*;
use crate::util::Address;
use std::fmt;

/// Written into every word of an alignment gap so that a heap walker can step
/// over it. It is odd, so it is never a valid link or type word.
pub const ALIGNMENT_VALUE: usize = 0xdead_beef_dead_beef;

/// Why an allocation request could not be satisfied. This is returned as a
/// plain value: nothing is allocated on the failure path.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AllocationError {
    /// The heap is full, even after collecting.
    HeapOutOfMemory,
    /// The request is larger than the whole reserved heap.
    MmapOutOfMemory,
}

impl fmt::Display for AllocationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AllocationError::HeapOutOfMemory => write!(f, "out of heap memory"),
            AllocationError::MmapOutOfMemory => {
                write!(f, "allocation request exceeds the reserved heap")
            }
        }
    }
}

impl std::error::Error for AllocationError {}

/// The first address at or above `region` such that `result + offset` is
/// aligned to `align`.
pub fn align_allocation(region: Address, align: usize, offset: usize) -> Address {
    debug_assert!(align >= MIN_ALIGNMENT && align.is_power_of_two());
    let mask = align - 1;
    let delta = (align - ((region.as_usize() + offset) & mask)) & mask;
    region + delta
}

/// Fill `[start, end)` with [`ALIGNMENT_VALUE`].
pub fn fill_alignment_gap(start: Address, end: Address) {
    let mut cursor = start;
    while cursor < end {
        unsafe { cursor.store(ALIGNMENT_VALUE) };
        cursor += BYTES_IN_WORD;
    }
}

/// The worst-case number of bytes needed to place `size` bytes at `align`.
pub fn get_maximum_aligned_size(size: usize, align: usize) -> usize {
    if align <= MIN_ALIGNMENT {
        size
    } else {
        size + align - MIN_ALIGNMENT
    }
}
