use super::frame_descriptor::NUM_CALLEE_SAVED;
use crate::util::Address;

/// Written on the stack where managed code calls out to code the scanner
/// cannot walk (or the thread becomes dormant). It captures the state needed
/// to resume the walk in the managed caller. Records of one thread are linked
/// innermost first.
#[repr(C)]
#[derive(Debug)]
pub struct TransitionRecord {
    /// The next outer record, or zero.
    pub previous: Address,
    /// Where the innermost managed frame of the segment resumes.
    pub return_address: Address,
    /// The stack pointer of that frame.
    pub sp: Address,
    /// The frame pointer register at the transition.
    pub fp: Address,
    /// The callee-saved registers at the transition, in descriptor bit order.
    pub callee_saves: [usize; NUM_CALLEE_SAVED],
    /// The segment ends at the first frame whose stack pointer is at or above this.
    pub stop: Address,
}

impl TransitionRecord {
    /// # Safety
    /// `addr` must be a live transition record.
    pub unsafe fn at<'a>(addr: Address) -> &'a TransitionRecord {
        addr.as_ref::<TransitionRecord>()
    }

    /// The location of the saved value of callee-saved register `index`.
    pub fn callee_save_slot(&self, index: usize) -> Address {
        Address::from_ref(&self.callee_saves[index])
    }
}

static_assertions::const_assert_eq!(memoffset::offset_of!(TransitionRecord, previous), 0);
