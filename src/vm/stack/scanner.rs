//! Precise enumeration of the references held in a thread's stack.
//!
//! The stack is a chain of segments, each starting at a [`TransitionRecord`].
//! Within a segment the scanner walks frames from the innermost outward,
//! looking up each frame's descriptor by its return address.
//!
//! Callee-saved registers need care: a register live in a frame may have been
//! saved by any frame further in, or still sit in the transition record. The
//! scanner keeps, per register, the location holding the value of the frame
//! being walked and whether some frame needs that value. The location is
//! visited when a frame saving the register is popped (its save slot then
//! becomes the location for the callers) or when the segment ends. So every
//! location is visited once, however many frames share the value.

use super::activation_table::ActivationRecordTable;
use super::frame_descriptor::*;
use super::transition_record::TransitionRecord;
use crate::util::constants::BYTES_IN_WORD;
use crate::util::Address;
use crate::vm::threads::ThreadContext;

/// Counters of one scan, for logging.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub segments: usize,
    pub frames: usize,
    pub slots: usize,
    /// Frames whose return address no module describes. Such a frame ends its segment.
    pub unresolved: usize,
}

#[derive(Copy, Clone)]
struct RegisterState {
    location: Address,
    pending: bool,
}

pub struct StackScanner<'a> {
    table: &'a ActivationRecordTable,
    summary: ScanSummary,
}

impl<'a> StackScanner<'a> {
    pub fn new(table: &'a ActivationRecordTable) -> Self {
        StackScanner {
            table,
            summary: ScanSummary::default(),
        }
    }

    /// Visit the location of every reference held by `thread`'s stack. The
    /// thread must be stopped, dormant, or the caller itself.
    pub fn scan_thread(mut self, thread: &ThreadContext, visitor: &mut dyn FnMut(Address)) -> ScanSummary {
        let mut record = thread.transition_record();
        while !record.is_zero() {
            let r = unsafe { TransitionRecord::at(record) };
            self.scan_segment(r, visitor);
            record = r.previous;
        }
        trace!("thread {}: {:?}", thread.index(), self.summary);
        self.summary
    }

    /// Visit one segment, starting at `record`.
    pub fn scan_segment(&mut self, record: &TransitionRecord, visitor: &mut dyn FnMut(Address)) {
        self.summary.segments += 1;
        let mut registers = [RegisterState {
            location: Address::ZERO,
            pending: false,
        }; NUM_CALLEE_SAVED];
        for (i, reg) in registers.iter_mut().enumerate() {
            reg.location = record.callee_save_slot(i);
        }

        let table = self.table;
        let mut pc = record.return_address;
        let mut sp = record.sp;
        let mut fp = record.fp;
        while !pc.is_zero() && sp < record.stop {
            let next = table.with_descriptor(pc, |descriptor| {
                let descriptor = descriptor?;
                Some(self.scan_frame(&descriptor, sp, fp, &mut registers, visitor))
            });
            match next {
                Some((caller_pc, caller_sp, caller_fp)) => {
                    pc = caller_pc;
                    sp = caller_sp;
                    fp = caller_fp;
                }
                None => {
                    debug!("no descriptor for return address {}, segment ends", pc);
                    self.summary.unresolved += 1;
                    break;
                }
            }
        }

        for reg in registers.iter().filter(|r| r.pending) {
            self.summary.slots += 1;
            visitor(reg.location);
        }
    }

    /// Visit one frame and return the caller's pc, sp and fp.
    fn scan_frame(
        &mut self,
        descriptor: &FrameDescriptor,
        sp: Address,
        fp: Address,
        registers: &mut [RegisterState; NUM_CALLEE_SAVED],
        visitor: &mut dyn FnMut(Address),
    ) -> (Address, Address, Address) {
        self.summary.frames += 1;
        let header = descriptor.header();
        let (base, top) = if header.omit_fp {
            let base = sp + header.frame_words * BYTES_IN_WORD;
            (base, base)
        } else {
            (fp + BYTES_IN_WORD, fp)
        };

        descriptor.visit_slots(base, top, |slot| {
            self.summary.slots += 1;
            visitor(slot)
        });

        for (i, reg) in CalleeSaved::ALL.iter().enumerate() {
            if header.live & reg.bit() != 0 {
                registers[i].pending = true;
            }
            if let Some(slot) = header.save_slot(top, *reg) {
                if registers[i].pending {
                    self.summary.slots += 1;
                    visitor(registers[i].location);
                }
                registers[i] = RegisterState {
                    location: slot,
                    pending: false,
                };
            }
        }

        let caller_pc = unsafe { base.load::<Address>() };
        let caller_fp = if header.omit_fp {
            fp
        } else {
            unsafe { fp.load::<Address>() }
        };
        (caller_pc, base + BYTES_IN_WORD, caller_fp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::mock_stack::{MockFrame, MockStack};
    use std::collections::HashMap;

    /// The values found at every visited location, with the visit count of each location.
    fn scan(stack: &MockStack) -> (Vec<usize>, HashMap<Address, usize>, ScanSummary) {
        let table = ActivationRecordTable::new();
        table.register(stack.code_module());
        let mut values = vec![];
        let mut visits = HashMap::new();
        let summary = StackScanner::new(&table).scan_thread(stack.thread(), &mut |slot| {
            values.push(unsafe { slot.load::<usize>() });
            *visits.entry(slot).or_insert(0) += 1;
        });
        values.sort();
        (values, visits, summary)
    }

    #[test]
    fn locals_and_arguments() {
        let mut stack = MockStack::new();
        stack.push(MockFrame::new().local(0x11, true).local(0x12, false).arg(0x13, true));
        stack.push(MockFrame::new().omit_fp().local(0x21, true).local(0x22, true));
        stack.finish();
        let (values, visits, summary) = scan(&stack);
        assert_eq!(values, vec![0x11, 0x13, 0x21, 0x22]);
        assert!(visits.values().all(|n| *n == 1));
        assert_eq!(summary.frames, 2);
        assert_eq!(summary.unresolved, 0);
    }

    #[test]
    fn live_registers_are_visited_once() {
        let mut stack = MockStack::new();
        // The outer frame keeps a reference in rbx and calls a frame that saves rbx.
        stack.push(MockFrame::new().set_register(CalleeSaved::Rbx, 0xA0).live(CalleeSaved::Rbx));
        stack.push(
            MockFrame::new()
                .save(CalleeSaved::Rbx)
                .set_register(CalleeSaved::Rbx, 0xB0)
                .live(CalleeSaved::Rbx),
        );
        // Two frames share r12 from the transition record.
        stack.push(MockFrame::new().set_register(CalleeSaved::R12, 0xC0).live(CalleeSaved::R12));
        stack.push(MockFrame::new().omit_fp().live(CalleeSaved::R12));
        stack.finish();
        let (values, visits, _) = scan(&stack);
        assert_eq!(values, vec![0xA0, 0xB0, 0xC0]);
        assert!(visits.values().all(|n| *n == 1));
    }

    #[test]
    fn full_descriptors() {
        let mut stack = MockStack::new();
        stack.push(MockFrame::new().full().local(0x31, true).local(0x32, false).arg(0x33, true));
        stack.push(MockFrame::new().omit_fp().full().local(0x41, true));
        stack.finish();
        let (values, _, summary) = scan(&stack);
        assert_eq!(values, vec![0x31, 0x33, 0x41]);
        assert_eq!(summary.frames, 2);
    }

    #[test]
    fn segments_and_unknown_code() {
        let mut stack = MockStack::new();
        stack.push(MockFrame::new().local(0x51, true));
        stack.transition();
        stack.push(MockFrame::new().unknown_code().local(0x71, true));
        stack.push(MockFrame::new().set_register(CalleeSaved::R15, 0x61).live(CalleeSaved::R15));
        stack.finish();
        let (values, _, summary) = scan(&stack);
        // the walk stops at the frame in unknown code, but still visits pending registers
        assert_eq!(values, vec![0x51, 0x61]);
        assert_eq!(summary.segments, 2);
        assert_eq!(summary.unresolved, 1);
    }
}
