//! Stacks laid out in memory the way compiled code would, with the code
//! module describing their call sites, for testing the stack scanner and root
//! scanning without compiled code.

use crate::util::alloc::{LocalFreeLists, MutatorAllocState};
use crate::util::constants::BYTES_IN_WORD;
use crate::util::Address;
use crate::vm::stack::frame_descriptor::*;
use crate::vm::stack::{CodeModule, TransitionRecord};
use crate::vm::threads::ThreadContext;

const STACK_WORDS: usize = 4096;
const MODULE_BASE: usize = 0x4000_0000;
const MODULE_SIZE: usize = 0x10_0000;
/// Return addresses into code no module describes.
const UNKNOWN_BASE: usize = 0x6000_0000;
/// The return address of the outermost frame of a segment.
const NATIVE_RETURN: usize = 0x7000_0000;

/// A frame to push, built up with the builder methods.
#[derive(Default)]
pub struct MockFrame {
    omit_fp: bool,
    full: bool,
    unknown: bool,
    locals: Vec<(usize, bool)>,
    args: Vec<(usize, bool)>,
    saves: u8,
    live: u8,
    sets: Vec<(CalleeSaved, usize)>,
}

impl MockFrame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn omit_fp(mut self) -> Self {
        self.omit_fp = true;
        self
    }

    /// Describe the frame with a full descriptor.
    pub fn full(mut self) -> Self {
        self.full = true;
        self
    }

    /// The frame belongs to code no module describes.
    pub fn unknown_code(mut self) -> Self {
        self.unknown = true;
        self
    }

    pub fn local(mut self, value: usize, is_ref: bool) -> Self {
        self.locals.push((value, is_ref));
        self
    }

    pub fn arg(mut self, value: usize, is_ref: bool) -> Self {
        self.args.push((value, is_ref));
        self
    }

    /// The frame saves `reg` in its prologue.
    pub fn save(mut self, reg: CalleeSaved) -> Self {
        self.saves |= reg.bit();
        self
    }

    /// `reg` holds a reference at the frame's call site.
    pub fn live(mut self, reg: CalleeSaved) -> Self {
        self.live |= reg.bit();
        self
    }

    /// The frame puts `value` in `reg` (after saving it, if it does).
    pub fn set_register(mut self, reg: CalleeSaved, value: usize) -> Self {
        self.sets.push((reg, value));
        self
    }
}

struct LaidOutFrame {
    pc: Address,
    known: bool,
    full: bool,
    header: FrameHeader,
    args: Vec<bool>,
    locals: Vec<bool>,
    base: Address,
    top: Address,
}

impl LaidOutFrame {
    /// The frame's stack pointer at its call site is now known.
    fn finalize(&mut self, sp: Address) {
        self.header.frame_words = (self.base - sp) / BYTES_IN_WORD;
    }

    fn describe(&self, module: &mut CodeModule) {
        let offset = (self.pc.as_usize() - MODULE_BASE) as u32;
        if self.full {
            let nsaved = self.header.saved_count() as i32;
            let above = ((self.base - self.top) / BYTES_IN_WORD) as i32;
            let args = self
                .args
                .iter()
                .enumerate()
                .filter(|(_, r)| **r)
                .map(|(i, _)| above + 1 + i as i32);
            let locals = self
                .locals
                .iter()
                .enumerate()
                .filter(|(_, r)| **r)
                .map(|(i, _)| -(nsaved + i as i32 + 1));
            let offsets: Vec<i32> = args.chain(locals).collect();
            module.add_full(offset, FullDescriptor::new(self.header, &offsets));
        } else {
            let bits = |refs: &[bool]| {
                refs.iter()
                    .enumerate()
                    .filter(|(_, r)| **r)
                    .fold(0u64, |acc, (i, _)| acc | 1 << i)
            };
            module.add_compact(
                offset,
                compact(self.header, bits(&self.args) as u8, bits(&self.locals) as u32),
            );
        }
    }
}

/// A thread stack in a heap-allocated array. Frames are pushed outermost first.
pub struct MockStack {
    words: Box<[usize]>,
    sp: Address,
    fp: Address,
    registers: [usize; NUM_CALLEE_SAVED],
    frames: Vec<LaidOutFrame>,
    /// The innermost frame of the current segment.
    current: Option<usize>,
    segment_stop: Address,
    record: Address,
    thread: ThreadContext,
}

impl MockStack {
    pub fn new() -> Self {
        let words = vec![0usize; STACK_WORDS].into_boxed_slice();
        let end = Address::from_ptr(words.as_ptr()) + STACK_WORDS * BYTES_IN_WORD;
        MockStack {
            words,
            sp: end,
            fp: Address::ZERO,
            registers: [0; NUM_CALLEE_SAVED],
            frames: vec![],
            current: None,
            segment_stop: Address::ZERO,
            record: Address::ZERO,
            thread: ThreadContext::new(1, MutatorAllocState::FreeList(LocalFreeLists::new(1))),
        }
    }

    fn push_word(&mut self, value: usize) {
        self.sp -= BYTES_IN_WORD;
        assert!(self.sp >= Address::from_ptr(self.words.as_ptr()), "mock stack overflow");
        unsafe { self.sp.store(value) };
    }

    pub fn push(&mut self, frame: MockFrame) {
        let caller_pc = match self.current {
            Some(i) => self.frames[i].pc.as_usize(),
            None => NATIVE_RETURN,
        };
        for (value, _) in frame.args.iter().rev() {
            self.push_word(*value);
        }
        match self.current {
            Some(i) => self.frames[i].finalize(self.sp),
            None => self.segment_stop = self.sp,
        }
        self.push_word(caller_pc);
        let base = self.sp;
        let top = if frame.omit_fp {
            base
        } else {
            self.push_word(self.fp.as_usize());
            self.fp = self.sp;
            self.sp
        };

        let header = FrameHeader {
            omit_fp: frame.omit_fp,
            saved: frame.saves,
            live: frame.live,
            frame_words: 0,
        };
        for (i, reg) in CalleeSaved::ALL.iter().enumerate() {
            if let Some(slot) = header.save_slot(top, *reg) {
                unsafe { slot.store(self.registers[i]) };
            }
        }
        self.sp = top - header.saved_count() * BYTES_IN_WORD;
        for (reg, value) in &frame.sets {
            self.registers[*reg as usize] = *value;
        }
        for (value, _) in &frame.locals {
            self.push_word(*value);
        }

        let n = self.frames.len() + 1;
        let pc = if frame.unknown {
            UNKNOWN_BASE + 16 * n
        } else {
            MODULE_BASE + 16 * n
        };
        self.frames.push(LaidOutFrame {
            pc: unsafe { Address::from_usize(pc) },
            known: !frame.unknown,
            full: frame.full,
            header,
            args: frame.args.iter().map(|(_, r)| *r).collect(),
            locals: frame.locals.iter().map(|(_, r)| *r).collect(),
            base,
            top,
        });
        self.current = Some(self.frames.len() - 1);
    }

    /// End the current segment with a transition record, as a call into code
    /// the scanner cannot walk does. Later frames start a new segment.
    pub fn transition(&mut self) {
        let i = self.current.take().expect("a segment needs at least one frame");
        self.frames[i].finalize(self.sp);
        let record = TransitionRecord {
            previous: self.record,
            return_address: self.frames[i].pc,
            sp: self.sp,
            fp: self.fp,
            callee_saves: self.registers,
            stop: self.segment_stop,
        };
        self.sp -= std::mem::size_of::<TransitionRecord>();
        unsafe { self.sp.to_mut_ptr::<TransitionRecord>().write(record) };
        self.record = self.sp;
    }

    /// End the last segment and install the record chain in [`Self::thread`].
    pub fn finish(&mut self) {
        self.transition();
        self.thread.set_transition_record(self.record);
    }

    /// Make `thread`'s stack this one. The stack must outlive the thread's use of it.
    pub fn install(&self, thread: &ThreadContext) {
        assert!(!self.record.is_zero(), "the stack is not finished");
        thread.set_transition_record(self.record);
    }

    /// The code module describing every call site of the known frames.
    pub fn code_module(&self) -> CodeModule {
        let mut module = CodeModule::new(
            "mock",
            unsafe { Address::from_usize(MODULE_BASE) },
            MODULE_SIZE,
        );
        for frame in self.frames.iter().filter(|f| f.known) {
            frame.describe(&mut module);
        }
        module
    }

    pub fn thread(&self) -> &ThreadContext {
        &self.thread
    }
}
