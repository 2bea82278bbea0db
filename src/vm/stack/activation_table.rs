//! Per-module tables mapping return addresses to frame descriptors.

use super::frame_descriptor::*;
use crate::util::Address;
use std::sync::RwLock;

/// The call sites of one contiguous block of generated code.
pub struct CodeModule {
    name: String,
    base: Address,
    size: usize,
    /// Return-address offsets from `base`, sorted.
    offsets: Vec<u32>,
    /// The descriptor word of each offset.
    words: Vec<u64>,
    full: Vec<FullDescriptor>,
}

impl CodeModule {
    pub fn new(name: impl Into<String>, base: Address, size: usize) -> Self {
        CodeModule {
            name: name.into(),
            base,
            size,
            offsets: vec![],
            words: vec![],
            full: vec![],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base(&self) -> Address {
        self.base
    }

    pub fn contains(&self, pc: Address) -> bool {
        pc >= self.base && pc < self.base + self.size
    }

    fn insert(&mut self, offset: u32, word: u64) {
        assert!((offset as usize) < self.size, "call site outside {}", self.name);
        match self.offsets.binary_search(&offset) {
            Ok(_) => panic!("call site {:#x} of {} described twice", offset, self.name),
            Err(i) => {
                self.offsets.insert(i, offset);
                self.words.insert(i, word);
            }
        }
    }

    pub fn add_compact(&mut self, offset: u32, word: u64) {
        assert!(!is_escape(word), "a compact descriptor cannot have the escape bit");
        self.insert(offset, word)
    }

    pub fn add_full(&mut self, offset: u32, descriptor: FullDescriptor) {
        self.full.push(descriptor);
        self.insert(offset, escape(self.full.len() - 1))
    }

    /// The descriptor of the call site returning to `pc`.
    pub fn lookup(&self, pc: Address) -> Option<FrameDescriptor<'_>> {
        if !self.contains(pc) {
            return None;
        }
        let offset = (pc - self.base) as u32;
        let i = self.offsets.binary_search(&offset).ok()?;
        let word = self.words[i];
        Some(if is_escape(word) {
            FrameDescriptor::Full(&self.full[escape_index(word)])
        } else {
            FrameDescriptor::Compact(word)
        })
    }
}

/// All code modules, sorted by base address.
#[derive(Default)]
pub struct ActivationRecordTable {
    modules: RwLock<Vec<CodeModule>>,
}

impl ActivationRecordTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, module: CodeModule) {
        let mut modules = self.modules.write().unwrap_or_else(|e| e.into_inner());
        let i = modules.partition_point(|m| m.base < module.base);
        let overlaps_prev = i > 0 && modules[i - 1].contains(module.base);
        let overlaps_next = i < modules.len() && module.contains(modules[i].base);
        assert!(
            !overlaps_prev && !overlaps_next,
            "code module {} overlaps another module",
            module.name
        );
        debug!(
            "code module {} at {} with {} call sites",
            module.name,
            module.base,
            module.offsets.len()
        );
        modules.insert(i, module);
    }

    pub fn unregister(&self, base: Address) {
        let mut modules = self.modules.write().unwrap_or_else(|e| e.into_inner());
        modules.retain(|m| m.base != base);
    }

    /// Find the descriptor of `pc` and pass it to `f`. `f` gets `None` if no
    /// module describes `pc`.
    pub fn with_descriptor<R>(&self, pc: Address, f: impl FnOnce(Option<FrameDescriptor>) -> R) -> R {
        let modules = self.modules.read().unwrap_or_else(|e| e.into_inner());
        let i = modules.partition_point(|m| m.base <= pc);
        let descriptor = if i == 0 { None } else { modules[i - 1].lookup(pc) };
        f(descriptor)
    }
}
