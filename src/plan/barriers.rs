//! Write barriers.
//!
//! Every reference store the runtime performs on the heap goes through the
//! [`WriteBarrier`] of the heap's collector. A barrier only says what happens
//! around a single slot write ([`WriteBarrier::on_reference_write`]); the bulk
//! operations (array copy and zero, struct copy and zero) are provided methods
//! built on the single-slot path, so every barrier treats them the same way.

use super::concurrent::colors::MarkState;
use super::generational::card_table::CardTable;
use super::generational::remset::RememberedSet;
use super::reference_processor::WeakHandle;
use crate::util::constants::*;
use crate::util::heap::PageManager;
use crate::util::memory;
use crate::util::{Address, ObjectReference};
use crate::vm::object_model;
use crate::vm::reference_visitor::{visit_struct_fields, OffsetFilter};
use crate::vm::type_descriptor::{TypeDescriptor, TypeKind};
use crate::vm::ThreadContext;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Store buffer entries a thread keeps before handing them to the remembered set.
pub const STORE_BUFFER_CAPACITY: usize = 1024;

pub trait WriteBarrier: Send + Sync {
    /// Whether stores must report the value they overwrite. Stores then swap
    /// the slot atomically.
    fn needs_old_value(&self) -> bool {
        false
    }

    /// `slot` now holds `new` and held `old` before. `old` is null unless
    /// [`Self::needs_old_value`] asked for it.
    fn on_reference_write(
        &self,
        thread: &ThreadContext,
        slot: Address,
        old: ObjectReference,
        new: ObjectReference,
    );

    /// A mutator read `target` out of a weak handle.
    fn on_weak_load(&self, _thread: &ThreadContext, _target: ObjectReference) {}

    /// Hand buffered barrier state of `thread` to the collector.
    fn flush(&self, _thread: &ThreadContext) {}

    fn write_reference(&self, thread: &ThreadContext, slot: Address, value: ObjectReference) {
        if self.needs_old_value() {
            let old = swap_raw(slot, value);
            self.on_reference_write(thread, slot, old, value);
        } else {
            object_model::store_reference(slot, value);
            self.on_reference_write(thread, slot, ObjectReference::NULL, value);
        }
    }

    /// Store `new` if the slot holds `expected`. Returns the previous value,
    /// `Ok` if the store happened.
    fn compare_exchange_reference(
        &self,
        thread: &ThreadContext,
        slot: Address,
        expected: ObjectReference,
        new: ObjectReference,
    ) -> Result<ObjectReference, ObjectReference> {
        let result = unsafe {
            slot.compare_exchange::<AtomicUsize>(
                expected.value(),
                new.value(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
        }
        .map(to_reference)
        .map_err(to_reference);
        if result.is_ok() {
            self.on_reference_write(thread, slot, expected, new);
        }
        result
    }

    fn swap_reference(
        &self,
        thread: &ThreadContext,
        slot: Address,
        value: ObjectReference,
    ) -> ObjectReference {
        let old = swap_raw(slot, value);
        self.on_reference_write(thread, slot, old, value);
        old
    }

    /// Copy `count` reference elements from `src` to `dst`. The ranges may overlap.
    fn array_copy(&self, thread: &ThreadContext, src: Address, dst: Address, count: usize) {
        let copy_one = |i: usize| {
            let value = object_model::load_reference(src + i * BYTES_IN_WORD);
            self.write_reference(thread, dst + i * BYTES_IN_WORD, value);
        };
        if dst > src {
            (0..count).rev().for_each(copy_one)
        } else {
            (0..count).for_each(copy_one)
        }
    }

    /// Null `count` reference elements from `dst`.
    fn array_zero(&self, thread: &ThreadContext, dst: Address, count: usize) {
        for i in 0..count {
            self.write_reference(thread, dst + i * BYTES_IN_WORD, ObjectReference::NULL);
        }
    }

    /// Copy the unboxed struct of type `ty` at `src` to `dst`. Reference
    /// fields go through the barrier, the rest is copied as bytes.
    fn struct_copy(
        &self,
        thread: &ThreadContext,
        ty: &'static TypeDescriptor,
        src: Address,
        dst: Address,
    ) {
        let mut cursor = 0;
        for offset in struct_reference_offsets(ty) {
            copy_bytes(src + cursor, dst + cursor, offset - cursor);
            let value = object_model::load_reference(src + offset);
            self.write_reference(thread, dst + offset, value);
            cursor = offset + BYTES_IN_WORD;
        }
        copy_bytes(src + cursor, dst + cursor, ty.base_size - cursor);
    }

    fn struct_zero(&self, thread: &ThreadContext, ty: &'static TypeDescriptor, dst: Address) {
        let mut cursor = 0;
        for offset in struct_reference_offsets(ty) {
            memory::zero(dst + cursor, offset - cursor);
            self.write_reference(thread, dst + offset, ObjectReference::NULL);
            cursor = offset + BYTES_IN_WORD;
        }
        memory::zero(dst + cursor, ty.base_size - cursor);
    }

    /// The target of a weak handle, null once the target has died.
    fn load_weak_reference(&self, thread: &ThreadContext, handle: &WeakHandle) -> ObjectReference {
        let target = handle.target();
        if !target.is_null() {
            self.on_weak_load(thread, target);
        }
        target
    }
}

fn to_reference(raw: usize) -> ObjectReference {
    ObjectReference::from_raw_address(unsafe { Address::from_usize(raw) })
}

fn swap_raw(slot: Address, value: ObjectReference) -> ObjectReference {
    to_reference(unsafe { slot.atomic_swap::<AtomicUsize>(value.value(), Ordering::SeqCst) })
}

fn copy_bytes(src: Address, dst: Address, len: usize) {
    if len > 0 {
        unsafe { std::ptr::copy(src.to_ptr::<u8>(), dst.to_mut_ptr::<u8>(), len) }
    }
}

/// Byte offsets of the reference fields of a struct type, ascending.
fn struct_reference_offsets(ty: &'static TypeDescriptor) -> Vec<usize> {
    debug_assert_eq!(ty.kind, TypeKind::Struct);
    let mut offsets = vec![];
    let mut push = |offset: usize| offsets.push(offset);
    // Only offsets are reported; the address is never dereferenced.
    visit_struct_fields(&mut OffsetFilter(&mut push), ty, Address::ZERO + BYTES_IN_WORD);
    offsets.sort_unstable();
    offsets
}

/// Plain stores, for the mark-sweep collector.
pub struct NoBarrier;

impl WriteBarrier for NoBarrier {
    fn on_reference_write(&self, _: &ThreadContext, _: Address, _: ObjectReference, _: ObjectReference) {}
}

/// The generation of the heap page holding `addr`, if it is a live heap page.
fn generation_at(pages: &PageManager, addr: Address) -> Option<u8> {
    if !pages.in_heap(addr) {
        return None;
    }
    pages.page_type(addr).generation()
}

/// Records slots of older generations that receive a reference to a younger
/// object in the storing thread's store buffer.
pub struct GenerationalBarrier {
    pages: Arc<PageManager>,
    remset: Arc<RememberedSet>,
}

impl GenerationalBarrier {
    pub fn new(pages: Arc<PageManager>, remset: Arc<RememberedSet>) -> Self {
        GenerationalBarrier { pages, remset }
    }
}

impl WriteBarrier for GenerationalBarrier {
    fn on_reference_write(
        &self,
        thread: &ThreadContext,
        slot: Address,
        _old: ObjectReference,
        new: ObjectReference,
    ) {
        if new.is_null() {
            return;
        }
        let slot_generation = match generation_at(&self.pages, slot) {
            Some(g) if g > 0 => g,
            _ => return,
        };
        match generation_at(&self.pages, new.to_raw_address()) {
            Some(g) if g < slot_generation => {}
            _ => return,
        }
        let mut buffer = thread.barrier_buffer.borrow_mut();
        buffer.push(slot);
        if buffer.len() >= STORE_BUFFER_CAPACITY {
            self.remset.add_all(&mut buffer);
        }
    }

    fn flush(&self, thread: &ThreadContext) {
        self.remset.add_all(&mut thread.barrier_buffer.borrow_mut());
    }
}

/// Dirties the card of every reference store into the heap.
pub struct AllCardsBarrier {
    pages: Arc<PageManager>,
    cards: Arc<CardTable>,
}

impl AllCardsBarrier {
    pub fn new(pages: Arc<PageManager>, cards: Arc<CardTable>) -> Self {
        AllCardsBarrier { pages, cards }
    }
}

impl WriteBarrier for AllCardsBarrier {
    fn on_reference_write(
        &self,
        _thread: &ThreadContext,
        slot: Address,
        _old: ObjectReference,
        new: ObjectReference,
    ) {
        if !new.is_null() && self.pages.in_heap(slot) {
            self.cards.dirty(slot);
        }
    }
}

/// While the concurrent collector snoops, shades both the overwritten and the
/// stored value, and every object loaded from a weak handle.
pub struct ConcurrentMarkBarrier {
    state: Arc<MarkState>,
}

impl ConcurrentMarkBarrier {
    pub fn new(state: Arc<MarkState>) -> Self {
        ConcurrentMarkBarrier { state }
    }
}

impl WriteBarrier for ConcurrentMarkBarrier {
    fn needs_old_value(&self) -> bool {
        self.state.is_snooping()
    }

    fn on_reference_write(
        &self,
        thread: &ThreadContext,
        _slot: Address,
        old: ObjectReference,
        new: ObjectReference,
    ) {
        if !self.state.is_snooping() {
            return;
        }
        for value in [old, new] {
            if !value.is_null() {
                self.state.shade(value, &thread.gray_queue);
            }
        }
    }

    fn on_weak_load(&self, thread: &ThreadContext, target: ObjectReference) {
        if self.state.is_snooping() {
            self.state.shade(target, &thread.gray_queue);
        }
    }
}
