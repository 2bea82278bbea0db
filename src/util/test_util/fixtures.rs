//! Type descriptors and object builders shared by the unit tests.

// Not every test module uses every helper.
#![allow(dead_code)]

use crate::util::constants::*;
use crate::util::heap::PageManager;
use crate::util::options::PageLockKind;
use crate::util::{Address, ObjectReference};
use crate::vm::object_model;
use crate::vm::type_descriptor::*;
use std::sync::Arc;

/// One reference field: 24 bytes with the pre-header.
pub static NODE: TypeDescriptor = TypeDescriptor::object("Node", 1, sparse(&[1]));
/// Two reference fields and a data word.
pub static PAIR: TypeDescriptor = TypeDescriptor::object("Pair", 3, dense(&[1, 3]));
pub static VECTOR_BYTES: TypeDescriptor = TypeDescriptor::data_vector("byte[]", 1);
pub static REFS: TypeDescriptor = TypeDescriptor::reference_vector("object[]");

/// A page manager over `pages` pages.
pub fn new_page_manager(pages: usize) -> Arc<PageManager> {
    Arc::new(PageManager::new(pages * BYTES_IN_PAGE, PageLockKind::Spin).unwrap())
}

/// Make the zeroed memory at `start` a [`NODE`].
pub fn init_node(start: Address) -> ObjectReference {
    let object = ObjectReference::from_object_start(start);
    object_model::initialize_header(object, &NODE, 0);
    object
}

pub fn init_pair(start: Address) -> ObjectReference {
    let object = ObjectReference::from_object_start(start);
    object_model::initialize_header(object, &PAIR, 0);
    object
}

pub fn init_byte_vector(start: Address, len: usize) -> ObjectReference {
    let object = ObjectReference::from_object_start(start);
    object_model::initialize_header(object, &VECTOR_BYTES, 0);
    object_model::set_length(object, len);
    object
}

pub fn init_refs(start: Address, len: usize) -> ObjectReference {
    let object = ObjectReference::from_object_start(start);
    object_model::initialize_header(object, &REFS, 0);
    object_model::set_length(object, len);
    object
}

/// Reference field `word` of a [`NODE`] or [`PAIR`].
pub fn field(object: ObjectReference, word: usize) -> ObjectReference {
    object_model::load_reference(object_model::field_address(object, word))
}

pub fn set_field(object: ObjectReference, word: usize, value: ObjectReference) {
    object_model::store_reference(object_model::field_address(object, word), value)
}
