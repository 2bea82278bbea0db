use crate::plan::tracing::{ObjectTracer, MarkStack};
use crate::util::{Address, ObjectReference};
use crate::vm::object_model;
use crate::vm::reference_visitor::{visit_reference_fields, NonNullFilter};

/// Transitive marking with an explicit mark stack. An object is pushed the
/// moment its mark bit is set, so every object is scanned once.
pub(super) struct MarkTracer {
    stack: MarkStack,
    pub marked: usize,
}

impl MarkTracer {
    pub fn new() -> Self {
        MarkTracer {
            stack: MarkStack::new(),
            marked: 0,
        }
    }
}

impl ObjectTracer for MarkTracer {
    fn live_location(&self, object: ObjectReference) -> Option<ObjectReference> {
        object_model::is_marked(object).then_some(object)
    }

    #[inline]
    fn trace_object(&mut self, object: ObjectReference) -> ObjectReference {
        if object_model::test_and_mark(object) {
            self.marked += 1;
            self.stack.push(object);
        }
        object
    }

    fn complete_closure(&mut self) {
        while let Some(object) = self.stack.pop() {
            visit_reference_fields(
                &mut NonNullFilter(&mut |slot: Address| {
                    self.trace_object(object_model::load_reference(slot));
                }),
                object,
            );
        }
    }
}
