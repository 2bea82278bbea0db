//! Pieces shared by the tracing loops of the collectors.

use crate::util::ObjectReference;

/// A thread-local stack of gray objects.
///
/// Concurrent markers spill to a shared queue once the stack reaches
/// [`MarkStack::SPILL_LEN`] entries; the stop-the-world collectors never spill.
#[derive(Default)]
pub struct MarkStack {
    objects: Vec<ObjectReference>,
}

impl MarkStack {
    pub const SPILL_LEN: usize = 4096;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether the owner should hand some of its work to others.
    #[inline(always)]
    pub fn is_full(&self) -> bool {
        self.objects.len() >= Self::SPILL_LEN
    }

    #[inline(always)]
    pub fn push(&mut self, object: ObjectReference) {
        if self.objects.capacity() == 0 {
            self.objects.reserve(Self::SPILL_LEN);
        }
        self.objects.push(object);
    }

    #[inline(always)]
    pub fn pop(&mut self) -> Option<ObjectReference> {
        self.objects.pop()
    }

    /// Empty the stack, returning what it held.
    pub fn take(&mut self) -> Vec<ObjectReference> {
        std::mem::take(&mut self.objects)
    }
}

/// What weak-reference and finalization processing needs from a collection
/// in progress.
pub trait ObjectTracer {
    /// Where `object` lives after this collection, or `None` if nothing has
    /// kept it alive so far.
    fn live_location(&self, object: ObjectReference) -> Option<ObjectReference>;

    /// Keep `object` alive and queue it for scanning, as if it were a root.
    /// Returns its location after the collection.
    fn trace_object(&mut self, object: ObjectReference) -> ObjectReference;

    /// Trace everything queued since the last call.
    fn complete_closure(&mut self);
}
