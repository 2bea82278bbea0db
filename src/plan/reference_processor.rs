//! Weak handles and finalization.
//!
//! Every collector runs [`ReferenceProcessor::process`] once its transitive
//! closure is complete:
//!
//! 1. short weak handles to dead objects are cleared,
//! 2. dead finalization candidates become ready for finalization and are
//!    kept alive, with everything they reach (the closure is completed again),
//! 3. long weak handles to objects that are still dead are cleared.
//!
//! So a long weak handle follows an object through its resurrection by a
//! finalizer while a short one does not. Objects ready for finalization stay
//! roots until the runtime takes them with [`ReferenceProcessor::pop_ready`].

use crate::plan::tracing::ObjectTracer;
use crate::util::ObjectReference;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WeakKind {
    /// Cleared before finalization.
    Short,
    /// Cleared after finalization; survives resurrection.
    Long,
}

struct WeakCell {
    target: AtomicUsize,
    kind: WeakKind,
}

/// A weak reference owned by the runtime. Dropping the handle unregisters it.
pub struct WeakHandle {
    cell: Arc<WeakCell>,
}

impl WeakHandle {
    pub fn kind(&self) -> WeakKind {
        self.cell.kind
    }

    /// The target, without any read barrier. Mutators load weak handles
    /// through the heap, which applies its collector's barrier.
    pub fn target(&self) -> ObjectReference {
        ObjectReference::from_raw_address(unsafe {
            crate::util::Address::from_usize(self.cell.target.load(Ordering::SeqCst))
        })
    }
}

impl std::fmt::Debug for WeakHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?} weak handle to {}", self.cell.kind, self.target())
    }
}

#[derive(Default)]
pub struct ReferenceProcessor {
    weak: Mutex<Vec<Weak<WeakCell>>>,
    /// Objects whose finalizer has not run.
    candidates: Mutex<Vec<ObjectReference>>,
    /// Dead objects whose finalizer is due.
    ready: Mutex<Vec<ObjectReference>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl ReferenceProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_weak_handle(&self, target: ObjectReference, kind: WeakKind) -> WeakHandle {
        let cell = Arc::new(WeakCell {
            target: AtomicUsize::new(target.value()),
            kind,
        });
        lock(&self.weak).push(Arc::downgrade(&cell));
        WeakHandle { cell }
    }

    /// Run a finalizer for `object` once it becomes unreachable.
    pub fn register_finalizer(&self, object: ObjectReference) {
        debug_assert!(!object.is_null());
        lock(&self.candidates).push(object);
    }

    /// Take an object whose finalizer is due. It is no longer a root once taken.
    pub fn pop_ready(&self) -> Option<ObjectReference> {
        lock(&self.ready).pop()
    }

    pub fn ready_count(&self) -> usize {
        lock(&self.ready).len()
    }

    pub fn candidate_count(&self) -> usize {
        lock(&self.candidates).len()
    }

    /// Live weak handles, dropping dead registrations on the way.
    pub fn weak_count(&self) -> usize {
        let mut weak = lock(&self.weak);
        weak.retain(|w| w.strong_count() > 0);
        weak.len()
    }

    /// Report the objects ready for finalization as roots. `f` returns the
    /// location of each after the collection.
    pub fn scan_ready(&self, mut f: impl FnMut(ObjectReference) -> ObjectReference) {
        for object in lock(&self.ready).iter_mut() {
            *object = f(*object);
        }
    }

    /// Clear or update the weak handles of `kind`. Returns how many were cleared.
    pub fn scan_weak(&self, kind: WeakKind, tracer: &dyn ObjectTracer) -> usize {
        let mut cleared = 0;
        let mut weak = lock(&self.weak);
        weak.retain(|w| {
            let cell = match w.upgrade() {
                Some(cell) => cell,
                None => return false,
            };
            if cell.kind != kind {
                return true;
            }
            let target = cell.target.load(Ordering::SeqCst);
            if target == 0 {
                return true;
            }
            let object = ObjectReference::from_raw_address(unsafe {
                crate::util::Address::from_usize(target)
            });
            match tracer.live_location(object) {
                Some(new) => cell.target.store(new.value(), Ordering::SeqCst),
                None => {
                    cell.target.store(0, Ordering::SeqCst);
                    cleared += 1;
                }
            }
            true
        });
        cleared
    }

    /// Move dead candidates to the ready list and keep them alive. Returns how
    /// many were resurrected; the caller completes the closure.
    pub fn scan_finalizable(&self, tracer: &mut dyn ObjectTracer) -> usize {
        let mut candidates = lock(&self.candidates);
        let mut newly_ready = vec![];
        candidates.retain_mut(|object| match tracer.live_location(*object) {
            Some(new) => {
                *object = new;
                true
            }
            None => {
                newly_ready.push(*object);
                false
            }
        });
        drop(candidates);
        let resurrected = newly_ready.len();
        let mut ready = lock(&self.ready);
        for object in newly_ready {
            ready.push(tracer.trace_object(object));
        }
        if resurrected > 0 {
            debug!("{} objects are ready for finalization", resurrected);
        }
        resurrected
    }

    /// Weak handles and finalization, in the order described above.
    pub fn process(&self, tracer: &mut dyn ObjectTracer) {
        let short = self.scan_weak(WeakKind::Short, tracer);
        if self.scan_finalizable(tracer) > 0 {
            tracer.complete_closure();
        }
        let long = self.scan_weak(WeakKind::Long, tracer);
        trace!("cleared {} short and {} long weak handles", short, long);
    }
}
