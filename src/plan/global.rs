//! The state every collector shares, and collector creation.

use super::collector::Collector;
use super::concurrent::ConcurrentMSCollector;
use super::generational::GenerationalCollector;
use super::marksweep::MarkSweepCollector;
use super::reference_processor::ReferenceProcessor;
use super::verify::HeapProfiler;
use crate::util::heap::{walker, PageManager};
use crate::util::options::{CollectorSelector, Options};
use crate::util::statistics::GcStats;
use crate::util::{Address, ObjectReference};
use crate::vm::object_model;
use crate::vm::stack::{ActivationRecordTable, StackScanner};
use crate::vm::{StaticRoots, ThreadContext, ThreadTable};
use std::sync::{Arc, Mutex};

/// Create the collector selected by the options of `context`.
pub fn create_collector(context: Arc<GcContext>) -> Arc<dyn Collector> {
    match context.options.collector {
        CollectorSelector::MarkSweep => Arc::new(MarkSweepCollector::new(context)),
        CollectorSelector::Generational => Arc::new(GenerationalCollector::new(context)),
        CollectorSelector::Concurrent => ConcurrentMSCollector::new(context),
    }
}

/// Everything a collector works with that is not its own policy: pages,
/// threads, roots, finalization and statistics.
pub struct GcContext {
    pub options: Options,
    pub pages: Arc<PageManager>,
    pub threads: ThreadTable,
    pub statics: StaticRoots,
    pub code: ActivationRecordTable,
    pub references: ReferenceProcessor,
    pub stats: GcStats,
    profiler: Mutex<Option<Box<dyn HeapProfiler>>>,
}

impl GcContext {
    pub fn new(options: Options) -> std::io::Result<Self> {
        let pages = Arc::new(PageManager::new(options.heap_size, options.page_lock)?);
        Ok(GcContext {
            threads: ThreadTable::new(options.max_threads),
            pages,
            statics: StaticRoots::new(),
            code: ActivationRecordTable::new(),
            references: ReferenceProcessor::new(),
            stats: GcStats::new(),
            profiler: Mutex::new(None),
            options,
        })
    }

    /// The object a root value refers to: an exact reference or an interior
    /// pointer. `None` for null, non-heap values and free memory.
    pub fn resolve(&self, value: Address) -> Option<ObjectReference> {
        if value.is_zero() {
            return None;
        }
        walker::find_object_containing(&self.pages, value)
    }

    /// Every static root slot.
    pub fn scan_static_slots(&self, f: &mut dyn FnMut(Address)) {
        self.statics.visit_slots(f)
    }

    /// The stack slots of `thread`, which must be stopped, dormant or the caller.
    pub fn scan_thread_slots(&self, thread: &ThreadContext, f: &mut dyn FnMut(Address)) {
        StackScanner::new(&self.code).scan_thread(thread, f);
    }

    /// Static slots and the stack slots of every registered thread.
    pub fn scan_all_slots(&self, f: &mut dyn FnMut(Address)) {
        self.scan_static_slots(f);
        for thread in self.threads.snapshot() {
            self.scan_thread_slots(&thread, f);
        }
    }

    pub fn set_profiler(&self, profiler: Option<Box<dyn HeapProfiler>>) {
        *self.profiler.lock().unwrap_or_else(|e| e.into_inner()) = profiler;
    }

    /// Show the heap to the installed profiler. The heap must be consistent:
    /// no collection may be tracing or reclaiming. Stacks are only scanned
    /// when `with_stacks` (the threads are stopped).
    pub fn run_profiler(&self, with_stacks: bool) {
        let mut guard = self.profiler.lock().unwrap_or_else(|e| e.into_inner());
        let profiler = match guard.as_mut() {
            Some(p) => p,
            None => return,
        };
        let mut report = |slot: Address| {
            let value = unsafe { slot.load::<Address>() };
            if let Some(object) = self.resolve(value) {
                profiler.scan_root(slot, object);
            }
        };
        if with_stacks {
            self.scan_all_slots(&mut report);
        } else {
            self.scan_static_slots(&mut report);
        }
        walker::walk_heap(&self.pages, &mut |object| {
            profiler.scan_object(object, object_model::size(object))
        });
        profiler.scan_done();
    }
}
