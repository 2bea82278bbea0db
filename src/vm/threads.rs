//! Mutator threads as the collectors see them.
//!
//! A thread is either running or *dormant*: it has yielded to the collector
//! and promises not to touch the heap until it leaves the dormant state. The
//! collector *takes* a dormant thread to work on its behalf (stop it, scan its
//! stack, run a handshake for it); a taken thread cannot leave the dormant
//! state until the collector releases it.
//!
//! Every state change that somebody may wait for is announced on the table's
//! monitor, in the way GC workers park on the worker monitor: the waiter checks
//! its condition with the monitor's mutex held, the notifier changes state and
//! then takes the mutex to notify.

use crate::plan::concurrent::thread_header_queue::ThreadHeaderQueue;
use crate::util::alloc::MutatorAllocState;
use crate::util::Address;
use atomic_refcell::AtomicRefCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};
use std::time::Duration;

/// The thread has yielded to the collector.
pub const DORMANT: usize = 1;
/// The collector works on behalf of the (dormant) thread.
pub const TAKEN: usize = 2;

/// The thread index used by collector threads. Mutators are numbered from 1.
pub const COLLECTOR_THREAD: u16 = 0;

pub struct ThreadContext {
    index: u16,
    state: AtomicUsize,
    /// Allocation state. Borrowed by the thread itself, or by the collector
    /// while the thread is stopped or taken.
    pub alloc: AtomicRefCell<MutatorAllocState>,
    /// Slots recorded by the generational store buffer.
    pub barrier_buffer: AtomicRefCell<Vec<Address>>,
    /// Gray objects shaded by this thread (concurrent collector).
    pub gray_queue: ThreadHeaderQueue,
    /// The innermost transition record of the thread's stack, or zero.
    transition_record: AtomicUsize,
    /// A handshake is posted and this thread has not run it yet.
    handshake_pending: AtomicBool,
}

impl ThreadContext {
    pub fn new(index: u16, alloc: MutatorAllocState) -> Self {
        ThreadContext {
            index,
            state: AtomicUsize::new(0),
            alloc: AtomicRefCell::new(alloc),
            barrier_buffer: AtomicRefCell::new(vec![]),
            gray_queue: ThreadHeaderQueue::new(),
            transition_record: AtomicUsize::new(0),
            handshake_pending: AtomicBool::new(false),
        }
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn is_dormant(&self) -> bool {
        self.state.load(Ordering::SeqCst) & DORMANT != 0
    }

    pub fn is_taken(&self) -> bool {
        self.state.load(Ordering::SeqCst) & TAKEN != 0
    }

    pub fn transition_record(&self) -> Address {
        unsafe { Address::from_usize(self.transition_record.load(Ordering::Acquire)) }
    }

    /// Install the innermost transition record. The record must stay valid
    /// (and the stack it describes unchanged) while the thread is dormant.
    pub fn set_transition_record(&self, record: Address) {
        self.transition_record
            .store(record.as_usize(), Ordering::Release)
    }

    pub fn handshake_pending(&self) -> bool {
        self.handshake_pending.load(Ordering::SeqCst)
    }

    /// Claim the pending handshake. Only one of the thread and the collector wins.
    pub fn claim_handshake(&self) -> bool {
        self.handshake_pending
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

impl std::fmt::Debug for ThreadContext {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "thread {} (state {})", self.index, self.state.load(Ordering::Relaxed))
    }
}

pub struct ThreadTable {
    threads: RwLock<Vec<Option<Arc<ThreadContext>>>>,
    max_threads: usize,
    monitor: Mutex<()>,
    changed: Condvar,
    /// A stop-the-world collection is stopping or has stopped the world.
    stop_requested: AtomicBool,
}

impl ThreadTable {
    pub fn new(max_threads: usize) -> Self {
        ThreadTable {
            threads: RwLock::new(vec![]),
            max_threads,
            monitor: Mutex::new(()),
            changed: Condvar::new(),
            stop_requested: AtomicBool::new(false),
        }
    }

    fn lock_monitor(&self) -> MutexGuard<'_, ()> {
        self.monitor.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a new thread built by `make` from its index. Returns `None`
    /// if the table is full.
    pub fn register(&self, make: impl FnOnce(u16) -> ThreadContext) -> Option<Arc<ThreadContext>> {
        let mut threads = self.threads.write().unwrap_or_else(|e| e.into_inner());
        let slot = match threads.iter().position(|t| t.is_none()) {
            Some(i) => i,
            None if threads.len() < self.max_threads => {
                threads.push(None);
                threads.len() - 1
            }
            None => return None,
        };
        let thread = Arc::new(make(slot as u16 + 1));
        // A thread born while the world is stopping starts out dormant.
        if self.stop_requested.load(Ordering::SeqCst) {
            thread.state.store(DORMANT, Ordering::SeqCst);
        }
        threads[slot] = Some(thread.clone());
        debug!("registered thread {}", thread.index);
        Some(thread)
    }

    pub fn unregister(&self, thread: &ThreadContext) {
        let mut threads = self.threads.write().unwrap_or_else(|e| e.into_inner());
        let slot = thread.index as usize - 1;
        assert!(
            matches!(&threads[slot], Some(t) if std::ptr::eq(t.as_ref(), thread)),
            "{:?} is not registered",
            thread
        );
        threads[slot] = None;
        drop(threads);
        // Collectors that saw the thread in a snapshot may still take it.
        thread.state.fetch_or(DORMANT, Ordering::SeqCst);
        debug!("unregistered thread {}", thread.index);
        self.notify();
    }

    /// The registered threads at this moment.
    pub fn snapshot(&self) -> Vec<Arc<ThreadContext>> {
        self.threads
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .flatten()
            .cloned()
            .collect()
    }

    pub fn get(&self, index: u16) -> Option<Arc<ThreadContext>> {
        let threads = self.threads.read().unwrap_or_else(|e| e.into_inner());
        threads.get(index as usize - 1).cloned().flatten()
    }

    pub fn count(&self) -> usize {
        self.snapshot().len()
    }

    /// Wake everybody waiting on the monitor.
    pub fn notify(&self) {
        let _guard = self.lock_monitor();
        self.changed.notify_all();
    }

    /// Block until `done` holds. `done` is evaluated with the monitor held.
    pub fn wait_until(&self, mut done: impl FnMut() -> bool) {
        let mut guard = self.lock_monitor();
        while !done() {
            guard = self
                .changed
                .wait(guard)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Like [`Self::wait_until`], but re-checks at least every `period`, for
    /// conditions that change without a notification.
    pub fn poll_until(&self, period: Duration, mut done: impl FnMut() -> bool) {
        let mut guard = self.lock_monitor();
        while !done() {
            guard = self
                .changed
                .wait_timeout(guard, period)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }

    pub fn enter_dormant(&self, thread: &ThreadContext) {
        let prev = thread.state.fetch_or(DORMANT, Ordering::SeqCst);
        assert!(prev & DORMANT == 0, "{:?} is already dormant", thread);
        trace!("thread {} is dormant", thread.index);
        self.notify();
    }

    /// Leave the dormant state, waiting while the collector holds the thread
    /// or the world is stopped.
    pub fn leave_dormant(&self, thread: &ThreadContext) {
        self.wait_until(|| {
            !self.stop_requested.load(Ordering::SeqCst)
                && thread
                    .state
                    .compare_exchange(DORMANT, 0, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
        });
        trace!("thread {} is running", thread.index);
    }

    /// Take a dormant thread. Returns false if it is running.
    pub fn try_take(&self, thread: &ThreadContext) -> bool {
        thread
            .state
            .compare_exchange(DORMANT, DORMANT | TAKEN, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn release(&self, thread: &ThreadContext) {
        let prev = thread.state.fetch_and(!TAKEN, Ordering::SeqCst);
        assert!(prev & TAKEN != 0, "{:?} was not taken", thread);
        self.notify();
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    pub fn set_stop_requested(&self, stop: bool) {
        self.stop_requested.store(stop, Ordering::SeqCst);
        self.notify();
    }

    /// Run `action` once for every registered thread except `requester`:
    /// either the thread runs it itself at its next safepoint (through
    /// [`Self::run_pending_handshake`]) or, if it is dormant, the caller takes
    /// it and runs it on its behalf. Returns when every thread has run it.
    pub fn handshake(&self, requester: Option<&ThreadContext>, action: &dyn Fn(&ThreadContext)) {
        let threads = self.snapshot();
        for t in &threads {
            t.handshake_pending.store(true, Ordering::SeqCst);
        }
        if let Some(r) = requester {
            if r.claim_handshake() {
                action(r);
            }
        }
        loop {
            let mut remaining = 0;
            for t in &threads {
                if !t.handshake_pending() {
                    continue;
                }
                if self.try_take(t) {
                    if t.claim_handshake() {
                        action(t);
                    }
                    self.release(t);
                } else {
                    remaining += 1;
                }
            }
            if remaining == 0 {
                break;
            }
            self.poll_until(Duration::from_millis(1), || {
                threads
                    .iter()
                    .all(|t| !t.handshake_pending() || t.is_dormant())
            });
        }
        trace!("handshake with {} threads done", threads.len());
    }

    /// Run a posted handshake. Called by a running thread at a safepoint.
    pub fn run_pending_handshake(&self, thread: &ThreadContext, action: &dyn Fn(&ThreadContext)) {
        if thread.claim_handshake() {
            action(thread);
            self.notify();
        }
    }
}
