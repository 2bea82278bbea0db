//! Stopping and resuming the world for the stop-the-world collectors.
//!
//! A thread that wants a collection tries to become the designated collector
//! thread by compare-and-swap on [`StopTheWorld::collector_thread_index`].
//! The winner asks every thread to stop, takes each of them as they turn
//! dormant at their next safepoint, runs the collection with the page lock
//! elided, and releases them. A loser turns dormant itself and waits until a
//! collection completes after its request, which is normally the one that
//! beat it. Overlapping requests are thus served by a single collection.

use super::collector::Phase;
use crate::util::heap::PageManager;
use crate::vm::threads::COLLECTOR_THREAD;
use crate::vm::{ThreadContext, ThreadTable};
use atomic::Atomic;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const NO_COLLECTOR: usize = usize::MAX;

/// How often a stopping collector re-checks threads that have not reached a safepoint.
const STOP_POLL_PERIOD: Duration = Duration::from_millis(1);

pub struct StopTheWorld {
    collector_thread_index: AtomicUsize,
    phase: Atomic<Phase>,
    /// Collections completed so far.
    completed: AtomicUsize,
}

impl StopTheWorld {
    pub fn new() -> Self {
        StopTheWorld {
            collector_thread_index: AtomicUsize::new(NO_COLLECTOR),
            phase: Atomic::new(Phase::Idle),
            completed: AtomicUsize::new(0),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// The index of the designated collector thread, if a collection is running.
    pub fn collector_thread(&self) -> Option<usize> {
        match self.collector_thread_index.load(Ordering::SeqCst) {
            NO_COLLECTOR => None,
            index => Some(index),
        }
    }

    /// Run `body` with every other thread stopped, or wait for the collection
    /// another thread is running. `thread` is the caller, if it is a mutator.
    pub fn collect(
        &self,
        threads: &ThreadTable,
        pages: &PageManager,
        thread: Option<&ThreadContext>,
        body: impl FnOnce(),
    ) {
        let seen = self.completed();
        let me = thread.map_or(COLLECTOR_THREAD, |t| t.index()) as usize;
        if self
            .collector_thread_index
            .compare_exchange(NO_COLLECTOR, me, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let stopped = self.stop_the_world(threads, thread);
            self.phase.store(Phase::SingleThreaded, Ordering::SeqCst);
            pages.enter_single_threaded();
            body();
            pages.leave_single_threaded();
            self.resume_the_world(threads, stopped);
        } else {
            debug!(
                "thread {} waits for the collection of thread {:?}",
                me,
                self.collector_thread()
            );
            if let Some(t) = thread {
                threads.enter_dormant(t);
            }
            threads.wait_until(|| self.completed() > seen);
            if let Some(t) = thread {
                threads.leave_dormant(t);
            }
        }
    }

    fn stop_the_world(&self, threads: &ThreadTable, requester: Option<&ThreadContext>) -> Vec<Arc<ThreadContext>> {
        self.phase.store(Phase::Synchronizing, Ordering::SeqCst);
        threads.set_stop_requested(true);
        let others: Vec<Arc<ThreadContext>> = threads
            .snapshot()
            .into_iter()
            .filter(|t| requester.map_or(true, |r| !std::ptr::eq(t.as_ref(), r)))
            .collect();
        threads.poll_until(STOP_POLL_PERIOD, || {
            others
                .iter()
                .all(|t| t.is_taken() || threads.try_take(t))
        });
        debug!("stopped {} threads", others.len());
        others
    }

    fn resume_the_world(&self, threads: &ThreadTable, stopped: Vec<Arc<ThreadContext>>) {
        self.completed.fetch_add(1, Ordering::SeqCst);
        self.phase.store(Phase::Idle, Ordering::SeqCst);
        self.collector_thread_index
            .store(NO_COLLECTOR, Ordering::SeqCst);
        threads.set_stop_requested(false);
        for t in &stopped {
            threads.release(t);
        }
        debug!("resumed {} threads", stopped.len());
    }

    /// Yield to a collector that is stopping the world.
    pub fn safepoint(&self, threads: &ThreadTable, thread: &ThreadContext) {
        if threads.stop_requested() {
            threads.enter_dormant(thread);
            threads.leave_dormant(thread);
        }
    }
}

impl Default for StopTheWorld {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::alloc::{LocalFreeLists, MutatorAllocState};
    use crate::util::test_util::fixtures::new_page_manager;
    use crate::util::test_util::panic_after;
    use std::sync::atomic::AtomicBool;

    fn new_thread(index: u16) -> ThreadContext {
        ThreadContext::new(index, MutatorAllocState::FreeList(LocalFreeLists::new(index)))
    }

    #[test]
    fn stops_running_threads() {
        panic_after(10000, || {
            let pages = new_page_manager(16);
            let table = Arc::new(ThreadTable::new(4));
            let stw = Arc::new(StopTheWorld::new());
            let collector = table.register(new_thread).unwrap();
            let mutator = table.register(new_thread).unwrap();
            let stop = Arc::new(AtomicBool::new(false));
            let handle = {
                let (table, stw, mutator, stop) =
                    (table.clone(), stw.clone(), mutator.clone(), stop.clone());
                std::thread::spawn(move || {
                    while !stop.load(Ordering::SeqCst) {
                        stw.safepoint(&table, &mutator);
                        std::thread::yield_now();
                    }
                })
            };
            let mut ran = false;
            stw.collect(&table, &pages, Some(&collector), || {
                assert!(mutator.is_taken());
                assert_eq!(stw.phase(), Phase::SingleThreaded);
                assert!(pages.is_single_threaded());
                ran = true;
            });
            assert!(ran);
            assert_eq!(stw.completed(), 1);
            assert_eq!(stw.phase(), Phase::Idle);
            assert!(!mutator.is_taken());
            stop.store(true, Ordering::SeqCst);
            handle.join().unwrap();
        })
    }

    #[test]
    fn concurrent_requests_wait_for_one_collection() {
        panic_after(10000, || {
            let pages = new_page_manager(16);
            let table = Arc::new(ThreadTable::new(4));
            let stw = Arc::new(StopTheWorld::new());
            let bodies = Arc::new(AtomicUsize::new(0));
            // All registered up front, so the winner stops the other two and
            // they can only be taken once they have lost the race.
            let threads: Vec<_> = (0..3).map(|_| table.register(new_thread).unwrap()).collect();
            let handles: Vec<_> = threads
                .into_iter()
                .map(|t| {
                    let (table, stw, pages, bodies) =
                        (table.clone(), stw.clone(), pages.clone(), bodies.clone());
                    std::thread::spawn(move || {
                        stw.collect(&table, &pages, Some(&t), || {
                            bodies.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(Duration::from_millis(10));
                        });
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }
            assert_eq!(bodies.load(Ordering::SeqCst), 1);
            assert_eq!(stw.completed(), 1);
            assert!(stw.collector_thread().is_none());
        })
    }
}
