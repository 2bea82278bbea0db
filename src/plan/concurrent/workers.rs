//! Coordination of the concurrent collector's threads: cycle requests from
//! mutators, and parking of the marker threads within a trace round.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Instant;

/// The synchronized part of [`CycleRequester`].
#[derive(Default)]
struct RequestState {
    /// The highest cycle number anybody asked for.
    requested: usize,
    /// Cycles whose marking has started.
    started: usize,
    /// Cycles whose marking is complete.
    marked: usize,
    /// Cycles whose sweep is complete.
    swept: usize,
    /// When the cycle waiting to be swept started.
    cycle_started: Option<Instant>,
    shutdown: bool,
}

/// Coalesces collection requests. A request is satisfied by the first cycle
/// that *starts* after it, so requests made while a cycle runs share the next
/// one, and any number of requests between two cycles share a single cycle.
/// Cycles are numbered from 1.
#[derive(Default)]
pub struct CycleRequester {
    state: Mutex<RequestState>,
    changed: Condvar,
}

impl CycleRequester {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RequestState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn wait_while<'a>(
        &self,
        guard: MutexGuard<'a, RequestState>,
        mut cond: impl FnMut(&mut RequestState) -> bool,
    ) -> MutexGuard<'a, RequestState> {
        self.changed
            .wait_while(guard, |s| !s.shutdown && cond(s))
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Ask for a cycle. Returns the number of the cycle that satisfies the request.
    pub fn request(&self) -> usize {
        let mut state = self.lock();
        let target = state.started + 1;
        if state.requested < target {
            state.requested = target;
            debug!("cycle {} requested", target);
            self.changed.notify_all();
        }
        target
    }

    /// Marker side: block until a cycle is requested and the previous one is
    /// swept. Returns the number of the cycle to run, or `None` at shutdown.
    pub fn wait_for_request(&self) -> Option<usize> {
        let state = self.lock();
        let mut state = self.wait_while(state, |s| s.requested <= s.started || s.swept < s.started);
        if state.shutdown {
            return None;
        }
        state.started += 1;
        Some(state.started)
    }

    pub fn marking_finished(&self, started: Instant) {
        let mut state = self.lock();
        state.marked += 1;
        state.cycle_started = Some(started);
        self.changed.notify_all();
    }

    /// Sweeper side: block until a cycle is marked. Returns when it started,
    /// or `None` at shutdown.
    pub fn wait_for_sweep(&self) -> Option<Instant> {
        let state = self.lock();
        let mut state = self.wait_while(state, |s| s.marked <= s.swept);
        if state.shutdown {
            return None;
        }
        Some(state.cycle_started.take().unwrap_or_else(Instant::now))
    }

    pub fn sweep_finished(&self) {
        let mut state = self.lock();
        state.swept += 1;
        self.changed.notify_all();
    }

    /// Block until cycle `target` is swept.
    pub fn wait_for(&self, target: usize) {
        let state = self.lock();
        drop(self.wait_while(state, |s| s.swept < target));
    }

    /// Block until every requested cycle is swept.
    pub fn wait_idle(&self) {
        let state = self.lock();
        drop(self.wait_while(state, |s| s.swept < s.requested));
    }

    /// Cycles completed, sweep included.
    pub fn completed(&self) -> usize {
        self.lock().swept
    }

    pub fn is_sweeping(&self) -> bool {
        let state = self.lock();
        state.marked > state.swept
    }

    pub fn shutdown(&self) {
        self.lock().shutdown = true;
        self.changed.notify_all();
    }
}

/// The result of the `on_last_parked` call-back of [`MarkerMonitor::park_and_wait`].
pub(crate) enum LastParkedResult {
    /// No gray object is left anywhere: the round is over.
    Terminate,
    /// More work showed up. Every marker goes back to tracing.
    WakeAll,
}

struct MonitorState {
    workers: usize,
    parked: usize,
    /// The latest round started.
    round: usize,
    /// The latest round finished.
    finished: usize,
    /// Bumped whenever parked markers are sent back to work.
    wakeups: usize,
    shutdown: bool,
}

/// Lets marker threads park when they run out of gray objects, and lets the
/// last one to park decide whether the trace round is over.
pub struct MarkerMonitor {
    state: Mutex<MonitorState>,
    changed: Condvar,
}

impl MarkerMonitor {
    pub fn new(workers: usize) -> Self {
        assert!(workers > 0);
        MarkerMonitor {
            state: Mutex::new(MonitorState {
                workers,
                parked: 0,
                round: 0,
                finished: 0,
                wakeups: 0,
                shutdown: false,
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn workers(&self) -> usize {
        self.lock().workers
    }

    /// Start a trace round and wake the helper markers. The previous round
    /// must be finished.
    pub fn start_round(&self) -> usize {
        let mut state = self.lock();
        debug_assert_eq!(state.finished, state.round);
        state.round += 1;
        state.parked = 0;
        self.changed.notify_all();
        state.round
    }

    /// Helper side: block until a round after `seen` starts. `None` at shutdown.
    pub fn wait_for_round(&self, seen: usize) -> Option<usize> {
        let state = self.lock();
        let state = self
            .changed
            .wait_while(state, |s| !s.shutdown && s.round <= seen)
            .unwrap_or_else(|e| e.into_inner());
        if state.shutdown {
            None
        } else {
            Some(state.round)
        }
    }

    /// Park a marker that found no work in `round`. If it is the last one to
    /// park, `on_last_parked` decides what happens next; it runs with the
    /// monitor held. Returns true when the round is over, false if the
    /// marker should look for work again.
    pub(crate) fn park_and_wait(&self, ordinal: usize, round: usize, on_last_parked: impl FnOnce() -> LastParkedResult) -> bool {
        let mut state = self.lock();
        state.parked += 1;
        trace!(
            "marker {} parked in round {} ({}/{})",
            ordinal,
            round,
            state.parked,
            state.workers
        );
        if state.parked == state.workers {
            match on_last_parked() {
                LastParkedResult::Terminate => {
                    trace!("marker {} ends round {}", ordinal, round);
                    state.finished = round;
                    self.changed.notify_all();
                    return true;
                }
                LastParkedResult::WakeAll => {
                    state.parked = 0;
                    state.wakeups += 1;
                    self.changed.notify_all();
                    return false;
                }
            }
        }
        let wakeups = state.wakeups;
        let state = self
            .changed
            .wait_while(state, |s| {
                !s.shutdown && s.finished < round && s.wakeups == wakeups
            })
            .unwrap_or_else(|e| e.into_inner());
        state.shutdown || state.finished >= round
    }

    pub fn shutdown(&self) {
        self.lock().shutdown = true;
        self.changed.notify_all();
    }
}
