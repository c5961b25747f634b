#![forbid(unsafe_code)]

//! Priority-ordered recomputation scheduler.
//!
//! The scheduler is the single queue behind every update wave: when an
//! observable changes, its dependent subscriptions enqueue themselves here,
//! and the drain runs them strictly in ascending priority order. A
//! subscription's priority is strictly greater than that of any dependency,
//! so within one update every dependency finishes recomputing before its
//! dependents start.
//!
//! This is an explicit service object, not a process-wide implicit: every
//! observable/computed constructor takes a [`Scheduler`] handle, and tests
//! construct isolated instances.
//!
//! # Invariants
//!
//! 1. Drain order is ascending `(priority, seq)`; `seq` is assigned
//!    monotonically at enqueue time, so ties break FIFO deterministically.
//! 2. A subscription already queued for the current wave is not queued
//!    twice, and one that already ran in the current drain round is not
//!    re-run (at-most-one-evaluation-per-update, cycles included).
//! 3. Re-entrant `set()` calls during a drain merge into the running drain;
//!    breadth is controlled by priority order, not call-stack depth.
//! 4. [`bundle_changes`](Scheduler::bundle_changes) defers drains, not
//!    direct emitter notifications; only scheduler-driven recomputation is
//!    delayed, and only the outermost bundle flushes.
//!
//! # Failure Modes
//!
//! - **Panic in a read function mid-drain**: the drain is aborted, the
//!   queue is cleared (pending entries are un-marked so later updates start
//!   clean), a warning is logged, and the panic propagates. No guarantee is
//!   made about resuming the remaining entries of that wave.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::BinaryHeap;
use std::rc::{Rc, Weak};

use ahash::AHashMap;
use tracing::{trace, warn};

// ─── Schedulable ─────────────────────────────────────────────────────────────

/// A unit the scheduler can re-evaluate (a subscription core).
pub(crate) trait Schedulable {
    /// Current priority: strictly greater than any dependency's priority.
    fn schedule_priority(&self) -> u32;
    /// Whether the unit is already queued for the current wave.
    fn is_queued(&self) -> bool;
    /// Set or clear the queued flag.
    fn mark_queued(&self, queued: bool);
    /// Round in which the unit last ran (0 = never).
    fn last_run_round(&self) -> u64;
    /// Record the round the unit is running in.
    fn set_last_run_round(&self, round: u64);
    /// Run one evaluation pass.
    fn run_evaluation(self: Rc<Self>);
}

struct QueueEntry {
    priority: u32,
    seq: u64,
    target: Weak<dyn Schedulable>,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    // BinaryHeap is a max-heap; reverse so the smallest (priority, seq)
    // pops first.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

// ─── Scheduler ───────────────────────────────────────────────────────────────

struct SchedulerInner {
    heap: RefCell<BinaryHeap<QueueEntry>>,
    next_seq: Cell<u64>,
    round: Cell<u64>,
    draining: Cell<bool>,
    bundle_depth: Cell<u32>,
    /// Foreign-wrapper cache (see `interop`): source pointer → `Weak` core.
    pub(crate) foreign_cache: RefCell<AHashMap<usize, Box<dyn Any>>>,
}

/// Handle to one recomputation queue. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<SchedulerInner>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// Create an isolated scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Rc::new(SchedulerInner {
                heap: RefCell::new(BinaryHeap::new()),
                next_seq: Cell::new(0),
                round: Cell::new(0),
                draining: Cell::new(false),
                bundle_depth: Cell::new(0),
                foreign_cache: RefCell::new(AHashMap::new()),
            }),
        }
    }

    /// Run `f` with drains suppressed, then drain once.
    ///
    /// Coalesces multiple `set()` calls into one recomputation wave. Nested
    /// bundles flush only at the outermost exit. Direct (non-computed)
    /// listeners still fire synchronously inside the bundle. The batching
    /// window is strictly synchronous; it does not extend over async work.
    pub fn bundle_changes<R>(&self, f: impl FnOnce() -> R) -> R {
        struct BundleGuard<'a>(&'a Scheduler);
        impl Drop for BundleGuard<'_> {
            fn drop(&mut self) {
                let depth = self.0.inner.bundle_depth.get() - 1;
                self.0.inner.bundle_depth.set(depth);
                if depth == 0 && !std::thread::panicking() {
                    self.0.drain();
                }
            }
        }

        self.inner.bundle_depth.set(self.inner.bundle_depth.get() + 1);
        let _guard = BundleGuard(self);
        f()
    }

    /// Access the foreign-wrapper cache (see `interop`).
    pub(crate) fn with_foreign_cache<R>(
        &self,
        f: impl FnOnce(&mut AHashMap<usize, Box<dyn Any>>) -> R,
    ) -> R {
        f(&mut self.inner.foreign_cache.borrow_mut())
    }

    /// Queue `target` for the current wave, deduplicating.
    pub(crate) fn enqueue(&self, target: Rc<dyn Schedulable>) {
        if target.is_queued() {
            return;
        }
        if self.inner.draining.get() && target.last_run_round() == self.inner.round.get() {
            // Single-evaluation cap: already ran in this wave. This also
            // covers dependency cycles and the documented limitation for
            // manual-subscription side effects.
            trace!("skipping re-enqueue: already evaluated this wave");
            return;
        }
        let seq = self.inner.next_seq.get();
        self.inner.next_seq.set(seq + 1);
        let priority = target.schedule_priority();
        target.mark_queued(true);
        trace!(priority, seq, "queued for recomputation");
        self.inner.heap.borrow_mut().push(QueueEntry {
            priority,
            seq,
            target: Rc::downgrade(&target),
        });
    }

    /// Drain the queue in priority order. No-op while a drain is already
    /// running or a bundle is open.
    pub(crate) fn drain(&self) {
        if self.inner.draining.get() || self.inner.bundle_depth.get() > 0 {
            return;
        }
        if self.inner.heap.borrow().is_empty() {
            return;
        }

        struct DrainGuard<'a>(&'a SchedulerInner);
        impl Drop for DrainGuard<'_> {
            fn drop(&mut self) {
                self.0.draining.set(false);
                let mut heap = self.0.heap.borrow_mut();
                if !heap.is_empty() {
                    warn!(
                        pending = heap.len(),
                        "recomputation drain aborted; clearing queue"
                    );
                    for entry in heap.drain() {
                        if let Some(target) = entry.target.upgrade() {
                            target.mark_queued(false);
                        }
                    }
                }
            }
        }

        self.inner.draining.set(true);
        self.inner.round.set(self.inner.round.get() + 1);
        let round = self.inner.round.get();
        let guard = DrainGuard(&self.inner);

        loop {
            let entry = self.inner.heap.borrow_mut().pop();
            let Some(entry) = entry else {
                break;
            };
            let Some(target) = entry.target.upgrade() else {
                continue;
            };
            if !target.is_queued() {
                continue;
            }
            target.mark_queued(false);
            target.set_last_run_round(round);
            target.run_evaluation();
        }

        drop(guard);
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("queued", &self.inner.heap.borrow().len())
            .field("round", &self.inner.round.get())
            .field("draining", &self.inner.draining.get())
            .field("bundle_depth", &self.inner.bundle_depth.get())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe {
        priority: u32,
        queued: Cell<bool>,
        last_round: Cell<u64>,
        log: Rc<RefCell<Vec<u32>>>,
    }

    impl Probe {
        fn new(priority: u32, log: &Rc<RefCell<Vec<u32>>>) -> Rc<Self> {
            Rc::new(Self {
                priority,
                queued: Cell::new(false),
                last_round: Cell::new(0),
                log: Rc::clone(log),
            })
        }
    }

    impl Schedulable for Probe {
        fn schedule_priority(&self) -> u32 {
            self.priority
        }
        fn is_queued(&self) -> bool {
            self.queued.get()
        }
        fn mark_queued(&self, queued: bool) {
            self.queued.set(queued);
        }
        fn last_run_round(&self) -> u64 {
            self.last_round.get()
        }
        fn set_last_run_round(&self, round: u64) {
            self.last_round.set(round);
        }
        fn run_evaluation(self: Rc<Self>) {
            self.log.borrow_mut().push(self.priority);
        }
    }

    #[test]
    fn drains_in_priority_order() {
        let sched = Scheduler::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        // The queue holds only `Weak` targets; keep the probes alive.
        let probes: Vec<_> = [3u32, 1, 2].iter().map(|&p| Probe::new(p, &log)).collect();
        for p in &probes {
            sched.enqueue(Rc::clone(p) as Rc<dyn Schedulable>);
        }
        sched.drain();
        assert_eq!(*log.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn equal_priorities_run_fifo() {
        let sched = Scheduler::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let probes: Vec<_> = (0..4).map(|_| Probe::new(7, &log)).collect();
        for p in &probes {
            sched.enqueue(Rc::clone(p) as Rc<dyn Schedulable>);
        }
        sched.drain();
        assert_eq!(log.borrow().len(), 4);
    }

    #[test]
    fn enqueue_deduplicates() {
        let sched = Scheduler::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let probe = Probe::new(1, &log);
        sched.enqueue(Rc::clone(&probe) as Rc<dyn Schedulable>);
        sched.enqueue(Rc::clone(&probe) as Rc<dyn Schedulable>);
        sched.drain();
        assert_eq!(log.borrow().len(), 1);
    }

    #[test]
    fn dropped_target_is_skipped() {
        let sched = Scheduler::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let probe = Probe::new(1, &log);
        sched.enqueue(Rc::clone(&probe) as Rc<dyn Schedulable>);
        drop(probe);
        sched.drain();
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn bundle_defers_drain_to_outermost_exit() {
        let sched = Scheduler::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let probe = Probe::new(1, &log);

        sched.bundle_changes(|| {
            sched.bundle_changes(|| {
                sched.enqueue(Rc::clone(&probe) as Rc<dyn Schedulable>);
                sched.drain();
                assert!(log.borrow().is_empty());
            });
            // Inner bundle exit must not flush.
            assert!(log.borrow().is_empty());
        });
        assert_eq!(log.borrow().len(), 1);
    }
}
