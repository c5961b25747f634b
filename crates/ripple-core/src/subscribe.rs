#![forbid(unsafe_code)]

//! Dependency tracking: the `use` function and the per-pass subscription
//! diff that keeps the dependency set exact.
//!
//! A [`Subscription`] re-runs its callback with a fresh [`UseCx`] on every
//! evaluation pass. Reading a value through [`UseCx::read`] both returns the
//! value and records a dependency edge. After the callback returns, the new
//! dependency set is diffed against the previous pass: sources no longer
//! read are unsubscribed, newly-read sources are subscribed, survivors keep
//! their existing listeners untouched.
//!
//! # Invariants
//!
//! 1. The dependency set is exact per pass: branches not taken this time
//!    are not depended upon this time, and no stale listener survives a
//!    recomputation.
//! 2. Repeated reads of the same source within one pass record one edge
//!    (idempotent; no duplicate listeners).
//! 3. Explicit leading dependencies are recorded before the callback runs,
//!    in declaration order.
//! 4. After each pass, the subscription's priority is strictly greater than
//!    the priority of every tracked source (1 + max, 0 when sourceless).
//!
//! # Failure Modes
//!
//! - **Callback panic**: the pass aborts; the previous dependency set stays
//!   attached (the diff never ran), so a later change still reschedules.
//! - **Disposal mid-pass**: the diff is skipped; listeners created by the
//!   disposed pass do not exist, and the tracked set was already detached.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::AHashSet;

use crate::dispose::{Disposable, Owner, OwnerExt};
use crate::emit::Listener;
use crate::scheduler::{Schedulable, Scheduler};

// ─── Source identity ─────────────────────────────────────────────────────────

static NEXT_SOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique id for a dependency source.
pub(crate) fn next_source_id() -> u64 {
    NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Dependency traits ───────────────────────────────────────────────────────

/// Type-erased dependency edge: anything a subscription can track.
///
/// Implemented by observables, computeds, arrays, and foreign wrappers.
pub trait DepSource {
    /// Stable process-unique identity, used to deduplicate edges.
    fn source_id(&self) -> u64;

    /// Current scheduling priority (0 for plain observables; depth in the
    /// dependency DAG for subscription-backed sources).
    fn priority(&self) -> u32;

    /// Attach a change listener. The callback carries no payload; the
    /// subscriber re-reads values during its evaluation pass.
    fn listen(&self, on_change: Box<dyn Fn()>) -> Listener;
}

/// A readable reactive source of `T` values.
pub trait ReactiveValue<T> {
    /// Read the current value without recording a dependency.
    fn sample(&self) -> T;

    /// The erased dependency edge for this source.
    fn as_dep(&self) -> Rc<dyn DepSource>;
}

// ─── UseCx ───────────────────────────────────────────────────────────────────

/// The `use` function handed to subscription callbacks.
///
/// `cx.read(&obs)` returns the observable's value and records the
/// dependency edge for this pass.
pub struct UseCx {
    seen: AHashSet<u64>,
    deps: Vec<Rc<dyn DepSource>>,
}

impl UseCx {
    pub(crate) fn new() -> Self {
        Self {
            seen: AHashSet::new(),
            deps: Vec::new(),
        }
    }

    /// Read `src` and record it as a dependency of the current pass.
    pub fn read<T>(&mut self, src: &dyn ReactiveValue<T>) -> T {
        self.record(src.as_dep());
        src.sample()
    }

    /// Record a dependency edge without reading a value. Idempotent.
    pub fn record(&mut self, dep: Rc<dyn DepSource>) {
        if self.seen.insert(dep.source_id()) {
            self.deps.push(dep);
        }
    }
}

// ─── Subscription core ───────────────────────────────────────────────────────

struct SubState {
    callback: Rc<dyn Fn(&mut UseCx)>,
    explicit: Vec<Rc<dyn DepSource>>,
    tracked: Vec<(Rc<dyn DepSource>, Listener)>,
}

pub(crate) struct SubCore {
    sched: Scheduler,
    state: RefCell<Option<SubState>>,
    queued: Cell<bool>,
    last_round: Cell<u64>,
    priority: Cell<u32>,
}

impl SubCore {
    fn new(sched: &Scheduler, explicit: Vec<Rc<dyn DepSource>>, callback: Rc<dyn Fn(&mut UseCx)>) -> Rc<Self> {
        Rc::new(Self {
            sched: sched.clone(),
            state: RefCell::new(Some(SubState {
                callback,
                explicit,
                tracked: Vec::new(),
            })),
            queued: Cell::new(false),
            last_round: Cell::new(0),
            priority: Cell::new(0),
        })
    }
}

/// One evaluation pass: run the callback, then resubscribe to exactly the
/// recorded dependency set.
fn run_pass(core: &Rc<SubCore>) {
    let (callback, explicit) = {
        let state = core.state.borrow();
        let Some(state) = state.as_ref() else {
            return; // Disposed while queued.
        };
        (Rc::clone(&state.callback), state.explicit.clone())
    };

    let mut cx = UseCx::new();
    for dep in &explicit {
        cx.record(Rc::clone(dep));
    }
    callback(&mut cx);

    let stale = {
        let mut state = core.state.borrow_mut();
        let Some(state) = state.as_mut() else {
            return; // Disposed during the callback.
        };
        let mut old = std::mem::take(&mut state.tracked);
        let mut max_priority = 0u32;
        let mut tracked = Vec::with_capacity(cx.deps.len());
        for dep in cx.deps {
            let listener = match old.iter().position(|(d, _)| d.source_id() == dep.source_id()) {
                Some(i) => old.swap_remove(i).1,
                None => dep.listen(notify_callback(core)),
            };
            max_priority = max_priority.max(dep.priority());
            tracked.push((dep, listener));
        }
        core.priority.set(if tracked.is_empty() {
            0
        } else {
            max_priority + 1
        });
        state.tracked = tracked;
        old
    };
    for (_, listener) in stale {
        listener.dispose();
    }
}

fn notify_callback(core: &Rc<SubCore>) -> Box<dyn Fn()> {
    let weak = Rc::downgrade(core);
    Box::new(move || {
        if let Some(core) = weak.upgrade() {
            let sched = core.sched.clone();
            sched.enqueue(core as Rc<dyn Schedulable>);
        }
    })
}

impl Schedulable for SubCore {
    fn schedule_priority(&self) -> u32 {
        self.priority.get()
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
        run_pass(&self);
    }
}

// ─── Subscription handle ─────────────────────────────────────────────────────

/// Handle to a dependency-tracked callback.
///
/// Created via [`subscribe`]/[`subscribe_to`] (side-effect subscriptions)
/// or internally by computeds. Disposing it detaches every currently
/// tracked dependency listener.
#[derive(Clone)]
pub struct Subscription {
    core: Rc<SubCore>,
}

impl Subscription {
    /// Create without running the first pass; used by computeds that need
    /// their state wired up before the initial evaluation.
    pub(crate) fn new_deferred(
        sched: &Scheduler,
        explicit: Vec<Rc<dyn DepSource>>,
        callback: Rc<dyn Fn(&mut UseCx)>,
    ) -> Self {
        Self {
            core: SubCore::new(sched, explicit, callback),
        }
    }

    /// Run one evaluation pass synchronously.
    pub(crate) fn run_now(&self) {
        run_pass(&self.core);
    }

    /// Current priority (strictly above every tracked dependency).
    #[must_use]
    pub fn priority(&self) -> u32 {
        self.core.priority.get()
    }

    /// Number of currently tracked dependencies.
    #[must_use]
    pub fn dep_count(&self) -> usize {
        self.core
            .state
            .borrow()
            .as_ref()
            .map_or(0, |s| s.tracked.len())
    }

    /// Detach all dependency listeners but keep the subscription usable;
    /// the next pass resubscribes from scratch. Used by pure computeds
    /// while unobserved.
    pub(crate) fn disconnect(&self) {
        let stale = {
            let mut state = self.core.state.borrow_mut();
            match state.as_mut() {
                Some(state) => std::mem::take(&mut state.tracked),
                None => Vec::new(),
            }
        };
        for (_, listener) in stale {
            listener.dispose();
        }
        self.core.priority.set(0);
    }
}

impl Disposable for Subscription {
    fn dispose(&self) {
        let state = self.core.state.borrow_mut().take();
        if let Some(state) = state {
            for (_, listener) in state.tracked {
                listener.dispose();
            }
        }
    }

    fn is_disposed(&self) -> bool {
        self.core.state.borrow().is_none()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("disposed", &self.is_disposed())
            .field("priority", &self.priority())
            .field("deps", &self.dep_count())
            .finish()
    }
}

/// Create a side-effect subscription: `callback` runs once now, then again
/// (via the scheduler) whenever a dependency it read has changed.
pub fn subscribe(
    sched: &Scheduler,
    owner: Option<&dyn Owner>,
    callback: impl Fn(&mut UseCx) + 'static,
) -> Subscription {
    subscribe_to(sched, owner, Vec::new(), callback)
}

/// Like [`subscribe`], with explicit leading dependencies that are tracked
/// whether or not the callback reads them.
pub fn subscribe_to(
    sched: &Scheduler,
    owner: Option<&dyn Owner>,
    deps: Vec<Rc<dyn DepSource>>,
    callback: impl Fn(&mut UseCx) + 'static,
) -> Subscription {
    let sub = Subscription::new_deferred(sched, deps, Rc::new(callback));
    sub.run_now();
    if let Some(owner) = owner {
        owner.autodispose(sub.clone());
    }
    sub
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observable::Observable;

    #[test]
    fn records_each_source_once() {
        let sched = Scheduler::new();
        let x = Observable::new(&sched, 1);
        let runs = Rc::new(Cell::new(0u32));

        let runs_in = Rc::clone(&runs);
        let x_in = x.clone();
        let sub = subscribe(&sched, None, move |cx| {
            // Repeated reads of the same source are idempotent.
            let _ = cx.read(&x_in);
            let _ = cx.read(&x_in);
            runs_in.set(runs_in.get() + 1);
        });

        assert_eq!(runs.get(), 1);
        assert_eq!(sub.dep_count(), 1);

        x.set(2);
        assert_eq!(runs.get(), 2);
        assert_eq!(sub.dep_count(), 1);
    }

    #[test]
    fn branch_not_taken_is_not_a_dependency() {
        let sched = Scheduler::new();
        let flag = Observable::new(&sched, true);
        let y = Observable::new(&sched, 10);
        let z = Observable::new(&sched, 20);
        let runs = Rc::new(Cell::new(0u32));

        let (flag_in, y_in, z_in, runs_in) = (flag.clone(), y.clone(), z.clone(), Rc::clone(&runs));
        let sub = subscribe(&sched, None, move |cx| {
            runs_in.set(runs_in.get() + 1);
            if cx.read(&flag_in) {
                let _ = cx.read(&y_in);
            } else {
                let _ = cx.read(&z_in);
            }
        });
        assert_eq!(runs.get(), 1);
        assert_eq!(sub.dep_count(), 2);

        // While on the `y` branch, `z` changes are invisible.
        z.set(21);
        assert_eq!(runs.get(), 1);
        y.set(11);
        assert_eq!(runs.get(), 2);

        // Switch branches; now `y` changes are invisible.
        flag.set(false);
        assert_eq!(runs.get(), 3);
        y.set(12);
        assert_eq!(runs.get(), 3);
        z.set(22);
        assert_eq!(runs.get(), 4);
    }

    #[test]
    fn explicit_deps_tracked_without_reads() {
        let sched = Scheduler::new();
        let x = Observable::new(&sched, 1);
        let runs = Rc::new(Cell::new(0u32));

        let runs_in = Rc::clone(&runs);
        let sub = subscribe_to(&sched, None, vec![x.as_dep()], move |_cx| {
            runs_in.set(runs_in.get() + 1);
        });
        assert_eq!(sub.dep_count(), 1);
        assert_eq!(sub.priority(), 1);

        x.set(2);
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn dispose_detaches_all_listeners() {
        let sched = Scheduler::new();
        let x = Observable::new(&sched, 1);
        let runs = Rc::new(Cell::new(0u32));

        let (x_in, runs_in) = (x.clone(), Rc::clone(&runs));
        let sub = subscribe(&sched, None, move |cx| {
            let _ = cx.read(&x_in);
            runs_in.set(runs_in.get() + 1);
        });

        sub.dispose();
        assert!(sub.is_disposed());
        x.set(2);
        assert_eq!(runs.get(), 1);
        assert!(!x.has_listeners());
    }

    #[test]
    fn owner_disposes_subscription() {
        let sched = Scheduler::new();
        let x = Observable::new(&sched, 1);
        let bin = crate::dispose::DisposeBin::new();
        let runs = Rc::new(Cell::new(0u32));

        let (x_in, runs_in) = (x.clone(), Rc::clone(&runs));
        let sub = subscribe(&sched, Some(&bin), move |cx| {
            let _ = cx.read(&x_in);
            runs_in.set(runs_in.get() + 1);
        });

        bin.dispose();
        assert!(sub.is_disposed());
        x.set(2);
        assert_eq!(runs.get(), 1);
    }
}
