#![forbid(unsafe_code)]

//! Derived values: [`Computed`] and [`PureComputed`].
//!
//! A `Computed<T>` wraps a read function evaluated inside a fresh
//! [`UseCx`]: every observable it reads becomes a dependency for that pass
//! (see `subscribe`). It is evaluated once synchronously at construction,
//! then re-evaluated by the scheduler whenever a dependency changes, and it
//! propagates its own change through its emitter only when the value
//! actually changed.
//!
//! State machine: fresh (constructed, evaluated once) → clean → queued
//! (a dependency changed; awaiting the drain) → clean, or disposed
//! (terminal, all dependency listeners removed).
//!
//! `PureComputed<T>` has the identical evaluation contract, but keeps its
//! dependency listeners only while it has at least one listener of its own
//! (driven by the emitter's listener-count callback). While unobserved,
//! `get()` re-runs the read function with a throwaway context on every
//! call.
//!
//! # Invariants
//!
//! 1. Within one update wave, a computed re-evaluates at most once, and
//!    strictly after every dependency it (transitively) reads.
//! 2. `get()` on a `Computed` is a pure O(1) read of the cached value; the
//!    scheduler keeps it current.
//! 3. A computed stores nothing on write: `set()` forwards to the write
//!    callback installed with `on_write`, or fails with
//!    [`ReactiveError::NotWritable`].
//! 4. Dependency cycles do not loop: each member of the cycle recomputes at
//!    most once per wave.
//!
//! # Failure Modes
//!
//! - **Read function panics during a drain**: the cached value stays from
//!   the last successful evaluation, the wave is aborted (see `scheduler`),
//!   and the panic propagates.
//! - **Dependency disposed**: its listeners are detached, so the computed
//!   simply stops hearing from it; the next evaluation pass drops the edge.

use std::cell::RefCell;
use std::rc::Rc;

use crate::dispose::{Disposable, Owner, OwnerExt};
use crate::emit::{Emitter, Listener};
use crate::error::ReactiveError;
use crate::observable::Change;
use crate::scheduler::Scheduler;
use crate::subscribe::{DepSource, ReactiveValue, Subscription, UseCx, next_source_id};

// ─── Computed ────────────────────────────────────────────────────────────────

struct ComputedState<T> {
    /// None only before the construction-time evaluation completes.
    value: Option<T>,
    read: Rc<dyn Fn(&mut UseCx) -> T>,
    write: Option<Rc<dyn Fn(T)>>,
}

struct ComputedCore<T> {
    id: u64,
    state: RefCell<Option<ComputedState<T>>>,
    emitter: Emitter<Change<T>>,
    sub: RefCell<Option<Subscription>>,
}

/// An observable whose value is derived from other observables.
///
/// Cheap to clone; clones share the same cell.
pub struct Computed<T> {
    core: Rc<ComputedCore<T>>,
}

impl<T> Clone for Computed<T> {
    fn clone(&self) -> Self {
        Self {
            core: Rc::clone(&self.core),
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Computed<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.core.state.borrow();
        f.debug_struct("Computed")
            .field("value", &state.as_ref().map(|s| &s.value))
            .finish()
    }
}

fn evaluate<T: Clone + PartialEq + 'static>(core: &Rc<ComputedCore<T>>, cx: &mut UseCx) {
    let read = {
        let state = core.state.borrow();
        let Some(state) = state.as_ref() else {
            return; // Disposed while queued.
        };
        Rc::clone(&state.read)
    };
    let new = read(cx);
    let change = {
        let mut state = core.state.borrow_mut();
        let Some(state) = state.as_mut() else {
            return;
        };
        let unchanged = matches!(state.value.as_ref(), Some(old) if *old == new);
        if unchanged {
            None
        } else {
            // First (construction-time) evaluation caches without emitting.
            state
                .value
                .replace(new.clone())
                .map(|prev| Change { value: new, prev })
        }
    };
    if let Some(change) = change {
        core.emitter.emit(&change);
    }
}

impl<T: Clone + PartialEq + 'static> Computed<T> {
    /// Create a computed from a read function; dependencies are whatever
    /// the function reads through its [`UseCx`]. Evaluated synchronously
    /// before this returns.
    pub fn new(
        sched: &Scheduler,
        owner: Option<&dyn Owner>,
        read: impl Fn(&mut UseCx) -> T + 'static,
    ) -> Self {
        Self::with_deps(sched, owner, Vec::new(), read)
    }

    /// Like [`new`](Computed::new), with explicit leading dependencies that
    /// are tracked whether or not the read function samples them.
    pub fn with_deps(
        sched: &Scheduler,
        owner: Option<&dyn Owner>,
        deps: Vec<Rc<dyn DepSource>>,
        read: impl Fn(&mut UseCx) -> T + 'static,
    ) -> Self {
        let core = Rc::new(ComputedCore {
            id: next_source_id(),
            state: RefCell::new(Some(ComputedState {
                value: None,
                read: Rc::new(read),
                write: None,
            })),
            emitter: Emitter::new(),
            sub: RefCell::new(None),
        });

        let weak = Rc::downgrade(&core);
        let sub = Subscription::new_deferred(
            sched,
            deps,
            Rc::new(move |cx| {
                if let Some(core) = weak.upgrade() {
                    evaluate(&core, cx);
                }
            }),
        );
        *core.sub.borrow_mut() = Some(sub.clone());
        sub.run_now();

        let handle = Self { core };
        if let Some(owner) = owner {
            owner.autodispose(handle.clone());
        }
        handle
    }

    /// Cached value. Pure O(1) read; the scheduler keeps it current.
    ///
    /// # Panics
    ///
    /// Panics if the computed has been disposed.
    #[must_use]
    pub fn get(&self) -> T {
        let state = self.core.state.borrow();
        state
            .as_ref()
            .expect("Computed used after dispose")
            .value
            .as_ref()
            .expect("computed is evaluated at construction")
            .clone()
    }

    /// Access the cached value by reference without cloning.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let state = self.core.state.borrow();
        f(state
            .as_ref()
            .expect("Computed used after dispose")
            .value
            .as_ref()
            .expect("computed is evaluated at construction"))
    }

    /// Install a write callback, making the computed two-way bound.
    /// Written values are not stored here; the callback is expected to
    /// update the underlying sources.
    pub fn on_write(&self, write: impl Fn(T) + 'static) -> &Self {
        let mut state = self.core.state.borrow_mut();
        state
            .as_mut()
            .expect("Computed used after dispose")
            .write = Some(Rc::new(write));
        self
    }

    /// Forward `value` to the write callback.
    ///
    /// # Panics
    ///
    /// Panics with [`ReactiveError::NotWritable`] if no write callback is
    /// installed.
    pub fn set(&self, value: T) {
        if let Err(err) = self.try_set(value) {
            panic!("{err}");
        }
    }

    /// Fallible form of [`set`](Computed::set).
    pub fn try_set(&self, value: T) -> Result<(), ReactiveError> {
        let write = {
            let state = self.core.state.borrow();
            state
                .as_ref()
                .expect("Computed used after dispose")
                .write
                .clone()
        };
        match write {
            Some(write) => {
                write(value);
                Ok(())
            }
            None => Err(ReactiveError::NotWritable),
        }
    }

    /// Register a change listener.
    pub fn add_listener(&self, cb: impl Fn(&Change<T>) + 'static) -> Listener {
        self.core.emitter.add_listener(cb)
    }

    /// The erased dependency edge for this computed.
    #[must_use]
    pub fn as_dep(&self) -> Rc<dyn DepSource> {
        Rc::new(self.clone())
    }
}

impl<T: Clone + PartialEq + 'static> DepSource for Computed<T> {
    fn source_id(&self) -> u64 {
        self.core.id
    }

    fn priority(&self) -> u32 {
        self.core.sub.borrow().as_ref().map_or(0, Subscription::priority)
    }

    fn listen(&self, on_change: Box<dyn Fn()>) -> Listener {
        self.core.emitter.add_listener(move |_| on_change())
    }
}

impl<T: Clone + PartialEq + 'static> ReactiveValue<T> for Computed<T> {
    fn sample(&self) -> T {
        self.get()
    }

    fn as_dep(&self) -> Rc<dyn DepSource> {
        Computed::as_dep(self)
    }
}

impl<T: 'static> Disposable for Computed<T> {
    fn dispose(&self) {
        if self.core.state.borrow_mut().take().is_none() {
            return;
        }
        if let Some(sub) = self.core.sub.borrow_mut().take() {
            sub.dispose();
        }
        self.core.emitter.dispose();
    }

    fn is_disposed(&self) -> bool {
        self.core.state.borrow().is_none()
    }
}

// ─── PureComputed ────────────────────────────────────────────────────────────

struct PureState<T> {
    read: Rc<dyn Fn(&mut UseCx) -> T>,
    write: Option<Rc<dyn Fn(T)>>,
    /// Cached value; meaningful only while engaged.
    value: Option<T>,
    /// Created lazily on first engagement, then reused: disengaging
    /// disconnects its dependency listeners instead of dropping it.
    sub: Option<Subscription>,
    /// Whether the pure computed currently has listeners of its own.
    engaged: bool,
}

struct PureCore<T> {
    id: u64,
    sched: Scheduler,
    state: RefCell<Option<PureState<T>>>,
    emitter: Emitter<Change<T>>,
}

/// A computed that subscribes to its dependencies only while observed.
///
/// While it has no listeners of its own, it holds no dependency listeners
/// and `get()` recomputes on every call.
pub struct PureComputed<T> {
    core: Rc<PureCore<T>>,
}

impl<T> Clone for PureComputed<T> {
    fn clone(&self) -> Self {
        Self {
            core: Rc::clone(&self.core),
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for PureComputed<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.core.state.borrow();
        f.debug_struct("PureComputed")
            .field("active", &state.as_ref().is_some_and(|s| s.engaged))
            .finish()
    }
}

fn evaluate_pure<T: Clone + PartialEq + 'static>(core: &Rc<PureCore<T>>, cx: &mut UseCx) {
    let read = {
        let state = core.state.borrow();
        let Some(state) = state.as_ref() else {
            return;
        };
        Rc::clone(&state.read)
    };
    let new = read(cx);
    let change = {
        let mut state = core.state.borrow_mut();
        let Some(state) = state.as_mut() else {
            return;
        };
        let unchanged = matches!(state.value.as_ref(), Some(old) if *old == new);
        if unchanged {
            None
        } else {
            state
                .value
                .replace(new.clone())
                .map(|prev| Change { value: new, prev })
        }
    };
    if let Some(change) = change {
        core.emitter.emit(&change);
    }
}

fn activate<T: Clone + PartialEq + 'static>(core: &Rc<PureCore<T>>) {
    let sub = {
        let mut state = core.state.borrow_mut();
        let Some(state) = state.as_mut() else {
            return;
        };
        if state.engaged {
            return;
        }
        state.engaged = true;
        match &state.sub {
            Some(sub) => sub.clone(),
            None => {
                let weak = Rc::downgrade(core);
                let sub = Subscription::new_deferred(
                    &core.sched,
                    Vec::new(),
                    Rc::new(move |cx| {
                        if let Some(core) = weak.upgrade() {
                            evaluate_pure(&core, cx);
                        }
                    }),
                );
                state.sub = Some(sub.clone());
                sub
            }
        }
    };
    sub.run_now();
}

fn deactivate<T>(core: &Rc<PureCore<T>>) {
    let sub = {
        let mut state = core.state.borrow_mut();
        match state.as_mut() {
            Some(state) if state.engaged => {
                state.engaged = false;
                state.value = None;
                state.sub.clone()
            }
            _ => None,
        }
    };
    if let Some(sub) = sub {
        sub.disconnect();
    }
}

impl<T: Clone + PartialEq + 'static> PureComputed<T> {
    /// Create a pure computed. Not evaluated until first observed or read.
    pub fn new(
        sched: &Scheduler,
        owner: Option<&dyn Owner>,
        read: impl Fn(&mut UseCx) -> T + 'static,
    ) -> Self {
        let core = Rc::new(PureCore {
            id: next_source_id(),
            sched: sched.clone(),
            state: RefCell::new(Some(PureState {
                read: Rc::new(read),
                write: None,
                value: None,
                sub: None,
                engaged: false,
            })),
            emitter: Emitter::new(),
        });

        // Engage dependency listeners only while we have listeners of our
        // own; disengage (and drop the cache) when the last one leaves.
        let weak = Rc::downgrade(&core);
        core.emitter.set_listener_change_cb(move |has_listeners| {
            if let Some(core) = weak.upgrade() {
                if has_listeners {
                    activate(&core);
                } else {
                    deactivate(&core);
                }
            }
        });

        let handle = Self { core };
        if let Some(owner) = owner {
            owner.autodispose(handle.clone());
        }
        handle
    }

    /// Current value: the cache while observed, a fresh computation with a
    /// throwaway use-context otherwise.
    #[must_use]
    pub fn get(&self) -> T {
        let read = {
            let state = self.core.state.borrow();
            let state = state.as_ref().expect("PureComputed used after dispose");
            if state.engaged
                && let Some(value) = state.value.as_ref()
            {
                return value.clone();
            }
            Rc::clone(&state.read)
        };
        let mut cx = UseCx::new();
        read(&mut cx)
    }

    /// Whether dependency listeners are currently engaged.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.core
            .state
            .borrow()
            .as_ref()
            .is_some_and(|s| s.engaged)
    }

    /// Install a write callback; see [`Computed::on_write`].
    pub fn on_write(&self, write: impl Fn(T) + 'static) -> &Self {
        let mut state = self.core.state.borrow_mut();
        state
            .as_mut()
            .expect("PureComputed used after dispose")
            .write = Some(Rc::new(write));
        self
    }

    /// Forward `value` to the write callback; panics if none is installed.
    pub fn set(&self, value: T) {
        if let Err(err) = self.try_set(value) {
            panic!("{err}");
        }
    }

    /// Fallible form of [`set`](PureComputed::set).
    pub fn try_set(&self, value: T) -> Result<(), ReactiveError> {
        let write = {
            let state = self.core.state.borrow();
            state
                .as_ref()
                .expect("PureComputed used after dispose")
                .write
                .clone()
        };
        match write {
            Some(write) => {
                write(value);
                Ok(())
            }
            None => Err(ReactiveError::NotWritable),
        }
    }

    /// Register a change listener; engages dependency tracking if this is
    /// the first one.
    pub fn add_listener(&self, cb: impl Fn(&Change<T>) + 'static) -> Listener {
        self.core.emitter.add_listener(cb)
    }

    /// The erased dependency edge for this pure computed.
    #[must_use]
    pub fn as_dep(&self) -> Rc<dyn DepSource> {
        Rc::new(self.clone())
    }
}

impl<T: Clone + PartialEq + 'static> DepSource for PureComputed<T> {
    fn source_id(&self) -> u64 {
        self.core.id
    }

    fn priority(&self) -> u32 {
        self.core
            .state
            .borrow()
            .as_ref()
            .and_then(|s| s.sub.as_ref())
            .map_or(0, Subscription::priority)
    }

    fn listen(&self, on_change: Box<dyn Fn()>) -> Listener {
        self.core.emitter.add_listener(move |_| on_change())
    }
}

impl<T: Clone + PartialEq + 'static> ReactiveValue<T> for PureComputed<T> {
    fn sample(&self) -> T {
        self.get()
    }

    fn as_dep(&self) -> Rc<dyn DepSource> {
        PureComputed::as_dep(self)
    }
}

impl<T: 'static> Disposable for PureComputed<T> {
    fn dispose(&self) {
        let state = self.core.state.borrow_mut().take();
        let Some(state) = state else {
            return;
        };
        if let Some(sub) = state.sub {
            sub.dispose();
        }
        self.core.emitter.dispose();
    }

    fn is_disposed(&self) -> bool {
        self.core.state.borrow().is_none()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
