#![forbid(unsafe_code)]

//! The mutable reactive cell.
//!
//! [`Observable<T>`] holds a current value and notifies listeners with a
//! [`Change`] event when the value actually changes. It is the leaf of the
//! dependency graph: reads are pure and O(1), writes fan out synchronously
//! and then kick the scheduler so dependent computeds recompute in
//! topological order.
//!
//! # Invariants
//!
//! 1. `get()` never subscribes and never triggers recomputation.
//! 2. `set(v)` notifies only when `v != current` (value identity via
//!    `PartialEq`, not deep content diffing); `set_and_trigger` always
//!    notifies.
//! 3. The stored value is updated before listeners run, so reads during
//!    emission observe the new value.
//! 4. Disposal discards the stored value, disposes the owned-value slot,
//!    and detaches all listeners; reads afterwards fail loudly.

use std::cell::RefCell;
use std::rc::Rc;

use crate::dispose::{Disposable, Holder};
use crate::emit::{Emitter, Listener};
use crate::scheduler::Scheduler;
use crate::subscribe::{DepSource, ReactiveValue, next_source_id};

/// Change event delivered to observable listeners: the value just stored
/// and the one it replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change<T> {
    /// The value after the write.
    pub value: T,
    /// The value before the write.
    pub prev: T,
}

struct ObsCore<T> {
    id: u64,
    sched: Scheduler,
    value: RefCell<Option<T>>,
    emitter: Emitter<Change<T>>,
    holder: Holder,
}

/// A mutable cell with change notification. Cheap to clone; clones share
/// the same cell.
pub struct Observable<T> {
    core: Rc<ObsCore<T>>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            core: Rc::clone(&self.core),
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observable")
            .field("value", &self.core.value.borrow())
            .finish()
    }
}

impl<T: Clone + 'static> Observable<T> {
    /// Create an observable holding `value`, wired to `sched`.
    #[must_use]
    pub fn new(sched: &Scheduler, value: T) -> Self {
        Self {
            core: Rc::new(ObsCore {
                id: next_source_id(),
                sched: sched.clone(),
                value: RefCell::new(Some(value)),
                emitter: Emitter::new(),
                holder: Holder::new(),
            }),
        }
    }

    /// Like [`new`](Observable::new), registering the observable with
    /// `owner` for disposal.
    #[must_use]
    pub fn create(sched: &Scheduler, owner: &dyn crate::dispose::Owner, value: T) -> Self {
        let obs = Self::new(sched, value);
        owner.autodispose_boxed(Box::new(obs.clone()));
        obs
    }

    /// Current value. Pure read; never subscribes.
    ///
    /// # Panics
    ///
    /// Panics if the observable has been disposed.
    #[must_use]
    pub fn get(&self) -> T {
        self.core
            .value
            .borrow()
            .as_ref()
            .expect("Observable used after dispose")
            .clone()
    }

    /// Access the current value by reference without cloning.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let value = self.core.value.borrow();
        f(value.as_ref().expect("Observable used after dispose"))
    }

    /// Store `value` and notify listeners, skipping the write entirely when
    /// the value compares equal to the current one.
    pub fn set(&self, value: T)
    where
        T: PartialEq,
    {
        let prev = {
            let mut slot = self.core.value.borrow_mut();
            let current = slot.as_mut().expect("Observable used after dispose");
            if *current == value {
                return;
            }
            std::mem::replace(current, value.clone())
        };
        self.core.emitter.emit(&Change { value, prev });
        self.core.sched.drain();
    }

    /// Store `value` and notify listeners unconditionally.
    ///
    /// For values whose identity is stable while their contents mutated
    /// externally; `set` would treat them as unchanged.
    pub fn set_and_trigger(&self, value: T) {
        let prev = {
            let mut slot = self.core.value.borrow_mut();
            let current = slot.as_mut().expect("Observable used after dispose");
            std::mem::replace(current, value.clone())
        };
        self.core.emitter.emit(&Change { value, prev });
        self.core.sched.drain();
    }

    /// Register a change listener.
    pub fn add_listener(&self, cb: impl Fn(&Change<T>) + 'static) -> Listener {
        self.core.emitter.add_listener(cb)
    }

    /// Whether any listener is currently registered.
    #[must_use]
    pub fn has_listeners(&self) -> bool {
        self.core.emitter.has_listeners()
    }

    /// Take ownership of a disposable resource, disposing the previously
    /// held one (if any) first. Returns `obj` unchanged for chaining.
    pub fn autodispose_value<D: Disposable + Clone + 'static>(&self, obj: D) -> D {
        self.core.holder.hold(obj)
    }

    /// The erased dependency edge for this observable.
    #[must_use]
    pub fn as_dep(&self) -> Rc<dyn DepSource> {
        Rc::new(self.clone())
    }
}

impl<T: Clone + 'static> DepSource for Observable<T> {
    fn source_id(&self) -> u64 {
        self.core.id
    }

    fn priority(&self) -> u32 {
        0
    }

    fn listen(&self, on_change: Box<dyn Fn()>) -> Listener {
        self.core.emitter.add_listener(move |_| on_change())
    }
}

impl<T: Clone + 'static> ReactiveValue<T> for Observable<T> {
    fn sample(&self) -> T {
        self.get()
    }

    fn as_dep(&self) -> Rc<dyn DepSource> {
        Observable::as_dep(self)
    }
}

impl<T: 'static> Disposable for Observable<T> {
    fn dispose(&self) {
        if self.core.value.borrow_mut().take().is_none() {
            return;
        }
        self.core.holder.dispose();
        self.core.emitter.dispose();
    }

    fn is_disposed(&self) -> bool {
        self.core.value.borrow().is_none()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
