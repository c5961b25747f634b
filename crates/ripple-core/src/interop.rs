#![forbid(unsafe_code)]

//! Bridging to and from foreign reactive systems.
//!
//! [`ForeignSource`] is the minimal contract an external reactive cell must
//! offer: a synchronous read and a change subscription. [`wrap_foreign`]
//! turns such a source into a [`ForeignObservable`], a first-class
//! dependency that subscriptions and computeds can track like any native
//! observable. The reverse direction is free: [`Observable`] and
//! [`Computed`] implement `ForeignSource` themselves, so
//! [`expose_foreign`] hands them to an external system unchanged.
//!
//! # Invariants
//!
//! 1. Wrapping the same source (same `Rc` allocation) through the same
//!    scheduler yields the same wrapper while one is alive, so dependency
//!    deduplication keeps working across call sites.
//! 2. The upstream subscription is lazy: the foreign source sees a
//!    subscriber only while the wrapper itself has listeners, and is
//!    unsubscribed when the last one detaches.
//! 3. Reads always go through to the source; the wrapper caches only the
//!    previous value needed for [`Change`] events, never the current one.
//! 4. A foreign notification that does not actually change the value (by
//!    `PartialEq`) is swallowed.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::computed::Computed;
use crate::dispose::Disposable;
use crate::emit::{Emitter, Listener};
use crate::observable::{Change, Observable};
use crate::scheduler::Scheduler;
use crate::subscribe::{DepSource, ReactiveValue, next_source_id};

/// The contract a foreign reactive cell must satisfy to be wrapped.
pub trait ForeignSource<T> {
    /// Read the current value. Synchronous and side-effect free.
    fn read(&self) -> T;

    /// Register a change notification callback; the returned handle
    /// unsubscribes on disposal.
    fn subscribe_changes(&self, on_change: Box<dyn Fn()>) -> Box<dyn Disposable>;
}

struct ForeignState<T> {
    source: Rc<dyn ForeignSource<T>>,
    /// Previous value, tracked only while the upstream subscription is
    /// active; feeds `Change::prev`.
    last: Option<T>,
    upstream: Option<Box<dyn Disposable>>,
}

struct ForeignCore<T> {
    id: u64,
    sched: Scheduler,
    state: RefCell<Option<ForeignState<T>>>,
    emitter: Emitter<Change<T>>,
}

/// A foreign cell adapted into the dependency graph. Cheap to clone;
/// clones share the adapter.
pub struct ForeignObservable<T> {
    core: Rc<ForeignCore<T>>,
}

impl<T> Clone for ForeignObservable<T> {
    fn clone(&self) -> Self {
        Self {
            core: Rc::clone(&self.core),
        }
    }
}

impl<T> std::fmt::Debug for ForeignObservable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForeignObservable")
            .field("disposed", &self.core.state.borrow().is_none())
            .finish()
    }
}

/// Wrap `source` for use as a dependency, reusing a live wrapper if this
/// scheduler already has one for the same source allocation.
pub fn wrap_foreign<T: Clone + PartialEq + 'static>(
    sched: &Scheduler,
    source: Rc<dyn ForeignSource<T>>,
) -> ForeignObservable<T> {
    let key = Rc::as_ptr(&source) as *const () as usize;
    let hit = sched.with_foreign_cache(|cache| {
        cache
            .get(&key)
            .and_then(|any| any.downcast_ref::<Weak<ForeignCore<T>>>())
            .and_then(Weak::upgrade)
    });
    if let Some(core) = hit
        && core.state.borrow().is_some()
    {
        return ForeignObservable { core };
    }

    let wrapper = ForeignObservable::new(sched, source);
    sched.with_foreign_cache(|cache| {
        cache.insert(key, Box::new(Rc::downgrade(&wrapper.core)));
    });
    wrapper
}

impl<T: Clone + PartialEq + 'static> ForeignObservable<T> {
    fn new(sched: &Scheduler, source: Rc<dyn ForeignSource<T>>) -> Self {
        let core = Rc::new(ForeignCore {
            id: next_source_id(),
            sched: sched.clone(),
            state: RefCell::new(Some(ForeignState {
                source,
                last: None,
                upstream: None,
            })),
            emitter: Emitter::new(),
        });

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

        Self { core }
    }

    /// Current value, read through to the foreign source.
    ///
    /// # Panics
    ///
    /// Panics if the wrapper has been disposed.
    #[must_use]
    pub fn get(&self) -> T {
        let source = {
            let state = self.core.state.borrow();
            Rc::clone(
                &state
                    .as_ref()
                    .expect("ForeignObservable used after dispose")
                    .source,
            )
        };
        source.read()
    }

    /// Register a change listener; engages the upstream subscription if
    /// this is the first one.
    pub fn add_listener(&self, cb: impl Fn(&Change<T>) + 'static) -> Listener {
        self.core.emitter.add_listener(cb)
    }

    /// Whether the upstream subscription is currently engaged.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.core
            .state
            .borrow()
            .as_ref()
            .is_some_and(|s| s.upstream.is_some())
    }

    /// The erased dependency edge for this wrapper.
    #[must_use]
    pub fn as_dep(&self) -> Rc<dyn DepSource> {
        Rc::new(self.clone())
    }
}

/// Engage the upstream subscription and capture the baseline value.
fn activate<T: Clone + PartialEq + 'static>(core: &Rc<ForeignCore<T>>) {
    let source = {
        let state = core.state.borrow();
        match state.as_ref() {
            Some(state) if state.upstream.is_none() => Rc::clone(&state.source),
            _ => return,
        }
    };
    let baseline = source.read();
    let weak = Rc::downgrade(core);
    let upstream = source.subscribe_changes(Box::new(move || {
        if let Some(core) = weak.upgrade() {
            on_foreign_change(&core);
        }
    }));

    let mut state = core.state.borrow_mut();
    if let Some(state) = state.as_mut()
        && state.upstream.is_none()
    {
        state.last = Some(baseline);
        state.upstream = Some(upstream);
    } else {
        drop(state);
        upstream.dispose();
    }
}

/// Drop the upstream subscription once the last listener detached.
fn deactivate<T>(core: &Rc<ForeignCore<T>>) {
    let upstream = {
        let mut state = core.state.borrow_mut();
        match state.as_mut() {
            Some(state) => {
                state.last = None;
                state.upstream.take()
            }
            None => None,
        }
    };
    if let Some(upstream) = upstream {
        upstream.dispose();
    }
}

fn on_foreign_change<T: Clone + PartialEq + 'static>(core: &Rc<ForeignCore<T>>) {
    let source = {
        let state = core.state.borrow();
        match state.as_ref() {
            Some(state) => Rc::clone(&state.source),
            None => return,
        }
    };
    let new = source.read();
    let change = {
        let mut state = core.state.borrow_mut();
        let Some(state) = state.as_mut() else {
            return;
        };
        match state.last.replace(new.clone()) {
            Some(prev) if prev == new => None,
            Some(prev) => Some(Change { value: new, prev }),
            None => None, // Not active; stale notification.
        }
    };
    if let Some(change) = change {
        core.emitter.emit(&change);
        core.sched.drain();
    }
}

impl<T: Clone + PartialEq + 'static> DepSource for ForeignObservable<T> {
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

impl<T: Clone + PartialEq + 'static> ReactiveValue<T> for ForeignObservable<T> {
    fn sample(&self) -> T {
        self.get()
    }

    fn as_dep(&self) -> Rc<dyn DepSource> {
        ForeignObservable::as_dep(self)
    }
}

impl<T: 'static> Disposable for ForeignObservable<T> {
    fn dispose(&self) {
        let state = self.core.state.borrow_mut().take();
        let Some(state) = state else {
            return;
        };
        // Drop our cache entry so the map does not accumulate dead wrappers.
        // Guard against pointer reuse: only remove an entry that is ours.
        let key = Rc::as_ptr(&state.source) as *const () as usize;
        self.core.sched.with_foreign_cache(|cache| {
            let ours = cache
                .get(&key)
                .and_then(|any| any.downcast_ref::<Weak<ForeignCore<T>>>())
                .is_some_and(|weak| weak.as_ptr() == Rc::as_ptr(&self.core));
            if ours {
                cache.remove(&key);
            }
        });
        if let Some(upstream) = state.upstream {
            upstream.dispose();
        }
        self.core.emitter.dispose();
    }

    fn is_disposed(&self) -> bool {
        self.core.state.borrow().is_none()
    }
}

// ─── Exposing native sources ─────────────────────────────────────────────────

impl<T: Clone + PartialEq + 'static> ForeignSource<T> for Observable<T> {
    fn read(&self) -> T {
        self.get()
    }

    fn subscribe_changes(&self, on_change: Box<dyn Fn()>) -> Box<dyn Disposable> {
        Box::new(self.add_listener(move |_| on_change()))
    }
}

impl<T: Clone + PartialEq + 'static> ForeignSource<T> for Computed<T> {
    fn read(&self) -> T {
        self.get()
    }

    fn subscribe_changes(&self, on_change: Box<dyn Fn()>) -> Box<dyn Disposable> {
        Box::new(self.add_listener(move |_| on_change()))
    }
}

/// Hand a native source to an external reactive system.
pub fn expose_foreign<T: 'static>(source: impl ForeignSource<T> + 'static) -> Rc<dyn ForeignSource<T>> {
    Rc::new(source)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
