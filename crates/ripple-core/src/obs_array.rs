#![forbid(unsafe_code)]

//! Array-valued observables with structured splice notifications.
//!
//! [`ObsArray<T>`] has the same change contract as `Observable<Vec<T>>`,
//! but its splice-shaped mutations (`push`, `pop`, `shift`, `unshift`,
//! `splice`) additionally describe the change as a [`Splice`] so consumers
//! can do an O(delta) update instead of an O(n) rebuild. Whole-array `set`
//! emits without a splice descriptor, signaling a full rebuild.
//!
//! The backing vec is mutated in place, so a change event does not carry
//! "new" and "old" array copies; listeners read current contents through
//! the handle (`with`/`get`), and the descriptor carries the deleted
//! elements.
//!
//! # Invariants
//!
//! 1. Splice mutations emit exactly one event with `splice: Some(..)`;
//!    `set`/`set_and_trigger` emit with `splice: None`.
//! 2. The vec is updated before listeners run.
//! 3. With element disposal enabled, spliced-out elements are disposed
//!    after listeners saw the event, and all remaining elements are
//!    disposed when the array is.

use std::cell::RefCell;
use std::rc::Rc;

use crate::dispose::{Disposable, Owner, OwnerExt};
use crate::emit::{Emitter, Listener};
use crate::scheduler::Scheduler;
use crate::subscribe::{DepSource, ReactiveValue, next_source_id};

/// Structured description of one splice-shaped mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Splice<T> {
    /// Index where the change starts.
    pub start: usize,
    /// Number of elements inserted at `start`.
    pub num_added: usize,
    /// The removed elements, in their original order.
    pub deleted: Vec<T>,
}

/// Change event for [`ObsArray`] listeners.
///
/// `splice` is `Some` for incremental mutations and `None` for whole-array
/// replacement (full rebuild).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayChange<T> {
    /// Incremental change description, when available.
    pub splice: Option<Splice<T>>,
}

struct ArrayState<T> {
    items: Vec<T>,
    /// Listeners this array keeps alive until disposal (derived-array
    /// wiring).
    links: Vec<Listener>,
    /// Installed by `autodispose_elements`: run over removed elements.
    elem_disposer: Option<Rc<dyn Fn(&T)>>,
}

struct ArrayCore<T> {
    id: u64,
    sched: Scheduler,
    state: RefCell<Option<ArrayState<T>>>,
    emitter: Emitter<ArrayChange<T>>,
}

/// An array-valued observable. Cheap to clone; clones share the array.
pub struct ObsArray<T> {
    core: Rc<ArrayCore<T>>,
}

impl<T> Clone for ObsArray<T> {
    fn clone(&self) -> Self {
        Self {
            core: Rc::clone(&self.core),
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for ObsArray<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.core.state.borrow();
        f.debug_struct("ObsArray")
            .field("items", &state.as_ref().map(|s| &s.items))
            .finish()
    }
}

impl<T: Clone + 'static> ObsArray<T> {
    /// Create an array observable holding `items`.
    #[must_use]
    pub fn new(sched: &Scheduler, items: Vec<T>) -> Self {
        Self {
            core: Rc::new(ArrayCore {
                id: next_source_id(),
                sched: sched.clone(),
                state: RefCell::new(Some(ArrayState {
                    items,
                    links: Vec::new(),
                    elem_disposer: None,
                })),
                emitter: Emitter::new(),
            }),
        }
    }

    /// Like [`new`](ObsArray::new), registering with `owner` for disposal.
    #[must_use]
    pub fn create(sched: &Scheduler, owner: &dyn Owner, items: Vec<T>) -> Self {
        let arr = Self::new(sched, items);
        owner.autodispose_boxed(Box::new(arr.clone()));
        arr
    }

    /// Clone of the current contents. Pure read.
    #[must_use]
    pub fn get(&self) -> Vec<T> {
        self.with(<[T]>::to_vec)
    }

    /// Access the current contents by reference without cloning.
    pub fn with<R>(&self, f: impl FnOnce(&[T]) -> R) -> R {
        let state = self.core.state.borrow();
        f(&state.as_ref().expect("ObsArray used after dispose").items)
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.with(<[T]>::len)
    }

    /// Whether the array is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append an element. Emits a splice descriptor.
    pub fn push(&self, item: T) {
        let start = self.len();
        self.splice(start, 0, vec![item]);
    }

    /// Remove and return the last element. Emits a splice descriptor.
    pub fn pop(&self) -> Option<T> {
        let len = self.len();
        if len == 0 {
            return None;
        }
        self.splice(len - 1, 1, Vec::new()).pop()
    }

    /// Insert an element at the front. Emits a splice descriptor.
    pub fn unshift(&self, item: T) {
        self.splice(0, 0, vec![item]);
    }

    /// Remove and return the first element. Emits a splice descriptor.
    pub fn shift(&self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        self.splice(0, 1, Vec::new()).pop()
    }

    /// Remove `delete_count` elements at `start` (clamped to the current
    /// length), insert `items` there, and return the removed elements.
    ///
    /// Listeners run after the mutation; removed elements are disposed
    /// afterwards when element disposal is enabled.
    pub fn splice(&self, start: usize, delete_count: usize, items: Vec<T>) -> Vec<T> {
        let num_added = items.len();
        let (start, deleted) = {
            let mut state = self.core.state.borrow_mut();
            let state = state.as_mut().expect("ObsArray used after dispose");
            let start = start.min(state.items.len());
            let end = start.saturating_add(delete_count).min(state.items.len());
            let deleted: Vec<T> = state.items.splice(start..end, items).collect();
            (start, deleted)
        };

        let event = ArrayChange {
            splice: Some(Splice {
                start,
                num_added,
                deleted,
            }),
        };
        self.core.emitter.emit(&event);

        let deleted = match event.splice {
            Some(splice) => splice.deleted,
            None => Vec::new(),
        };
        self.dispose_elements(&deleted);
        self.core.sched.drain();
        deleted
    }

    /// Replace the whole array, skipping the write when contents compare
    /// equal. Emits with no splice descriptor (full rebuild).
    pub fn set(&self, items: Vec<T>)
    where
        T: PartialEq,
    {
        let replaced = {
            let mut state = self.core.state.borrow_mut();
            let state = state.as_mut().expect("ObsArray used after dispose");
            if state.items == items {
                return;
            }
            std::mem::replace(&mut state.items, items)
        };
        self.core.emitter.emit(&ArrayChange { splice: None });
        self.dispose_elements(&replaced);
        self.core.sched.drain();
    }

    /// Replace the whole array and notify unconditionally.
    pub fn set_and_trigger(&self, items: Vec<T>) {
        let replaced = {
            let mut state = self.core.state.borrow_mut();
            let state = state.as_mut().expect("ObsArray used after dispose");
            std::mem::replace(&mut state.items, items)
        };
        self.core.emitter.emit(&ArrayChange { splice: None });
        self.dispose_elements(&replaced);
        self.core.sched.drain();
    }

    /// Register a change listener.
    pub fn add_listener(&self, cb: impl Fn(&ArrayChange<T>) + 'static) -> Listener {
        self.core.emitter.add_listener(cb)
    }

    /// Whether any listener is currently registered.
    #[must_use]
    pub fn has_listeners(&self) -> bool {
        self.core.emitter.has_listeners()
    }

    /// The erased dependency edge for this array.
    #[must_use]
    pub fn as_dep(&self) -> Rc<dyn DepSource> {
        Rc::new(self.clone())
    }

    /// Keep `listener` alive until this array is disposed.
    pub(crate) fn keep_link(&self, listener: Listener) {
        let mut state = self.core.state.borrow_mut();
        state
            .as_mut()
            .expect("ObsArray used after dispose")
            .links
            .push(listener);
    }

    fn dispose_elements(&self, removed: &[T]) {
        if removed.is_empty() {
            return;
        }
        let disposer = {
            let state = self.core.state.borrow();
            state.as_ref().and_then(|s| s.elem_disposer.clone())
        };
        if let Some(disposer) = disposer {
            for item in removed {
                disposer(item);
            }
        }
    }
}

impl<T: Disposable + Clone + 'static> ObsArray<T> {
    /// Take ownership of the elements: spliced-out elements are disposed
    /// after the change event, and remaining elements are disposed with
    /// the array.
    pub fn autodispose_elements(&self) -> &Self {
        let mut state = self.core.state.borrow_mut();
        state
            .as_mut()
            .expect("ObsArray used after dispose")
            .elem_disposer = Some(Rc::new(|item: &T| item.dispose()));
        self
    }
}

impl<T: Clone + 'static> DepSource for ObsArray<T> {
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

impl<T: Clone + 'static> ReactiveValue<Vec<T>> for ObsArray<T> {
    fn sample(&self) -> Vec<T> {
        self.get()
    }

    fn as_dep(&self) -> Rc<dyn DepSource> {
        ObsArray::as_dep(self)
    }
}

impl<T: 'static> Disposable for ObsArray<T> {
    fn dispose(&self) {
        let state = self.core.state.borrow_mut().take();
        let Some(state) = state else {
            return;
        };
        for link in state.links {
            link.dispose();
        }
        if let Some(disposer) = state.elem_disposer {
            for item in &state.items {
                disposer(item);
            }
        }
        self.core.emitter.dispose();
    }

    fn is_disposed(&self) -> bool {
        self.core.state.borrow().is_none()
    }
}

// ─── Derived arrays ──────────────────────────────────────────────────────────

/// A derived array that maps `source` through `map`, applying the mapper
/// only to the added slice when splice info is available (O(delta) instead
/// of O(n)).
///
/// The result follows `source` until either array is disposed.
pub fn computed_array<S, T>(
    sched: &Scheduler,
    owner: Option<&dyn Owner>,
    source: &ObsArray<S>,
    map: impl Fn(&S) -> T + 'static,
) -> ObsArray<T>
where
    S: Clone + 'static,
    T: Clone + 'static,
{
    let out = ObsArray::new(sched, source.with(|v| v.iter().map(&map).collect()));

    let src = source.clone();
    let out_in = out.clone();
    let link = source.add_listener(move |change: &ArrayChange<S>| {
        match change.splice.as_ref() {
            Some(splice) => {
                let added: Vec<T> = src.with(|v| {
                    v[splice.start..splice.start + splice.num_added]
                        .iter()
                        .map(&map)
                        .collect()
                });
                let _ = out_in.splice(splice.start, splice.deleted.len(), added);
            }
            None => out_in.set_and_trigger(src.with(|v| v.iter().map(&map).collect())),
        }
    });
    out.keep_link(link);

    if let Some(owner) = owner {
        owner.autodispose(out.clone());
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
