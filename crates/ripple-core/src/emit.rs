#![forbid(unsafe_code)]

//! The notification primitive: an O(1)-churn listener list and a typed
//! event emitter built on it.
//!
//! # Invariants
//!
//! 1. `add_listener` and listener disposal are O(1) (intrusive doubly-linked
//!    list; no scan, no shifting).
//! 2. Emission order is registration order.
//! 3. Mutating the list during emission is safe: a listener removed before
//!    its turn is skipped; a listener added mid-emit does not run in that
//!    round (documented as acceptable, not guaranteed either way).
//! 4. Return values of listener callbacks do not exist; listeners cannot
//!    veto or halt emission.
//! 5. `emit()` on a disposed emitter panics: emitting after disposal is a
//!    logic error upstream and must never silently no-op.
//!
//! # Failure Modes
//!
//! - **Listener panic**: propagates to the emitter; later listeners in that
//!   round do not run. Disposal-time callbacks are the exception and are
//!   handled by the disposal graph instead (see `dispose`).

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::dispose::Disposable;
use crate::error::ReactiveError;

// ─── Intrusive listener list ─────────────────────────────────────────────────

struct Node<L: ?Sized> {
    removed: Rc<Cell<bool>>,
    prev: RefCell<Option<Weak<Node<L>>>>,
    next: RefCell<Option<Rc<Node<L>>>>,
    cb: Box<L>,
}

struct ListState<L: ?Sized> {
    head: Option<Rc<Node<L>>>,
    tail: Option<Weak<Node<L>>>,
    len: usize,
}

struct ListInner<L: ?Sized> {
    state: RefCell<Option<ListState<L>>>,
    // Single slot, last write wins. Rc so it can be invoked without holding
    // the RefCell borrow across the call.
    change_cb: RefCell<Option<Rc<dyn Fn(bool)>>>,
}

/// Ordered listener list with O(1) insertion and removal.
///
/// This is the shared machinery under [`Emitter`] and the array observable;
/// callers pick the boxed callback type `L`.
pub(crate) struct ListenerList<L: ?Sized> {
    inner: Rc<ListInner<L>>,
}

impl<L: ?Sized> Clone for ListenerList<L> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<L: ?Sized + 'static> ListenerList<L> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Rc::new(ListInner {
                state: RefCell::new(Some(ListState {
                    head: None,
                    tail: None,
                    len: 0,
                })),
                change_cb: RefCell::new(None),
            }),
        }
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.inner.state.borrow().is_none()
    }

    pub(crate) fn has_listeners(&self) -> bool {
        self.inner.state.borrow().as_ref().is_some_and(|s| s.len > 0)
    }

    /// Append a callback at the tail; returns its disposable handle.
    pub(crate) fn add(&self, cb: Box<L>) -> Listener {
        let node = Rc::new(Node {
            removed: Rc::new(Cell::new(false)),
            prev: RefCell::new(None),
            next: RefCell::new(None),
            cb,
        });

        let became_nonempty = {
            let mut state = self.inner.state.borrow_mut();
            let state = state
                .as_mut()
                .expect("listener added to a disposed emitter");
            match state.tail.take().and_then(|w| w.upgrade()) {
                Some(tail) => {
                    *node.prev.borrow_mut() = Some(Rc::downgrade(&tail));
                    *tail.next.borrow_mut() = Some(Rc::clone(&node));
                }
                None => state.head = Some(Rc::clone(&node)),
            }
            state.tail = Some(Rc::downgrade(&node));
            state.len += 1;
            state.len == 1
        };

        if became_nonempty {
            self.notify_change(true);
        }

        let removed = Rc::clone(&node.removed);
        let list = Rc::downgrade(&self.inner);
        let weak_node = Rc::downgrade(&node);
        Listener {
            inner: Rc::new(ListenerInner {
                removed,
                unlink: RefCell::new(Some(Box::new(move || {
                    if let (Some(list), Some(node)) = (list.upgrade(), weak_node.upgrade()) {
                        unlink(&list, &node);
                    }
                }))),
            }),
        }
    }

    /// Invoke `f` for every listener registered at the start of the call,
    /// skipping ones removed before their turn.
    pub(crate) fn for_each(&self, f: impl Fn(&L)) {
        let snapshot = {
            let state = self.inner.state.borrow();
            let Some(state) = state.as_ref() else {
                return;
            };
            let mut nodes = Vec::with_capacity(state.len);
            let mut cursor = state.head.clone();
            while let Some(node) = cursor {
                let next = node.next.borrow().clone();
                nodes.push(node);
                cursor = next;
            }
            nodes
        };
        for node in snapshot {
            if !node.removed.get() {
                f(&node.cb);
            }
        }
    }

    pub(crate) fn set_change_cb(&self, cb: Rc<dyn Fn(bool)>) {
        *self.inner.change_cb.borrow_mut() = Some(cb);
    }

    pub(crate) fn dispose(&self) {
        let state = self.inner.state.borrow_mut().take();
        let Some(state) = state else {
            return;
        };
        let had_listeners = state.len > 0;
        // Mark every node removed and break the forward Rc chain.
        let mut cursor = state.head;
        while let Some(node) = cursor {
            node.removed.set(true);
            *node.prev.borrow_mut() = None;
            cursor = node.next.borrow_mut().take();
        }
        if had_listeners {
            self.notify_change(false);
        }
        self.inner.change_cb.borrow_mut().take();
    }

    fn notify_change(&self, has_listeners: bool) {
        let cb = self.inner.change_cb.borrow().clone();
        if let Some(cb) = cb {
            cb(has_listeners);
        }
    }
}

/// Unlink one node; O(1). Safe to call for an already-removed node.
fn unlink<L: ?Sized>(list: &Rc<ListInner<L>>, node: &Rc<Node<L>>) {
    if node.removed.replace(true) {
        return;
    }
    let became_empty = {
        let mut state = list.state.borrow_mut();
        let Some(state) = state.as_mut() else {
            return;
        };
        let prev = node.prev.borrow_mut().take();
        let next = node.next.borrow_mut().take();
        match prev.as_ref().and_then(Weak::upgrade) {
            Some(prev_node) => *prev_node.next.borrow_mut() = next.clone(),
            None => state.head = next.clone(),
        }
        match next {
            Some(next_node) => *next_node.prev.borrow_mut() = prev,
            None => state.tail = prev,
        }
        state.len -= 1;
        state.len == 0
    };
    if became_empty {
        let cb = list.change_cb.borrow().clone();
        if let Some(cb) = cb {
            cb(false);
        }
    }
}

// ─── Listener ────────────────────────────────────────────────────────────────

struct ListenerInner {
    removed: Rc<Cell<bool>>,
    unlink: RefCell<Option<Box<dyn FnOnce()>>>,
}

/// Disposable handle to one emitter registration.
///
/// Disposing it is the only way to unsubscribe. Cheap to clone; all clones
/// refer to the same registration.
#[derive(Clone)]
pub struct Listener {
    inner: Rc<ListenerInner>,
}

impl Disposable for Listener {
    fn dispose(&self) {
        if let Some(unlink) = self.inner.unlink.borrow_mut().take() {
            unlink();
        }
    }

    fn is_disposed(&self) -> bool {
        self.inner.removed.get()
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

// ─── Emitter ─────────────────────────────────────────────────────────────────

/// Typed event fan-out over a [`ListenerList`].
///
/// Listeners receive `&E` in registration order; their return values do not
/// exist (no veto, no halt).
pub struct Emitter<E> {
    list: ListenerList<dyn Fn(&E)>,
}

impl<E> Clone for Emitter<E> {
    fn clone(&self) -> Self {
        Self {
            list: self.list.clone(),
        }
    }
}

impl<E: 'static> Default for Emitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: 'static> Emitter<E> {
    /// Create an emitter with no listeners.
    #[must_use]
    pub fn new() -> Self {
        Self {
            list: ListenerList::new(),
        }
    }

    /// Register `cb` at the tail of the list. O(1).
    pub fn add_listener(&self, cb: impl Fn(&E) + 'static) -> Listener {
        self.list.add(Box::new(cb))
    }

    /// Call every currently-registered listener with `event`.
    ///
    /// # Panics
    ///
    /// Panics if the emitter has been disposed.
    pub fn emit(&self, event: &E) {
        assert!(!self.list.is_disposed(), "emit on a disposed emitter");
        self.list.for_each(|cb| cb(event));
    }

    /// Fallible form of [`emit`](Emitter::emit) for callers that would
    /// rather handle the misuse as a value.
    pub fn try_emit(&self, event: &E) -> Result<(), ReactiveError> {
        if self.list.is_disposed() {
            return Err(ReactiveError::EmitAfterDispose);
        }
        self.list.for_each(|cb| cb(event));
        Ok(())
    }

    /// Whether any listener is currently registered. O(1).
    #[must_use]
    pub fn has_listeners(&self) -> bool {
        self.list.has_listeners()
    }

    /// Install the listener-count change callback (single slot, last write
    /// wins). Invoked with the new non-empty state whenever it may have
    /// toggled; used to lazily engage expensive upstream subscriptions.
    pub fn set_listener_change_cb(&self, cb: impl Fn(bool) + 'static) {
        self.list.set_change_cb(Rc::new(cb));
    }
}

impl<E: 'static> Disposable for Emitter<E> {
    fn dispose(&self) {
        self.list.dispose();
    }

    fn is_disposed(&self) -> bool {
        self.list.is_disposed()
    }
}

impl<E: 'static> std::fmt::Debug for Emitter<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter")
            .field("disposed", &self.list.is_disposed())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
