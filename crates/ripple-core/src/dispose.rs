#![forbid(unsafe_code)]

//! Ownership-tracked disposal: deterministic, exception-safe teardown.
//!
//! Every reactive object in this crate is a cheap `Rc`-backed handle that
//! implements [`Disposable`]. Ownership forms a tree: an [`Owner`] holds an
//! ordered list of cleanup actions, and disposing the owner runs them in
//! strict reverse-of-registration order, exactly once.
//!
//! # Invariants
//!
//! 1. Cleanup actions run in reverse registration order, exactly once each.
//! 2. `dispose()` on an already-disposed object is a no-op.
//! 3. A panicking cleanup action never prevents sibling actions from
//!    running; each failure is logged, and the first payload is re-raised
//!    after all actions completed.
//! 4. [`try_create`] guarantees that a failed initializer leaves nothing
//!    behind: everything registered before the failure is torn down before
//!    the error propagates.
//!
//! # Failure Modes
//!
//! - **Use after dispose**: inner state lives in `RefCell<Option<..>>` and
//!   is taken out on disposal, so later accessor calls fail loudly with a
//!   panic naming the type instead of operating on stale data.
//! - **Cleanup panic**: caught per-action, logged at `error!`, re-raised
//!   once teardown is complete (see invariant 3).

use std::any::Any;
use std::cell::RefCell;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::rc::{Rc, Weak};

use tracing::error;

use crate::error::ReactiveError;

// ─── Disposable / Owner ──────────────────────────────────────────────────────

/// Anything with a deterministic teardown contract.
///
/// Handles are `Rc`-backed and cheaply cloneable, so disposal takes `&self`
/// and affects every clone of the handle.
pub trait Disposable {
    /// Tear the object down. Idempotent.
    fn dispose(&self);

    /// Whether `dispose()` has already run.
    fn is_disposed(&self) -> bool;
}

/// Anything that can hold cleanup actions on behalf of owned objects.
///
/// "No owner" is expressed as `None` at construction sites: the caller is
/// then responsible for manual disposal.
pub trait Owner {
    /// Register an owned disposable; it is disposed when the owner is.
    fn autodispose_boxed(&self, obj: Box<dyn Disposable>);

    /// Register an arbitrary cleanup action. The returned handle
    /// deregisters that single action if disposed early.
    fn on_dispose_boxed(&self, action: Box<dyn FnOnce()>) -> DisposeHandle;
}

/// Fluent helpers over [`Owner`].
pub trait OwnerExt: Owner {
    /// Take ownership of `obj`, returning it unchanged for chaining.
    fn autodispose<D: Disposable + Clone + 'static>(&self, obj: D) -> D {
        self.autodispose_boxed(Box::new(obj.clone()));
        obj
    }

    /// Register a cleanup closure; see [`Owner::on_dispose_boxed`].
    fn on_dispose(&self, action: impl FnOnce() + 'static) -> DisposeHandle {
        self.on_dispose_boxed(Box::new(action))
    }
}

impl<T: Owner + ?Sized> OwnerExt for T {}

// ─── DisposeBin ──────────────────────────────────────────────────────────────

enum Cleanup {
    Owned(Box<dyn Disposable>),
    Action(Box<dyn FnOnce()>),
}

struct BinState {
    actions: Vec<(u64, Cleanup)>,
    next_id: u64,
}

/// The concrete ordered cleanup list backing the ownership tree.
///
/// Composite objects hold a `DisposeBin` and register their resources with
/// it as they are built; see [`try_create`] for exception-safe assembly.
#[derive(Clone)]
pub struct DisposeBin {
    state: Rc<RefCell<Option<BinState>>>,
}

impl Default for DisposeBin {
    fn default() -> Self {
        Self::new()
    }
}

impl DisposeBin {
    /// Create an empty bin.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(Some(BinState {
                actions: Vec::new(),
                next_id: 1,
            }))),
        }
    }

    /// Number of pending cleanup actions. Zero after disposal.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.borrow().as_ref().map_or(0, |s| s.actions.len())
    }

    /// Whether the bin holds no pending cleanup actions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn register(&self, cleanup: Cleanup) -> u64 {
        let mut state = self.state.borrow_mut();
        let state = state
            .as_mut()
            .expect("DisposeBin used after dispose: cannot register cleanup actions");
        let id = state.next_id;
        state.next_id += 1;
        state.actions.push((id, cleanup));
        id
    }

    /// Run all cleanup actions in reverse order, collecting panic payloads.
    fn run_cleanups(&self) -> (usize, Vec<Box<dyn Any + Send>>) {
        let Some(mut state) = self.state.borrow_mut().take() else {
            return (0, Vec::new());
        };
        let mut total = 0;
        let mut failures = Vec::new();
        while let Some((_, cleanup)) = state.actions.pop() {
            total += 1;
            let outcome = catch_unwind(AssertUnwindSafe(|| match cleanup {
                Cleanup::Owned(obj) => obj.dispose(),
                Cleanup::Action(f) => f(),
            }));
            if let Err(payload) = outcome {
                error!(
                    panic = payload_message(payload.as_ref()),
                    "cleanup action panicked during dispose"
                );
                failures.push(payload);
            }
        }
        (total, failures)
    }

    /// Dispose, returning the aggregate outcome instead of re-raising.
    ///
    /// Every action still runs; failures are logged either way.
    pub fn try_dispose(&self) -> Result<(), ReactiveError> {
        let (total, failures) = self.run_cleanups();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ReactiveError::Disposal {
                failed: failures.len(),
                total,
            })
        }
    }
}

impl Owner for DisposeBin {
    fn autodispose_boxed(&self, obj: Box<dyn Disposable>) {
        self.register(Cleanup::Owned(obj));
    }

    fn on_dispose_boxed(&self, action: Box<dyn FnOnce()>) -> DisposeHandle {
        let id = self.register(Cleanup::Action(action));
        DisposeHandle {
            bin: Rc::downgrade(&self.state),
            id,
        }
    }
}

impl Disposable for DisposeBin {
    fn dispose(&self) {
        let (_, mut failures) = self.run_cleanups();
        if !failures.is_empty() {
            // Siblings have all run; surface the original error.
            resume_unwind(failures.swap_remove(0));
        }
    }

    fn is_disposed(&self) -> bool {
        self.state.borrow().is_none()
    }
}

impl std::fmt::Debug for DisposeBin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisposeBin")
            .field("disposed", &self.is_disposed())
            .field("pending", &self.len())
            .finish()
    }
}

/// Handle to a single registered cleanup action.
///
/// Disposing the handle deregisters that one action without running it.
pub struct DisposeHandle {
    bin: Weak<RefCell<Option<BinState>>>,
    id: u64,
}

impl Disposable for DisposeHandle {
    fn dispose(&self) {
        let Some(bin) = self.bin.upgrade() else {
            return;
        };
        if let Some(state) = bin.borrow_mut().as_mut()
            && let Some(pos) = state.actions.iter().position(|(id, _)| *id == self.id)
        {
            state.actions.remove(pos);
        }
    }

    fn is_disposed(&self) -> bool {
        let Some(bin) = self.bin.upgrade() else {
            return true;
        };
        let state = bin.borrow();
        match state.as_ref() {
            Some(state) => !state.actions.iter().any(|(id, _)| *id == self.id),
            None => true,
        }
    }
}

// ─── Holder ──────────────────────────────────────────────────────────────────

struct HolderState {
    held: Option<Box<dyn Disposable>>,
}

/// Owns at most one disposable at a time.
///
/// Setting a new value disposes the previous one first; [`release`]
/// detaches the held object without disposing it.
///
/// [`release`]: Holder::release
#[derive(Clone)]
pub struct Holder {
    state: Rc<RefCell<Option<HolderState>>>,
}

impl Default for Holder {
    fn default() -> Self {
        Self::new()
    }
}

impl Holder {
    /// Create an empty holder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(Some(HolderState { held: None }))),
        }
    }

    /// Hold `obj`, disposing the previously-held object (if any) first.
    /// Returns `obj` unchanged for chaining.
    pub fn hold<D: Disposable + Clone + 'static>(&self, obj: D) -> D {
        self.hold_boxed(Box::new(obj.clone()));
        obj
    }

    /// Boxed form of [`hold`](Holder::hold).
    pub fn hold_boxed(&self, obj: Box<dyn Disposable>) {
        let previous = {
            let mut state = self.state.borrow_mut();
            let state = state.as_mut().expect("Holder used after dispose");
            state.held.replace(obj)
        };
        if let Some(previous) = previous {
            previous.dispose();
        }
    }

    /// Detach and return the held object without disposing it.
    pub fn release(&self) -> Option<Box<dyn Disposable>> {
        let mut state = self.state.borrow_mut();
        state.as_mut().and_then(|s| s.held.take())
    }

    /// Dispose and drop the held object, leaving the holder empty but usable.
    pub fn clear(&self) {
        if let Some(held) = self.release() {
            held.dispose();
        }
    }

    /// Whether an object is currently held.
    #[must_use]
    pub fn is_holding(&self) -> bool {
        self.state
            .borrow()
            .as_ref()
            .is_some_and(|s| s.held.is_some())
    }
}

impl Disposable for Holder {
    fn dispose(&self) {
        let state = self.state.borrow_mut().take();
        if let Some(state) = state
            && let Some(held) = state.held
        {
            held.dispose();
        }
    }

    fn is_disposed(&self) -> bool {
        self.state.borrow().is_none()
    }
}

// ─── Exception-safe construction ─────────────────────────────────────────────

/// Construct a composite object with full cleanup on failure.
///
/// `init` receives a fresh [`DisposeBin`] and registers resources with it as
/// it builds the object (typically keeping a clone of the bin inside the
/// result). If `init` returns `Err` or panics, everything registered so far
/// is disposed, in reverse order, before the error propagates. On success,
/// the bin is registered with `owner` (when given) before control returns.
pub fn try_create<T, E>(
    owner: Option<&dyn Owner>,
    init: impl FnOnce(&DisposeBin) -> Result<T, E>,
) -> Result<T, E> {
    struct Guard(Option<DisposeBin>);
    impl Drop for Guard {
        fn drop(&mut self) {
            if let Some(bin) = self.0.take() {
                bin.dispose();
            }
        }
    }

    let bin = DisposeBin::new();
    let mut guard = Guard(Some(bin.clone()));
    let value = init(&bin)?;
    guard.0.take();
    if let Some(owner) = owner {
        owner.autodispose_boxed(Box::new(bin));
    }
    Ok(value)
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn payload_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
