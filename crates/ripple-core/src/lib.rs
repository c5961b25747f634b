#![forbid(unsafe_code)]

//! Core reactive engine: observables, dependency-tracked computeds, the
//! priority scheduler, and the ownership/disposal model.
//!
//! Reads record dependencies explicitly through [`UseCx::read`]; there is
//! no ambient tracking. Writes notify direct listeners synchronously and
//! recompute dependent values through the [`Scheduler`] in topological
//! order, at most once per update wave.

pub mod computed;
pub mod dispose;
pub mod emit;
pub mod error;
pub mod interop;
pub mod obs_array;
pub mod observable;
pub mod scheduler;
pub mod subscribe;

pub use computed::{Computed, PureComputed};
pub use dispose::{DisposeBin, DisposeHandle, Disposable, Holder, Owner, OwnerExt, try_create};
pub use emit::{Emitter, Listener};
pub use error::{ReactiveError, Result};
pub use interop::{ForeignObservable, ForeignSource, expose_foreign, wrap_foreign};
pub use obs_array::{ArrayChange, ObsArray, Splice, computed_array};
pub use observable::{Change, Observable};
pub use scheduler::Scheduler;
pub use subscribe::{DepSource, ReactiveValue, Subscription, UseCx, subscribe, subscribe_to};
