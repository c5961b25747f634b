#![forbid(unsafe_code)]

//! Ripple public facade crate.
//!
//! This crate provides the stable, ergonomic surface area for users.

pub use ripple_core::{
    ArrayChange, Change, Computed, DepSource, Disposable, DisposeBin, DisposeHandle, Emitter,
    ForeignObservable, ForeignSource, Holder, Listener, ObsArray, Observable, Owner, OwnerExt,
    PureComputed, ReactiveError, ReactiveValue, Result, Scheduler, Splice, Subscription, UseCx,
    computed_array, expose_foreign, subscribe, subscribe_to, try_create, wrap_foreign,
};

pub mod prelude {
    pub use ripple_core as core;

    pub use ripple_core::{
        Computed, Disposable, DisposeBin, ObsArray, Observable, Owner, OwnerExt, PureComputed,
        Scheduler, UseCx, computed_array, subscribe, subscribe_to,
    };
}
