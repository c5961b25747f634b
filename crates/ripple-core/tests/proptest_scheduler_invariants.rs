//! Property-based invariant tests for the recomputation scheduler over
//! randomly generated update sequences.
//!
//! These tests verify structural invariants that must hold for any valid inputs:
//!
//! 1. Derived values are always consistent with their inputs after a wave.
//! 2. Each node in a diamond evaluates at most once per distinct write.
//! 3. Bundled writes cost at most one evaluation per node.
//! 4. A dependency chain evaluates in topological order, every wave.
//! 5. Priorities are strictly increasing along a chain.
//! 6. Writing the current value again evaluates nothing.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use proptest::prelude::*;
use ripple_core::{Computed, Observable, Scheduler};

// ── Helpers ─────────────────────────────────────────────────────────────

struct Spy {
    count: Rc<Cell<u32>>,
}

impl Spy {
    fn new() -> Self {
        Self {
            count: Rc::new(Cell::new(0)),
        }
    }

    fn bump(&self) -> impl Fn() + 'static {
        let count = Rc::clone(&self.count);
        move || count.set(count.get() + 1)
    }

    fn get(&self) -> u32 {
        self.count.get()
    }
}

/// x → (a, b) → c: the classic diamond.
struct Diamond {
    x: Observable<i64>,
    c: Computed<i64>,
    a_evals: Spy,
    b_evals: Spy,
    c_evals: Spy,
}

fn diamond(initial: i64) -> Diamond {
    let sched = Scheduler::new();
    let x = Observable::new(&sched, initial);
    let (a_evals, b_evals, c_evals) = (Spy::new(), Spy::new(), Spy::new());

    let (x_in, bump) = (x.clone(), a_evals.bump());
    let a = Computed::new(&sched, None, move |cx| {
        bump();
        cx.read(&x_in) * 2
    });
    let (x_in, bump) = (x.clone(), b_evals.bump());
    let b = Computed::new(&sched, None, move |cx| {
        bump();
        cx.read(&x_in) + 3
    });
    let (a_in, b_in, bump) = (a.clone(), b.clone(), c_evals.bump());
    let c = Computed::new(&sched, None, move |cx| {
        bump();
        cx.read(&a_in) + cx.read(&b_in)
    });

    Diamond {
        x,
        c,
        a_evals,
        b_evals,
        c_evals,
    }
}

fn expected(x: i64) -> i64 {
    (x * 2) + (x + 3)
}

// ═════════════════════════════════════════════════════════════════════════
// 1. Derived values are always consistent with their inputs after a wave
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn derived_values_track_inputs(
        initial in -1000i64..1000,
        writes in proptest::collection::vec(-1000i64..1000, 1..32),
    ) {
        let d = diamond(initial);
        prop_assert_eq!(d.c.get(), expected(initial));
        for w in writes {
            d.x.set(w);
            prop_assert_eq!(d.c.get(), expected(w));
        }
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 2. Each node in a diamond evaluates at most once per distinct write
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn at_most_one_evaluation_per_write(
        initial in -1000i64..1000,
        writes in proptest::collection::vec(-1000i64..1000, 1..32),
    ) {
        let d = diamond(initial);
        for w in writes {
            let before = (d.a_evals.get(), d.b_evals.get(), d.c_evals.get());
            d.x.set(w);
            let after = (d.a_evals.get(), d.b_evals.get(), d.c_evals.get());
            prop_assert!(after.0 - before.0 <= 1);
            prop_assert!(after.1 - before.1 <= 1);
            // `c` has two incoming edges but still evaluates at most once.
            prop_assert!(after.2 - before.2 <= 1);
        }
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 3. Bundled writes cost at most one evaluation per node
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn bundles_coalesce_to_one_wave(
        initial in -1000i64..1000,
        writes in proptest::collection::vec(-1000i64..1000, 2..16),
    ) {
        let sched = Scheduler::new();
        let d = {
            // Rebuild the diamond on a scheduler we keep a handle to.
            let x = Observable::new(&sched, initial);
            let spy = Spy::new();
            let (x_in, bump) = (x.clone(), spy.bump());
            let a = Computed::new(&sched, None, move |cx| { bump(); cx.read(&x_in) * 2 });
            let x_in = x.clone();
            let b = Computed::new(&sched, None, move |cx| cx.read(&x_in) + 3);
            let (a_in, b_in) = (a.clone(), b.clone());
            let c = Computed::new(&sched, None, move |cx| cx.read(&a_in) + cx.read(&b_in));
            (x, c, spy)
        };
        let (x, c, a_evals) = d;

        let last = *writes.last().unwrap();
        let before = a_evals.get();
        sched.bundle_changes(|| {
            for &w in &writes {
                x.set(w);
            }
            // Nothing recomputes until the bundle closes.
            prop_assert_eq!(a_evals.get(), before);
            Ok(())
        })?;
        prop_assert!(a_evals.get() - before <= 1);
        prop_assert_eq!(c.get(), expected(last));
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 4. A dependency chain evaluates in topological order, every wave
// 5. Priorities are strictly increasing along a chain
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn chains_evaluate_in_topological_order(
        depth in 1usize..8,
        writes in proptest::collection::vec(-1000i64..1000, 1..16),
    ) {
        let sched = Scheduler::new();
        let x = Observable::new(&sched, 0i64);
        let order: Rc<RefCell<Vec<usize>>> = Rc::new(RefCell::new(Vec::new()));

        let mut chain: Vec<Computed<i64>> = Vec::with_capacity(depth);
        for i in 0..depth {
            let order_in = Rc::clone(&order);
            let c = match chain.last() {
                None => {
                    let x_in = x.clone();
                    Computed::new(&sched, None, move |cx| {
                        order_in.borrow_mut().push(i);
                        cx.read(&x_in) + 1
                    })
                }
                Some(prev) => {
                    let prev_in = prev.clone();
                    Computed::new(&sched, None, move |cx| {
                        order_in.borrow_mut().push(i);
                        cx.read(&prev_in) + 1
                    })
                }
            };
            chain.push(c);
        }

        // Priority is 1 + max(dep priorities): strictly increasing here.
        for (i, c) in chain.iter().enumerate() {
            prop_assert_eq!(c.as_dep().priority(), u32::try_from(i).unwrap() + 1);
        }

        for w in writes {
            if w == x.get() {
                continue;
            }
            order.borrow_mut().clear();
            x.set(w);
            let ran = order.borrow().clone();
            let sorted: Vec<usize> = (0..depth).collect();
            prop_assert_eq!(ran, sorted);
            prop_assert_eq!(chain[depth - 1].get(), w + i64::try_from(depth).unwrap());
        }
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 6. Writing the current value again evaluates nothing
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn identical_writes_are_free(value in -1000i64..1000, repeats in 1usize..8) {
        let d = diamond(value);
        let before = (d.a_evals.get(), d.b_evals.get(), d.c_evals.get());
        for _ in 0..repeats {
            d.x.set(value);
        }
        let after = (d.a_evals.get(), d.b_evals.get(), d.c_evals.get());
        prop_assert_eq!(before, after);
    }
}
