//! Declarative derived observables on an entity (C6, "Rollups").
//!
//! A rollup recomputes whenever something it depends on changes and
//! notifies its own subscribers only if the recomputed value differs by
//! structural equality — it is built directly on top of [`Signal`], which
//! already has exactly that semantics (P7). What a rollup adds is *how* it
//! gets told to recompute: the owning entity wires `edge.each(...)` and
//! `signal.watch(...)` callbacks (on whichever fields/edges the rollup
//! reads) to call [`Rollup::refresh`]. That wiring is owned by the entity's
//! own internal scope (see `graph::entities`), not by whatever scope a
//! consumer happens to be subscribing from.
//!
//! Three shapes are used throughout `graph::entities`, matching §3:
//!
//! - *reference*: `Rollup<Option<Rc<RefCell<U>>>>` — first edge target
//!   matching a predicate (e.g. `Session.first_stopped_thread`).
//! - *collection*: not wrapped here at all — collections are just a
//!   filtered `Edge::iter_filtered`/`each` call made fresh by the caller,
//!   since re-exposing a `Vec` as a single equality-compared `Signal` would
//!   defeat granular change tracking for no benefit (§3, "lazy filtered
//!   view").
//! - *property*: `Rollup<usize>` or `Rollup<bool>` — an aggregate such as
//!   `count`/`exists`.

use crate::graph::signal::Signal;
use crate::scope::Subscription;

pub struct Rollup<V: PartialEq + Clone + 'static> {
    signal: Signal<V>,
    recompute: Box<dyn Fn() -> V>,
}

impl<V: PartialEq + Clone + 'static> Rollup<V> {
    pub fn new(recompute: impl Fn() -> V + 'static) -> Self {
        let initial = recompute();
        Self { signal: Signal::new(initial), recompute: Box::new(recompute) }
    }

    /// Recomputes and, if the value changed, notifies subscribers. Called
    /// by the owning entity's internal wiring whenever a dependency fires.
    pub fn refresh(&self) {
        self.signal.set((self.recompute)());
    }

    pub fn get(&self) -> V {
        self.signal.get()
    }

    pub fn watch(&self, f: impl FnMut(&V) + 'static) -> Subscription {
        self.signal.watch(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::{Current, Scope};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn refresh_only_notifies_on_change() {
        let source = Rc::new(RefCell::new(1));
        let rollup = {
            let source = source.clone();
            Rollup::new(move || *source.borrow() > 1)
        };
        let root = Scope::root();
        let seen = Rc::new(RefCell::new(Vec::new()));
        Current::with_scope(&root, || {
            let seen = seen.clone();
            rollup.watch(move |v| seen.borrow_mut().push(*v));
        });
        assert_eq!(*seen.borrow(), vec![false]);

        *source.borrow_mut() = 2;
        rollup.refresh();
        *source.borrow_mut() = 3;
        rollup.refresh(); // still > 1, no new notification
        assert_eq!(*seen.borrow(), vec![false, true]);
    }
}
