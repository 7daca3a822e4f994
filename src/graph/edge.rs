//! Typed, ordered, indexed multi-relations between entities (C6, "Edges").
//!
//! An `Edge<T>` holds the live, ordered set of `T` linked under some named
//! relation on an owning entity (e.g. `Session.threads`). Ordering is
//! declared per use; secondary indexes (e.g. "thread by adapter id") are
//! kept by the owning entity alongside the edge rather than by a generic
//! indexing engine, matching the design notes' "statically typed entities,
//! dynamic lookup only at the query layer" approach.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::scope::{Current, Scope, Subscription};

/// How an edge's elements are ordered for iteration.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Order {
    /// Oldest-linked first (the default).
    Insertion,
    /// Newest-linked first — used for `Thread.stacks` (§3, "ordered
    /// newest-first by sequence").
    Reversed,
}

type EachCallback<T> = Box<dyn FnMut(&Rc<RefCell<T>>) -> Box<dyn FnOnce()>>;

struct EachSubscriber<T> {
    callback: EachCallback<T>,
    cleanups: HashMap<usize, Box<dyn FnOnce()>>,
}

struct EdgeInner<T> {
    items: Vec<Rc<RefCell<T>>>,
    order: Order,
    each_subscribers: HashMap<u64, EachSubscriber<T>>,
    next_id: u64,
}

pub struct Edge<T> {
    inner: Rc<RefCell<EdgeInner<T>>>,
}

impl<T> Clone for Edge<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

fn ptr_key<T>(item: &Rc<RefCell<T>>) -> usize {
    Rc::as_ptr(item) as usize
}

impl<T: 'static> Edge<T> {
    pub fn new(order: Order) -> Self {
        Self {
            inner: Rc::new(RefCell::new(EdgeInner {
                items: Vec::new(),
                order,
                each_subscribers: HashMap::new(),
                next_id: 0,
            })),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Links `target`; a no-op if already linked (identity by `Rc`
    /// pointer), per the idempotence law in §8.
    pub fn link(&self, target: Rc<RefCell<T>>) {
        let already = self.inner.borrow().items.iter().any(|i| Rc::ptr_eq(i, &target));
        if already {
            return;
        }
        {
            let mut inner = self.inner.borrow_mut();
            match inner.order {
                Order::Insertion => inner.items.push(target.clone()),
                Order::Reversed => inner.items.insert(0, target.clone()),
            }
        }
        let ids: Vec<u64> = self.inner.borrow().each_subscribers.keys().copied().collect();
        for id in ids {
            let cleanup = {
                let mut inner = self.inner.borrow_mut();
                inner.each_subscribers.get_mut(&id).map(|sub| (sub.callback)(&target))
            };
            if let Some(cleanup) = cleanup {
                self.inner
                    .borrow_mut()
                    .each_subscribers
                    .get_mut(&id)
                    .map(|sub| sub.cleanups.insert(ptr_key(&target), cleanup));
            }
        }
    }

    /// Unlinks `target` (identity by `Rc` pointer); a no-op if not linked.
    /// Runs the per-element removal cleanup registered by every `each`
    /// subscriber for this element (§4.6 `each`).
    pub fn unlink(&self, target: &Rc<RefCell<T>>) {
        let removed = {
            let mut inner = self.inner.borrow_mut();
            if let Some(pos) = inner.items.iter().position(|i| Rc::ptr_eq(i, target)) {
                inner.items.remove(pos);
                true
            } else {
                false
            }
        };
        if !removed {
            return;
        }
        let key = ptr_key(target);
        let ids: Vec<u64> = self.inner.borrow().each_subscribers.keys().copied().collect();
        for id in ids {
            let cleanup = self
                .inner
                .borrow_mut()
                .each_subscribers
                .get_mut(&id)
                .and_then(|sub| sub.cleanups.remove(&key));
            if let Some(cleanup) = cleanup {
                cleanup();
            }
        }
    }

    /// Unlinks every currently-linked element, running removal cleanups for
    /// each (used when an owning entity is deleted, I8).
    pub fn unlink_all(&self) {
        for item in self.snapshot() {
            self.unlink(&item);
        }
    }

    /// Snapshots the current ordered set (§5, "iteration snapshots the
    /// current ordered set").
    pub fn snapshot(&self) -> Vec<Rc<RefCell<T>>> {
        self.inner.borrow().items.clone()
    }

    pub fn iter_filtered(&self, mut pred: impl FnMut(&T) -> bool) -> Vec<Rc<RefCell<T>>> {
        self.inner.borrow().items.iter().filter(|i| pred(&i.borrow())).cloned().collect()
    }

    pub fn first_filtered(&self, mut pred: impl FnMut(&T) -> bool) -> Option<Rc<RefCell<T>>> {
        self.inner.borrow().items.iter().find(|i| pred(&i.borrow())).cloned()
    }

    pub fn count_filtered(&self, pred: impl FnMut(&T) -> bool) -> usize {
        self.iter_filtered(pred).len()
    }

    /// Calls `on_add` for every currently-linked element and every
    /// subsequently-linked one; the returned closure from `on_add` runs
    /// when that specific element is unlinked or the scope is cancelled
    /// (§4.6 `each`).
    pub fn each(&self, mut on_add: impl FnMut(&Rc<RefCell<T>>) -> Box<dyn FnOnce()> + 'static) -> Subscription {
        let id = {
            let mut inner = self.inner.borrow_mut();
            let id = inner.next_id;
            inner.next_id += 1;
            id
        };
        let existing = self.snapshot();
        let mut cleanups = HashMap::new();
        for item in &existing {
            cleanups.insert(ptr_key(item), on_add(item));
        }
        self.inner.borrow_mut().each_subscribers.insert(id, EachSubscriber { callback: Box::new(on_add), cleanups });

        let weak = Rc::downgrade(&self.inner);
        let owner = Current::get().unwrap_or_else(Scope::root);
        owner.on_cleanup(move || {
            if let Some(inner) = weak.upgrade() {
                if let Some(sub) = inner.borrow_mut().each_subscribers.remove(&id) {
                    for (_, cleanup) in sub.cleanups {
                        cleanup();
                    }
                }
            }
        })
    }
}

impl<T: 'static> Default for Edge<T> {
    fn default() -> Self {
        Self::new(Order::Insertion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_is_idempotent() {
        let e: Edge<i32> = Edge::new(Order::Insertion);
        let item = Rc::new(RefCell::new(1));
        e.link(item.clone());
        e.link(item.clone());
        assert_eq!(e.len(), 1);
    }

    #[test]
    fn reversed_order_is_newest_first() {
        let e: Edge<i32> = Edge::new(Order::Reversed);
        e.link(Rc::new(RefCell::new(1)));
        e.link(Rc::new(RefCell::new(2)));
        e.link(Rc::new(RefCell::new(3)));
        let got: Vec<i32> = e.snapshot().iter().map(|r| *r.borrow()).collect();
        assert_eq!(got, vec![3, 2, 1]);
    }

    #[test]
    fn each_fires_for_existing_and_new_and_on_unlink() {
        let root = Scope::root();
        let e: Edge<i32> = Edge::new(Order::Insertion);
        let a = Rc::new(RefCell::new(1));
        e.link(a.clone());

        let log = Rc::new(RefCell::new(Vec::new()));
        Current::with_scope(&root, || {
            let log = log.clone();
            e.each(move |item| {
                let v = *item.borrow();
                log.borrow_mut().push(format!("add:{v}"));
                let log2 = log.clone();
                Box::new(move || log2.borrow_mut().push(format!("remove:{v}")))
            });
        });
        assert_eq!(*log.borrow(), vec!["add:1"]);

        let b = Rc::new(RefCell::new(2));
        e.link(b.clone());
        assert_eq!(*log.borrow(), vec!["add:1", "add:2"]);

        e.unlink(&a);
        assert_eq!(*log.borrow(), vec!["add:1", "add:2", "remove:1"]);

        root.cancel();
        assert_eq!(*log.borrow(), vec!["add:1", "add:2", "remove:1", "remove:2"]);
    }
}
