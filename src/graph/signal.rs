//! Reactive field cells (C6, "Signals").
//!
//! Every field of every entity is a `Signal<T>`. `get` reads the current
//! value; `set` writes iff the value differs by structural equality,
//! notifying subscribers (P7); `use_with` registers a callback invoked
//! synchronously with the current value and again on every change, with an
//! optional per-invocation cleanup run before the next notification and on
//! scope cancellation.

use std::cell::RefCell;
use std::rc::Rc;

use crate::scope::{Current, Scope, Subscription};

type Cleanup = Box<dyn FnOnce()>;

struct Subscriber<T> {
    callback: Box<dyn FnMut(&T) -> Option<Cleanup>>,
    last_cleanup: Option<Cleanup>,
}

struct SignalInner<T> {
    value: T,
    subscribers: Vec<(u64, Subscriber<T>)>,
    next_id: u64,
}

/// A reactive cell holding a single value of type `T`.
pub struct Signal<T> {
    inner: Rc<RefCell<SignalInner<T>>>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T: PartialEq + Clone + 'static> Signal<T> {
    pub fn new(value: T) -> Self {
        Self { inner: Rc::new(RefCell::new(SignalInner { value, subscribers: Vec::new(), next_id: 0 })) }
    }

    pub fn get(&self) -> T {
        self.inner.borrow().value.clone()
    }

    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.inner.borrow().value)
    }

    /// Writes `v` iff it differs from the current value by structural
    /// equality; notifies subscribers in registration order on change.
    pub fn set(&self, v: T) {
        let changed = {
            let mut inner = self.inner.borrow_mut();
            if inner.value == v {
                false
            } else {
                inner.value = v;
                true
            }
        };
        if changed {
            self.notify();
        }
    }

    fn notify(&self) {
        let ids: Vec<u64> = self.inner.borrow().subscribers.iter().map(|(id, _)| *id).collect();
        for id in ids {
            self.invoke(id);
        }
    }

    fn invoke(&self, id: u64) {
        // Run the previous cleanup and compute the new callback result
        // without holding the RefCell borrow across the callback (a
        // callback may itself read/write other signals).
        let value = self.inner.borrow().value.clone();
        let mut taken: Option<Subscriber<T>> = None;
        {
            let mut inner = self.inner.borrow_mut();
            if let Some(pos) = inner.subscribers.iter().position(|(sid, _)| *sid == id) {
                taken = Some(std::mem::replace(
                    &mut inner.subscribers[pos].1,
                    Subscriber { callback: Box::new(|_| None), last_cleanup: None },
                ));
            }
        }
        let Some(mut sub) = taken else { return };
        if let Some(cleanup) = sub.last_cleanup.take() {
            cleanup();
        }
        sub.last_cleanup = (sub.callback)(&value);
        let mut inner = self.inner.borrow_mut();
        if let Some(pos) = inner.subscribers.iter().position(|(sid, _)| *sid == id) {
            inner.subscribers[pos].1 = sub;
        }
    }

    /// Registers `f` to run now and on every subsequent change, returning a
    /// [`Subscription`] registered with the currently-active scope (§4.5).
    /// `f` may return a cleanup to run before the next invocation and on
    /// scope cancellation.
    pub fn use_with(&self, mut f: impl FnMut(&T) -> Option<Cleanup> + 'static) -> Subscription {
        let id = {
            let mut inner = self.inner.borrow_mut();
            let id = inner.next_id;
            inner.next_id += 1;
            let initial_cleanup = f(&inner.value);
            inner.subscribers.push((id, Subscriber { callback: Box::new(f), last_cleanup: initial_cleanup }));
            id
        };
        let weak = Rc::downgrade(&self.inner);
        let owner = Current::get().unwrap_or_else(Scope::root);
        owner.on_cleanup(move || {
            if let Some(inner) = weak.upgrade() {
                let mut inner = inner.borrow_mut();
                if let Some(pos) = inner.subscribers.iter().position(|(sid, _)| *sid == id) {
                    let (_, mut sub) = inner.subscribers.remove(pos);
                    drop(inner);
                    if let Some(cleanup) = sub.last_cleanup.take() {
                        cleanup();
                    }
                }
            }
        })
    }

    /// Like [`Self::use_with`] but for callbacks that need no cleanup.
    pub fn watch(&self, mut f: impl FnMut(&T) + 'static) -> Subscription {
        self.use_with(move |v| {
            f(v);
            None
        })
    }
}
