//! Subscription-cleanup scope hierarchy (C5).
//!
//! Every subscription returned by the graph (on a signal, edge, or rollup,
//! see `graph::signal`) registers itself with whatever scope is "current"
//! at the time it's created. Scopes form a tree; cancelling a scope runs
//! every registered cleanup and cancels every child scope, LIFO with
//! respect to registration order (§4.5).
//!
//! This is a distinct concept from [`crate::task::TaskScope`] (C4), which
//! governs *task* cancellation rather than *subscription* cleanup, even
//! though the two are driven together in practice (the bridge cancels a
//! session's subscription scope and its task scope in the same call).

use std::cell::RefCell;
use std::rc::{Rc, Weak};

type Cleanup = Box<dyn FnOnce()>;

struct ScopeInner {
    parent: Option<Weak<RefCell<ScopeInner>>>,
    children: Vec<Rc<RefCell<ScopeInner>>>,
    cleanups: Vec<Cleanup>,
    cancelled: bool,
}

/// A node in the subscription-cleanup tree.
#[derive(Clone)]
pub struct Scope {
    inner: Rc<RefCell<ScopeInner>>,
}

/// An opaque handle returned when registering a cleanup with a scope.
/// Dropping it does nothing by itself — cleanups run when the owning scope
/// is cancelled, not when the handle is dropped (matching the spec's
/// "scope cancel disposes them", not Rust's usual RAII-on-drop idiom).
pub struct Subscription {
    scope: Weak<RefCell<ScopeInner>>,
    index: usize,
}

impl Scope {
    /// Creates a fresh root scope (owned by the `Debugger`, per §4.5).
    pub fn root() -> Self {
        Self {
            inner: Rc::new(RefCell::new(ScopeInner {
                parent: None,
                children: Vec::new(),
                cleanups: Vec::new(),
                cancelled: false,
            })),
        }
    }

    /// Creates a child of `self` (§4.5 `push`, as a standalone operation
    /// rather than mutating a thread-local "current scope" — callers that
    /// want the push/pop/with_scope ergonomics use [`Current`] below).
    pub fn push(&self) -> Scope {
        let child = Scope {
            inner: Rc::new(RefCell::new(ScopeInner {
                parent: Some(Rc::downgrade(&self.inner)),
                children: Vec::new(),
                cleanups: Vec::new(),
                cancelled: false,
            })),
        };
        self.inner.borrow_mut().children.push(child.inner.clone());
        child
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.borrow().cancelled
    }

    /// Registers `cleanup` to run when this scope is cancelled.
    pub fn on_cleanup(&self, cleanup: impl FnOnce() + 'static) -> Subscription {
        let mut inner = self.inner.borrow_mut();
        if inner.cancelled {
            drop(inner);
            cleanup();
            return Subscription { scope: Weak::new(), index: usize::MAX };
        }
        inner.cleanups.push(Box::new(cleanup));
        Subscription { scope: Rc::downgrade(&self.inner), index: inner.cleanups.len() - 1 }
    }

    /// Cancels this scope: runs its cleanups LIFO, then recursively cancels
    /// every child scope, then detaches from its parent (§4.5 `cancel`).
    /// Idempotent.
    pub fn cancel(&self) {
        let (children, cleanups, already) = {
            let mut inner = self.inner.borrow_mut();
            if inner.cancelled {
                (Vec::new(), Vec::new(), true)
            } else {
                inner.cancelled = true;
                (std::mem::take(&mut inner.children), std::mem::take(&mut inner.cleanups), false)
            }
        };
        if already {
            return;
        }
        for cleanup in cleanups.into_iter().rev() {
            cleanup();
        }
        for child in children {
            Scope { inner: child }.cancel();
        }
        if let Some(parent) = self.inner.borrow().parent.as_ref().and_then(Weak::upgrade) {
            parent.borrow_mut().children.retain(|c| !Rc::ptr_eq(c, &self.inner));
        }
    }
}

impl Subscription {
    /// Unregisters the cleanup without running it (used when a subscriber
    /// detaches itself explicitly rather than waiting for scope
    /// cancellation).
    pub fn unsubscribe(self) {
        if let Some(scope) = self.scope.upgrade() {
            let mut inner = scope.borrow_mut();
            if self.index < inner.cleanups.len() {
                // Replace with a no-op rather than shifting indices, so
                // other live Subscriptions into the same Vec stay valid.
                inner.cleanups[self.index] = Box::new(|| {});
            }
        }
    }
}

/// A thread-local "current scope" stack, giving `push`/`pop`/`with_scope`
/// ergonomics (§4.5) without threading a `Scope` through every call site —
/// subscriptions created while a handler runs attach to whatever scope was
/// current when the handler was dispatched.
pub struct Current;

thread_local! {
    static STACK: RefCell<Vec<Scope>> = const { RefCell::new(Vec::new()) };
}

impl Current {
    pub fn get() -> Option<Scope> {
        STACK.with(|s| s.borrow().last().cloned())
    }

    /// Pushes a child of the current scope (or a fresh root if there is no
    /// current scope) and makes it current.
    pub fn push() -> Scope {
        let child = match Self::get() {
            Some(parent) => parent.push(),
            None => Scope::root(),
        };
        STACK.with(|s| s.borrow_mut().push(child.clone()));
        child
    }

    /// Restores the previous current scope without cancelling the one
    /// being left.
    pub fn pop() {
        STACK.with(|s| {
            s.borrow_mut().pop();
        });
    }

    /// Pushes a child scope, runs `f` with it current, pops — used by the
    /// protocol client when dispatching an event so subscriptions created
    /// inside the handler are parented correctly (§4.5 `with_scope`).
    pub fn with_scope<R>(scope: &Scope, f: impl FnOnce() -> R) -> R {
        STACK.with(|s| s.borrow_mut().push(scope.clone()));
        let result = f();
        Self::pop();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_runs_cleanups_lifo() {
        let root = Scope::root();
        let order = Rc::new(RefCell::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            root.on_cleanup(move || order.borrow_mut().push(i));
        }
        root.cancel();
        assert_eq!(*order.borrow(), vec![2, 1, 0]);
    }

    #[test]
    fn cancel_propagates_to_children() {
        let root = Scope::root();
        let child = root.push();
        let grandchild = child.push();
        let flag = Rc::new(RefCell::new(false));
        let flag2 = flag.clone();
        grandchild.on_cleanup(move || *flag2.borrow_mut() = true);
        root.cancel();
        assert!(*flag.borrow());
        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
    }

    #[test]
    fn cancel_is_idempotent() {
        let root = Scope::root();
        let calls = Rc::new(RefCell::new(0));
        let calls2 = calls.clone();
        root.on_cleanup(move || *calls2.borrow_mut() += 1);
        root.cancel();
        root.cancel();
        assert_eq!(*calls.borrow(), 1);
    }

    #[test]
    fn cancelling_child_detaches_from_parent() {
        let root = Scope::root();
        let child = root.push();
        child.cancel();
        // Parent cancel must not double-run the already-cancelled child's
        // cleanups (it was detached).
        let calls = Rc::new(RefCell::new(0));
        let calls2 = calls.clone();
        child.on_cleanup(move || *calls2.borrow_mut() += 1);
        root.cancel();
        assert_eq!(*calls.borrow(), 1, "cleanup registered post-cancel runs immediately, once");
    }
}
