//! Cooperative task runtime (C4).
//!
//! The whole crate runs on a single OS thread: a `tokio::task::LocalSet`
//! drives every task, so entities in the graph (C6) can use `Rc<RefCell<_>>`
//! instead of `Arc<Mutex<_>>` — there is no preemption, and two methods on
//! the same entity that both touch the adapter serialise naturally because
//! they share the one scheduler (§5). `spawn_local` (rather than `tokio::
//! spawn`) is what makes that legal: tasks do not need to be `Send`.
//!
//! Grounded on the teacher's own async usage (`perl-dap` is a `tokio`
//! application throughout); the primitives below (`memoize`, one-shot
//! `Event`, FIFO `Mutex`, `timeout`) are new surface the teacher doesn't
//! need (it never coalesces concurrent identical adapter calls), built from
//! `tokio::sync` building blocks the same way the teacher builds
//! `tcp_attach`'s timeout handling from `tokio::time`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::rc::Rc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{DapError, DapResult};

/// A cancellation token together with the tasks it should cancel when
/// dropped/cancelled. Children inherit the parent's cancellation (§4.4).
#[derive(Clone)]
pub struct TaskScope {
    token: CancellationToken,
}

impl TaskScope {
    pub fn root() -> Self {
        Self { token: CancellationToken::new() }
    }

    pub fn child(&self) -> Self {
        Self { token: self.token.child_token() }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

/// A cancellable handle to a spawned task, `await`-able for its result.
pub struct TaskHandle<T> {
    scope: TaskScope,
    inner: tokio::task::JoinHandle<T>,
}

impl<T: 'static> TaskHandle<T> {
    pub fn cancel(&self) {
        self.scope.cancel();
        self.inner.abort();
    }

    /// Awaits the task's result. Resolves to `Err(DapError::Cancelled)` if
    /// the task was cancelled before completing.
    pub async fn join(self) -> DapResult<T> {
        match self.inner.await {
            Ok(v) => Ok(v),
            Err(e) if e.is_cancelled() => Err(DapError::Cancelled),
            Err(e) => Err(DapError::Protocol(format!("task panicked: {e}"))),
        }
    }
}

/// Spawns `fut` as a child of `parent` (or a fresh root scope if `parent`
/// is `None`). The returned task observes cancellation of its own scope or
/// any ancestor scope.
pub fn spawn<F, T>(fut: F, parent: Option<&TaskScope>) -> TaskHandle<T>
where
    F: Future<Output = T> + 'static,
    T: 'static,
{
    let scope = parent.map(TaskScope::child).unwrap_or_else(TaskScope::root);
    let inner = tokio::task::spawn_local(fut);
    TaskHandle { scope, inner }
}

/// Converts a callback-style API into an awaitable one (§4.4
/// `await_callback`). `register` is called once with a completion closure;
/// the returned future resolves when that closure is invoked.
pub async fn await_callback<T, F>(register: F) -> T
where
    T: 'static,
    F: FnOnce(Box<dyn FnOnce(T)>),
{
    let (tx, rx) = tokio::sync::oneshot::channel();
    register(Box::new(move |v| {
        let _ = tx.send(v);
    }));
    rx.await.expect("completion closure dropped without calling back")
}

/// Awaits every task, in order; the first error cancels the remaining
/// siblings and is returned (§4.4 `await_all`).
pub async fn await_all<T: 'static>(tasks: Vec<TaskHandle<T>>) -> DapResult<Vec<T>> {
    let mut out = Vec::with_capacity(tasks.len());
    let mut failed = false;
    let mut first_err = None;
    for task in tasks {
        if failed {
            task.cancel();
            continue;
        }
        match task.join().await {
            Ok(v) => out.push(v),
            Err(e) => {
                failed = true;
                first_err = Some(e);
            }
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(out),
    }
}

/// Races `fut` against a `ms`-millisecond timer (§4.4 `timeout`).
pub async fn timeout<F, T>(ms: u64, fut: F) -> DapResult<T>
where
    F: Future<Output = T>,
{
    match tokio::time::timeout(Duration::from_millis(ms), fut).await {
        Ok(v) => Ok(v),
        Err(_) => Err(DapError::Cancelled),
    }
}

/// A one-shot event: `wait()` resolves exactly once, whenever `set` is
/// first called (§4.4 `event`).
#[derive(Clone)]
pub struct Event<T: Clone> {
    rx: watch::Receiver<Option<T>>,
    tx: Rc<watch::Sender<Option<T>>>,
}

impl<T: Clone + 'static> Event<T> {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(None);
        Self { rx, tx: Rc::new(tx) }
    }

    /// Sets the event's value. Subsequent calls are no-ops.
    pub fn set(&self, value: T) {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                false
            } else {
                *slot = Some(value);
                true
            }
        });
    }

    pub async fn wait(&self) -> T {
        let mut rx = self.rx.clone();
        loop {
            if let Some(v) = rx.borrow().clone() {
                return v;
            }
            if rx.changed().await.is_err() {
                // Sender dropped without ever setting a value: wait forever
                // rather than fabricate a value, matching "never resolves
                // until set()".
                std::future::pending::<()>().await;
            }
        }
    }
}

impl<T: Clone + 'static> Default for Event<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A FIFO-fair mutex over a *logical* resource (not memory) — used to
/// serialise adapter calls the adapter itself cannot correlate when issued
/// concurrently (§4.4 `mutex`; used by the breakpoint synchroniser, C10).
pub struct Mutex {
    inner: std::sync::Arc<tokio::sync::Mutex<()>>,
}

impl Clone for Mutex {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl Mutex {
    pub fn new() -> Self {
        Self { inner: std::sync::Arc::new(tokio::sync::Mutex::new(())) }
    }

    /// Acquires the lock; cancelling the returned future while still
    /// waiting removes it from the wait queue without acquiring (this is
    /// `tokio::sync::Mutex`'s native behaviour: a dropped `lock()` future
    /// never touches the queue slot it reserved).
    pub async fn lock(&self) -> MutexGuard {
        let permit = self.inner.clone().lock_owned().await;
        MutexGuard { _permit: permit }
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MutexGuard {
    _permit: tokio::sync::OwnedMutexGuard<()>,
}

/// Coalesces concurrent invocations of the same underlying async operation
/// keyed by `K` into a single call; all callers observe the same result,
/// and the cache entry is discarded once the call resolves (§4.4 `memoize`,
/// O4). Grounded on the spec's requirement that heavy entity fetches
/// (stack trace, variables) issue exactly one adapter request per coalesced
/// cohort.
pub struct Memoizer<K, V> {
    inflight: RefCell<HashMap<K, watch::Receiver<Option<Result<V, String>>>>>,
}

impl<K, V> Default for Memoizer<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self { inflight: RefCell::new(HashMap::new()) }
    }
}

impl<K, V> Memoizer<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `make` for `key` unless a call for the same key is already in
    /// flight, in which case this caller awaits that call's result instead.
    pub async fn call<F>(&self, key: K, make: F) -> DapResult<V>
    where
        F: Future<Output = DapResult<V>>,
    {
        if let Some(existing) = self.inflight.borrow().get(&key).cloned() {
            return Self::await_slot(existing).await;
        }

        let (tx, rx) = watch::channel(None);
        self.inflight.borrow_mut().insert(key.clone(), rx.clone());
        let result = make.await;
        let _ = tx.send(Some(result.clone().map_err(|e| e.to_string())));
        self.inflight.borrow_mut().remove(&key);
        result
    }

    async fn await_slot(mut rx: watch::Receiver<Option<Result<V, String>>>) -> DapResult<V> {
        loop {
            if let Some(r) = rx.borrow().clone() {
                return r.map_err(DapError::Protocol);
            }
            if rx.changed().await.is_err() {
                return Err(DapError::Cancelled);
            }
        }
    }
}
