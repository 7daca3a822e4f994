//! The indexed store (C6 + C7 resolution): a `Debugger` root plus a
//! URI → entity index giving O(1) [`Store::resolve`] (I1, P1).

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use crate::error::{DapError, DapResult};
use crate::graph::entities::*;
use crate::graph::{Edge, Order, Signal};

/// A type-erased handle to any entity, used only by the URI index and the
/// URL query layer (§4.7, §9 "dynamic lookup occurs only at the query
/// layer").
#[derive(Clone)]
#[allow(clippy::large_enum_variant)]
pub enum AnyEntity {
    Session(Ref<Session>),
    Thread(Ref<Thread>),
    Stack(Ref<Stack>),
    Frame(Ref<Frame>),
    VarScope(Ref<VarScope>),
    Variable(Ref<Variable>),
    Source(Ref<Source>),
    SourceBinding(Ref<SourceBinding>),
    Breakpoint(Ref<Breakpoint>),
    BreakpointBinding(Ref<BreakpointBinding>),
    Output(Ref<Output>),
    ExceptionFilter(Ref<ExceptionFilter>),
    Debugger(Weak<Store>),
}

/// Identity comparison (by underlying `Rc` pointer, not by entity content),
/// so a [`crate::query`] result set can back a [`crate::graph::Rollup`]
/// (§4.7 `watch`) without every entity type needing its own `PartialEq`.
impl PartialEq for AnyEntity {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (AnyEntity::Session(a), AnyEntity::Session(b)) => Rc::ptr_eq(a, b),
            (AnyEntity::Thread(a), AnyEntity::Thread(b)) => Rc::ptr_eq(a, b),
            (AnyEntity::Stack(a), AnyEntity::Stack(b)) => Rc::ptr_eq(a, b),
            (AnyEntity::Frame(a), AnyEntity::Frame(b)) => Rc::ptr_eq(a, b),
            (AnyEntity::VarScope(a), AnyEntity::VarScope(b)) => Rc::ptr_eq(a, b),
            (AnyEntity::Variable(a), AnyEntity::Variable(b)) => Rc::ptr_eq(a, b),
            (AnyEntity::Source(a), AnyEntity::Source(b)) => Rc::ptr_eq(a, b),
            (AnyEntity::SourceBinding(a), AnyEntity::SourceBinding(b)) => Rc::ptr_eq(a, b),
            (AnyEntity::Breakpoint(a), AnyEntity::Breakpoint(b)) => Rc::ptr_eq(a, b),
            (AnyEntity::BreakpointBinding(a), AnyEntity::BreakpointBinding(b)) => Rc::ptr_eq(a, b),
            (AnyEntity::Output(a), AnyEntity::Output(b)) => Rc::ptr_eq(a, b),
            (AnyEntity::ExceptionFilter(a), AnyEntity::ExceptionFilter(b)) => Rc::ptr_eq(a, b),
            (AnyEntity::Debugger(a), AnyEntity::Debugger(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

/// The singleton root store (§3 `Debugger`).
pub struct Store {
    pub focused_url: Signal<String>,
    pub sessions: Edge<Session>,
    pub sources: Edge<Source>,

    index: RefCell<HashMap<String, AnyEntity>>,
    deleted: RefCell<std::collections::HashSet<String>>,
    self_ref: RefCell<Weak<Store>>,
}

impl Store {
    pub fn new() -> Rc<Store> {
        let store = Rc::new(Store {
            focused_url: Signal::new(String::from("/")),
            sessions: Edge::new(Order::Insertion),
            sources: Edge::new(Order::Insertion),
            index: RefCell::new(HashMap::new()),
            deleted: RefCell::new(Default::default()),
            self_ref: RefCell::new(Weak::new()),
        });
        *store.self_ref.borrow_mut() = Rc::downgrade(&store);
        store.index.borrow_mut().insert("debugger".to_string(), AnyEntity::Debugger(Rc::downgrade(&store)));
        store
    }

    pub fn register(&self, uri: String, entity: AnyEntity) {
        self.index.borrow_mut().insert(uri, entity);
    }

    pub fn unregister(&self, uri: &str) {
        self.index.borrow_mut().remove(uri);
        self.deleted.borrow_mut().insert(uri.to_string());
    }

    /// Resolves a canonical URI to its entity (I1, P1). Returns
    /// `DapError::DeletedEntity` for a URI that once resolved but whose
    /// entity has since been deleted, and `DapError::Schema` for a URI
    /// that never existed — callers needing to distinguish "never existed"
    /// from "gone" should check `was_deleted` first.
    pub fn resolve(&self, uri: &str) -> DapResult<AnyEntity> {
        if let Some(e) = self.index.borrow().get(uri) {
            return Ok(e.clone());
        }
        if self.deleted.borrow().contains(uri) {
            return Err(DapError::DeletedEntity { uri: uri.to_string() });
        }
        Err(DapError::Schema(format!("no entity with uri {uri}")))
    }

    pub fn was_deleted(&self, uri: &str) -> bool {
        self.deleted.borrow().contains(uri)
    }

    /// The root `AnyEntity::Debugger` handle, for the URL query layer's
    /// root segment resolution.
    pub fn as_any_entity(&self) -> AnyEntity {
        AnyEntity::Debugger(self.self_ref.borrow().clone())
    }

    pub fn session_by_id(&self, id: &str) -> Option<Ref<Session>> {
        self.sessions.snapshot().into_iter().find(|s| s.borrow().id == id)
    }

    /// Deletes an entity: unlinks it from the index (I1), and from every
    /// edge that can be statically reached by the caller — full cascade
    /// cleanup of an entity's own outgoing edges is each entity's own
    /// `delete` (e.g. [`Session::delete`]), called before this (I8).
    pub fn mark_deleted(&self, uri: &str) {
        self.unregister(uri);
    }
}
