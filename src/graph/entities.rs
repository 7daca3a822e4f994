//! Concrete entity types (C6, §3 "Data model").
//!
//! Rather than a fully dynamic, schema-interpreted record (`EntityRecord`
//! sum type), each entity here is a plain Rust struct: fields are
//! [`Signal`]s, relations are [`Edge`]s, and rollups are [`Rollup`]s wired
//! up once at construction time against the entity's own `wiring` scope.
//! This is the design notes' "in a strictly typed language, the schema
//! compiles to generated code" path — the URL query layer (`query.rs`) is
//! where genuinely dynamic, schema-shaped lookups live.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use crate::graph::edge::{Edge, Order};
use crate::graph::rollup::Rollup;
use crate::graph::signal::Signal;
use crate::scope::Scope;

pub type Ref<T> = Rc<RefCell<T>>;

pub fn new_ref<T>(v: T) -> Ref<T> {
    Rc::new(RefCell::new(v))
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SessionState {
    Starting,
    Running,
    Stopped,
    Terminated,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ThreadState {
    Running,
    Stopped,
    Exited,
}

#[derive(Clone, PartialEq, Debug, Default)]
pub struct Capabilities {
    pub supports_configuration_done_request: bool,
    pub supports_conditional_breakpoints: bool,
    pub supports_hit_conditional_breakpoints: bool,
    pub supports_log_points: bool,
    pub supports_set_variable: bool,
    pub supports_set_expression: bool,
    pub supports_terminate_request: bool,
    pub supports_restart_request: bool,
    pub supports_exception_info_request: bool,
    pub exception_breakpoint_filters: Vec<String>,
}

/// A debug session (§3 `Session`).
pub struct Session {
    pub uri: String,
    pub id: String,
    pub name: Signal<String>,
    pub state: Signal<SessionState>,
    pub capabilities: Signal<Capabilities>,
    pub parent: Option<Weak<RefCell<Session>>>,
    pub depth: u32,

    pub children: Edge<Session>,
    pub threads: Edge<Thread>,
    pub source_bindings: Edge<SourceBinding>,
    pub outputs: Edge<Output>,
    pub exception_filters: Edge<ExceptionFilter>,

    threads_by_id: RefCell<HashMap<i64, Ref<Thread>>>,

    pub leaf: Rollup<bool>,
    pub first_stopped_thread: Rollup<Option<Ref<Thread>>>,

    wiring: Scope,
}

impl Session {
    pub fn new(
        uri: String,
        id: String,
        name: String,
        parent: Option<&Ref<Session>>,
    ) -> Ref<Session> {
        let depth = parent.map(|p| p.borrow().depth + 1).unwrap_or(0);
        let session = new_ref(Session {
            uri,
            id,
            name: Signal::new(name),
            state: Signal::new(SessionState::Starting),
            capabilities: Signal::new(Capabilities::default()),
            parent: parent.map(Rc::downgrade),
            depth,
            children: Edge::new(Order::Insertion),
            threads: Edge::new(Order::Insertion),
            source_bindings: Edge::new(Order::Insertion),
            outputs: Edge::new(Order::Insertion),
            exception_filters: Edge::new(Order::Insertion),
            threads_by_id: RefCell::new(HashMap::new()),
            leaf: Rollup::new(|| true),
            first_stopped_thread: Rollup::new(|| None),
            wiring: Scope::root(),
        });
        Self::wire(&session);
        session
    }

    fn wire(session: &Ref<Session>) {
        let wiring = session.borrow().wiring.clone();
        crate::scope::Current::with_scope(&wiring, || {
            let children = session.borrow().children.clone();
            session.borrow_mut().leaf = Rollup::new(move || children.is_empty());

            let threads = session.borrow().threads.clone();
            session.borrow_mut().first_stopped_thread =
                Rollup::new(move || threads.first_filtered(|t: &Thread| t.state.get() == ThreadState::Stopped));

            // Refresh closures hold only a `Weak` back to the session, so
            // the wiring itself never keeps the session alive (the
            // session's own `wiring` scope already lives inside it — a
            // strong self-reference here would leak).
            let weak = Rc::downgrade(session);
            let weak_leaf = weak.clone();
            session.borrow().children.each(move |_child| {
                if let Some(s) = weak_leaf.upgrade() {
                    s.borrow().leaf.refresh();
                }
                Box::new(|| {})
            });

            session.borrow().threads.each(move |thread| {
                if let Some(s) = weak.upgrade() {
                    s.borrow().first_stopped_thread.refresh();
                }
                let weak_watch = weak.clone();
                let sub = thread.borrow().state.watch(move |_| {
                    if let Some(s) = weak_watch.upgrade() {
                        s.borrow().first_stopped_thread.refresh();
                    }
                });
                let weak_cleanup = weak.clone();
                Box::new(move || {
                    drop(sub);
                    if let Some(s) = weak_cleanup.upgrade() {
                        s.borrow().first_stopped_thread.refresh();
                    }
                })
            });
        });
    }

    pub fn link_thread(session: &Ref<Session>, thread: Ref<Thread>) {
        let id = thread.borrow().id;
        session.borrow().threads_by_id.borrow_mut().insert(id, thread.clone());
        session.borrow().threads.link(thread);
    }

    pub fn thread_by_id(session: &Ref<Session>, id: i64) -> Option<Ref<Thread>> {
        session.borrow().threads_by_id.borrow().get(&id).cloned()
    }

    pub fn unlink_thread(session: &Ref<Session>, thread: &Ref<Thread>) {
        let id = thread.borrow().id;
        session.borrow().threads_by_id.borrow_mut().remove(&id);
        session.borrow().threads.unlink(thread);
    }

    pub fn delete(session: &Ref<Session>) {
        session.borrow().threads.unlink_all();
        session.borrow().source_bindings.unlink_all();
        session.borrow().outputs.unlink_all();
        session.borrow().exception_filters.unlink_all();
        session.borrow().children.unlink_all();
        session.borrow().wiring.cancel();
    }
}

/// A debugger-attached thread (§3 `Thread`).
pub struct Thread {
    pub uri: String,
    pub id: i64,
    pub name: Signal<String>,
    pub state: Signal<ThreadState>,
    pub stops: Signal<u64>,
    pub focused: Signal<bool>,
    pub stacks: Edge<Stack>,
    pub session: Weak<RefCell<Session>>,
    wiring: Scope,
}

impl Thread {
    pub fn new(uri: String, id: i64, name: String, session: &Ref<Session>) -> Ref<Thread> {
        new_ref(Thread {
            uri,
            id,
            name: Signal::new(name),
            state: Signal::new(ThreadState::Running),
            stops: Signal::new(0),
            focused: Signal::new(false),
            stacks: Edge::new(Order::Reversed),
            session: Rc::downgrade(session),
            wiring: Scope::root(),
        })
    }

    /// The current Stack: the first (newest) under newest-first ordering
    /// (I3).
    pub fn current_stack(thread: &Ref<Thread>) -> Option<Ref<Stack>> {
        thread.borrow().stacks.snapshot().into_iter().next()
    }

    /// Makes `stack` the thread's current one, maintaining I4/P3: the
    /// previous current stack (if any) and its top frame stop being
    /// current/active, and `stack`'s own top frame becomes active.
    pub fn push_stack(thread: &Ref<Thread>, stack: Ref<Stack>) {
        if let Some(previous) = Thread::current_stack(thread) {
            previous.borrow().is_current.set(false);
            if let Some(frame) = Stack::top_frame(&previous) {
                frame.borrow().active.set(false);
            }
        }
        thread.borrow().stacks.link(stack.clone());
        stack.borrow().is_current.set(true);
        if let Some(frame) = Stack::top_frame(&stack) {
            frame.borrow().active.set(true);
        }
    }

    /// Unlinks every stack from the thread (a `continued` event). The
    /// current stack's `is_current`/top-frame `active` bits are cleared
    /// first; the Stack/Frame entities themselves are left registered in
    /// the store and stay independently resolvable (Q1 in DESIGN.md) —
    /// only the thread's edge to them is severed.
    pub fn clear_stacks(thread: &Ref<Thread>) {
        if let Some(current) = Thread::current_stack(thread) {
            current.borrow().is_current.set(false);
            if let Some(frame) = Stack::top_frame(&current) {
                frame.borrow().active.set(false);
            }
        }
        thread.borrow().stacks.unlink_all();
    }

    pub fn delete(thread: &Ref<Thread>) {
        Thread::clear_stacks(thread);
        thread.borrow().wiring.cancel();
    }
}

/// A captured call stack as of one stop event (§3 `Stack`).
pub struct Stack {
    pub uri: String,
    pub index: Signal<u32>,
    pub sequence: u64,
    /// True iff this is the first (newest) stack under the owning thread's
    /// newest-first ordering (I3, P3) — maintained by
    /// [`Thread::push_stack`]/[`Thread::clear_stacks`], not by the edge
    /// itself.
    pub is_current: Signal<bool>,
    pub frames: Edge<Frame>,
    pub thread: Weak<RefCell<Thread>>,
}

impl Stack {
    pub fn new(uri: String, index: u32, sequence: u64, thread: &Ref<Thread>) -> Ref<Stack> {
        new_ref(Stack {
            uri,
            index: Signal::new(index),
            sequence,
            is_current: Signal::new(false),
            frames: Edge::new(Order::Insertion),
            thread: Rc::downgrade(thread),
        })
    }

    pub fn top_frame(stack: &Ref<Stack>) -> Option<Ref<Frame>> {
        stack.borrow().frames.snapshot().into_iter().next()
    }
}

/// A single stack frame (§3 `Frame`).
pub struct Frame {
    pub uri: String,
    pub id: i64,
    pub index: u32,
    pub function_name: Signal<String>,
    pub line: Signal<u32>,
    pub column: Signal<u32>,
    pub active: Signal<bool>,
    /// DAP `StackFrame.presentationHint` (§10.3 supplement).
    pub presentation_hint: Signal<PresentationHint>,
    pub scopes: Edge<VarScope>,
    /// Owning stack, so `@frame+N`/`@frame-N` navigation (§4.7) can walk
    /// sibling frames by index without a separate lookup table.
    pub stack: Weak<RefCell<Stack>>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum PresentationHint {
    #[default]
    Normal,
    Label,
    Subtle,
}

impl Frame {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        uri: String,
        id: i64,
        index: u32,
        function_name: String,
        line: u32,
        column: u32,
        stack: &Ref<Stack>,
    ) -> Ref<Frame> {
        new_ref(Frame {
            uri,
            id,
            index,
            function_name: Signal::new(function_name),
            line: Signal::new(line),
            column: Signal::new(column),
            active: Signal::new(index == 0),
            presentation_hint: Signal::new(PresentationHint::Normal),
            scopes: Edge::new(Order::Insertion),
            stack: Rc::downgrade(stack),
        })
    }
}

/// A variable scope within a frame (§3 `Scope`; named `VarScope` in this
/// crate to avoid colliding with the subscription-cleanup `Scope` of C5).
pub struct VarScope {
    pub uri: String,
    pub name: Signal<String>,
    pub presentation_hint: Signal<String>,
    pub expensive: Signal<bool>,
    pub variables_reference: i64,
    pub variables: Edge<Variable>,
}

impl VarScope {
    pub fn new(uri: String, name: String, presentation_hint: String, expensive: bool, variables_reference: i64) -> Ref<VarScope> {
        new_ref(VarScope {
            uri,
            name: Signal::new(name),
            presentation_hint: Signal::new(presentation_hint),
            expensive: Signal::new(expensive),
            variables_reference,
            variables: Edge::new(Order::Insertion),
        })
    }
}

/// A single variable, possibly with nested children (§3 `Variable`).
pub struct Variable {
    pub uri: String,
    pub name: Signal<String>,
    pub value: Signal<String>,
    pub type_annotation: Signal<Option<String>>,
    pub variables_reference: Signal<i64>,
    pub evaluate_name: Signal<Option<String>>,
    pub children: Edge<Variable>,
    pub children_fetched: Signal<bool>,
}

impl Variable {
    pub fn new(uri: String, name: String, value: String, type_annotation: Option<String>, variables_reference: i64) -> Ref<Variable> {
        new_ref(Variable {
            uri,
            name: Signal::new(name),
            value: Signal::new(value),
            type_annotation: Signal::new(type_annotation),
            variables_reference: Signal::new(variables_reference),
            evaluate_name: Signal::new(None),
            children: Edge::new(Order::Insertion),
            children_fetched: Signal::new(false),
        })
    }
}

/// A source file, content-addressed (§3 `Source`).
pub struct Source {
    pub uri: String,
    pub key: String,
    pub path: Signal<Option<String>>,
    pub name: Signal<String>,
    pub content: Signal<Option<String>>,
    pub breakpoints: Edge<Breakpoint>,
    pub bindings: Edge<SourceBinding>,
    breakpoints_by_line: RefCell<HashMap<(i64, Option<i64>), Ref<Breakpoint>>>,
}

impl Source {
    pub fn new(uri: String, key: String, path: Option<String>, name: String) -> Ref<Source> {
        new_ref(Source {
            uri,
            key,
            path: Signal::new(path),
            name: Signal::new(name),
            content: Signal::new(None),
            breakpoints: Edge::new(Order::Insertion),
            bindings: Edge::new(Order::Insertion),
            breakpoints_by_line: RefCell::new(HashMap::new()),
        })
    }

    pub fn link_breakpoint(source: &Ref<Source>, bp: Ref<Breakpoint>) {
        let (line, column) = { let b = bp.borrow(); (b.line.get(), b.column.get()) };
        source.borrow().breakpoints_by_line.borrow_mut().insert((line, column), bp.clone());
        source.borrow().breakpoints.link(bp);
    }

    pub fn breakpoint_at(source: &Ref<Source>, line: i64, column: Option<i64>) -> Option<Ref<Breakpoint>> {
        source.borrow().breakpoints_by_line.borrow().get(&(line, column)).cloned()
    }

    pub fn unlink_breakpoint(source: &Ref<Source>, bp: &Ref<Breakpoint>) {
        let (line, column) = { let b = bp.borrow(); (b.line.get(), b.column.get()) };
        source.borrow().breakpoints_by_line.borrow_mut().remove(&(line, column));
        source.borrow().breakpoints.unlink(bp);
    }
}

/// Pairing of a `Source` with a `Session` (§3 `SourceBinding`).
pub struct SourceBinding {
    pub uri: String,
    pub session: Weak<RefCell<Session>>,
    pub source: Weak<RefCell<Source>>,
    pub adapter_source_reference: Signal<Option<i64>>,
}

impl SourceBinding {
    pub fn new(uri: String, session: &Ref<Session>, source: &Ref<Source>) -> Ref<SourceBinding> {
        new_ref(SourceBinding {
            uri,
            session: Rc::downgrade(session),
            source: Rc::downgrade(source),
            adapter_source_reference: Signal::new(None),
        })
    }
}

/// An authoritative, consumer-owned breakpoint (§3 `Breakpoint`).
pub struct Breakpoint {
    pub uri: String,
    pub source: Weak<RefCell<Source>>,
    pub source_key: String,
    pub line: Signal<i64>,
    pub column: Signal<Option<i64>>,
    pub condition: Signal<Option<String>>,
    pub hit_condition: Signal<Option<String>>,
    pub log_message: Signal<Option<String>>,
    pub enabled: Signal<bool>,
    pub bindings: Edge<BreakpointBinding>,
}

impl Breakpoint {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        uri: String,
        source: &Ref<Source>,
        source_key: String,
        line: i64,
        column: Option<i64>,
        condition: Option<String>,
        hit_condition: Option<String>,
        log_message: Option<String>,
    ) -> Ref<Breakpoint> {
        new_ref(Breakpoint {
            uri,
            source: Rc::downgrade(source),
            source_key,
            line: Signal::new(line),
            column: Signal::new(column),
            condition: Signal::new(condition),
            hit_condition: Signal::new(hit_condition),
            log_message: Signal::new(log_message),
            enabled: Signal::new(true),
            bindings: Edge::new(Order::Insertion),
        })
    }
}

/// Pairing of `Breakpoint` with `Session` (§3 `BreakpointBinding`).
pub struct BreakpointBinding {
    pub uri: String,
    pub session: Weak<RefCell<Session>>,
    pub breakpoint: Weak<RefCell<Breakpoint>>,
    pub adapter_id: Signal<Option<i64>>,
    pub verified: Signal<bool>,
    pub hit: Signal<bool>,
    pub actual_line: Signal<Option<i64>>,
    pub actual_column: Signal<Option<i64>>,
    pub message: Signal<Option<String>>,
}

impl BreakpointBinding {
    pub fn new(uri: String, session: &Ref<Session>, breakpoint: &Ref<Breakpoint>) -> Ref<BreakpointBinding> {
        new_ref(BreakpointBinding {
            uri,
            session: Rc::downgrade(session),
            breakpoint: Rc::downgrade(breakpoint),
            adapter_id: Signal::new(None),
            verified: Signal::new(false),
            hit: Signal::new(false),
            actual_line: Signal::new(None),
            actual_column: Signal::new(None),
            message: Signal::new(None),
        })
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OutputCategory {
    Stdout,
    Stderr,
    Console,
    Important,
    Telemetry,
}

/// One line of adapter/program output (§3 `Output`).
pub struct Output {
    pub uri: String,
    pub text: String,
    pub category: OutputCategory,
    pub sequence: u64,
}

impl Output {
    pub fn new(uri: String, text: String, category: OutputCategory, sequence: u64) -> Ref<Output> {
        new_ref(Output { uri, text, category, sequence })
    }
}

/// A DAP exception-breakpoint filter (§3 `ExceptionFilter`).
pub struct ExceptionFilter {
    pub uri: String,
    pub filter_id: String,
    pub label: String,
    pub enabled: Signal<bool>,
    pub condition: Signal<Option<String>>,
}

impl ExceptionFilter {
    pub fn new(uri: String, filter_id: String, label: String) -> Ref<ExceptionFilter> {
        new_ref(ExceptionFilter { uri, filter_id, label, enabled: Signal::new(false), condition: Signal::new(None) })
    }
}
