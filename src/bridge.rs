//! Entity bridge (C9, §4.9): maps adapter events onto graph mutations, and
//! gives every entity its authored-side methods (`thread.continue()`,
//! `frame.evaluate(...)`, ...), each backed by exactly one (possibly
//! memoized) DAP request.
//!
//! Grounded on `perl-dap-stack`/`perl-dap-variables`'s request-then-update
//! pairing (fetch over the wire, then populate the in-memory tree) and on
//! `perl-dap::protocol`'s event loop for the dispatch table — the novelty
//! here is that "populate" means mutating [`Signal`]s and [`Edge`]s instead
//! of a plain struct, so the reactive graph (C6) picks the change up for
//! free.

use std::cell::Cell;
use std::rc::Rc;

use serde_json::Value;

use crate::breakpoints::{self, Synchroniser};
use crate::error::{DapError, DapResult};
use crate::graph::entities::{
    Frame, Output, OutputCategory, Ref, Session, SessionState, Source, SourceBinding, Stack, Thread, ThreadState,
    VarScope, Variable,
};
use crate::graph::store::AnyEntity;
use crate::graph::{Edge, Store};
use crate::hooks::Hooks;
use crate::identity::Uri;
use crate::protocol::{
    BreakpointEventBody, ContinuedEventBody, EvaluateArguments, EvaluateResponseBody, Event as WireEvent,
    OutputEventBody, ProtocolClient, ScopesArguments, ScopesResponseBody, SetExpressionArguments,
    SetExpressionResponseBody, SetVariableArguments, SetVariableResponseBody, StackTraceArguments,
    StackTraceResponseBody, StoppedEventBody, TerminatedEventBody, ThreadEventBody, ThreadScopedArguments,
    ThreadsResponseBody, VariablesArguments, VariablesResponseBody,
};
use crate::scope::Scope;
use crate::session::LaunchResolver;
use crate::task::{Memoizer, TaskScope};

/// Everything one running session needs to answer adapter events and serve
/// entity methods: the protocol client, the owning store, the consumer
/// hooks, the task/subscription scopes, the breakpoint synchroniser, a
/// small family of memoizers (one per kind of heavy fetch, O4), and the
/// spawned child sessions (§4.8 hierarchical sessions).
pub struct SessionRuntime {
    pub session: Ref<Session>,
    pub client: Rc<ProtocolClient>,
    pub store: Rc<Store>,
    pub hooks: Rc<Hooks>,
    pub resolver: Rc<LaunchResolver>,
    pub task_scope: TaskScope,
    pub sub_scope: Scope,
    pub sync: Synchroniser,
    pub children: std::cell::RefCell<Vec<Rc<SessionRuntime>>>,
    pub disconnect_sent: Cell<bool>,

    stack_memo: Memoizer<i64, Ref<Stack>>,
    scopes_memo: Memoizer<i64, ()>,
    variables_memo: Memoizer<i64, ()>,

    stack_sequence: Cell<u64>,
}

impl SessionRuntime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: Ref<Session>,
        client: Rc<ProtocolClient>,
        store: Rc<Store>,
        hooks: Rc<Hooks>,
        resolver: Rc<LaunchResolver>,
        task_scope: TaskScope,
        sub_scope: Scope,
        sync: Synchroniser,
    ) -> Self {
        Self {
            session,
            client,
            store,
            hooks,
            resolver,
            task_scope,
            sub_scope,
            sync,
            children: Default::default(),
            disconnect_sent: Cell::new(false),
            stack_memo: Memoizer::new(),
            scopes_memo: Memoizer::new(),
            variables_memo: Memoizer::new(),
            stack_sequence: Cell::new(0),
        }
    }

    fn session_id(&self) -> String {
        self.session.borrow().id.clone()
    }
}

/// The launch-resolver signature accepted by `Debugger::start` and reused
/// for child sessions spawned via `startDebugging`; re-exported here so
/// callers authoring hook closures don't have to reach into `session.rs`.
/// Registers the §4.9 event -> mutation table against `rt.client`.
pub fn wire_event_dispatch(rt: &Rc<SessionRuntime>) {
    register(rt, "thread", on_thread);
    register(rt, "stopped", on_stopped);
    register(rt, "continued", on_continued);
    register(rt, "terminated", on_terminated);
    register(rt, "exited", on_terminated);
    register(rt, "output", on_output);
    register(rt, "breakpoint", on_breakpoint);
    register(rt, "loadedSource", on_loaded_source);
}

fn register(rt: &Rc<SessionRuntime>, name: &'static str, handler: fn(&Rc<SessionRuntime>, &WireEvent)) {
    let weak = Rc::downgrade(rt);
    rt.client.on_event(move |event| {
        if event.event != name {
            return;
        }
        if let Some(rt) = weak.upgrade() {
            handler(&rt, event);
        }
    });
}

fn body_of<T: for<'de> serde::Deserialize<'de>>(event: &WireEvent) -> Option<T> {
    let body = event.body.clone()?;
    serde_json::from_value(body).ok()
}

fn on_thread(rt: &Rc<SessionRuntime>, event: &WireEvent) {
    let Some(body): Option<ThreadEventBody> = body_of(event) else { return };
    match body.reason.as_str() {
        "started" => {
            if Session::thread_by_id(&rt.session, body.thread_id).is_some() {
                return;
            }
            let uri = Uri::Thread { session_id: rt.session_id(), thread_id: body.thread_id }.render();
            let thread = Thread::new(uri.clone(), body.thread_id, format!("thread {}", body.thread_id), &rt.session);
            rt.store.register(uri, AnyEntity::Thread(thread.clone()));
            Session::link_thread(&rt.session, thread);
        }
        "exited" => {
            if let Some(thread) = Session::thread_by_id(&rt.session, body.thread_id) {
                thread.borrow().state.set(ThreadState::Exited);
                // Q2: a policy-configurable retention window would live
                // here; this crate keeps exited threads visible (their
                // last stack intact) until the session itself terminates.
            }
        }
        _ => {}
    }
}

fn on_stopped(rt: &Rc<SessionRuntime>, event: &WireEvent) {
    let Some(body): Option<StoppedEventBody> = body_of(event) else { return };
    rt.session.borrow().state.set(SessionState::Stopped);

    let thread_ids: Vec<i64> = if body.all_threads_stopped {
        rt.session.borrow().threads.snapshot().iter().map(|t| t.borrow().id).collect()
    } else {
        body.thread_id.into_iter().collect()
    };

    for thread_id in thread_ids {
        let Some(thread) = Session::thread_by_id(&rt.session, thread_id) else { continue };
        thread.borrow().state.set(ThreadState::Stopped);
        let stops = thread.borrow().stops.get();
        thread.borrow().stops.set(stops + 1);
        let rt_owned = rt.clone();
        crate::task::spawn(async move { let _ = fetch_stack_trace(&rt_owned, thread_id).await; }, Some(&rt.task_scope));
    }

    if body.reason == "breakpoint" {
        // DAP reports hit breakpoint adapter ids via `hitBreakpointIds`,
        // which isn't modeled as a typed field above since adapters vary
        // in whether they send it; re-parse the raw body defensively.
        if let Some(raw) = &event.body {
            if let Some(ids) = raw.get("hitBreakpointIds").and_then(Value::as_array) {
                let ids: Vec<i64> = ids.iter().filter_map(Value::as_i64).collect();
                breakpoints::mark_hits(&rt.store, &rt.session, &ids);
            }
        }
    }
}

fn on_continued(rt: &Rc<SessionRuntime>, event: &WireEvent) {
    let Some(body): Option<ContinuedEventBody> = body_of(event) else { return };
    rt.session.borrow().state.set(SessionState::Running);

    let thread_ids: Vec<i64> = if body.all_threads_continued {
        rt.session.borrow().threads.snapshot().iter().map(|t| t.borrow().id).collect()
    } else {
        vec![body.thread_id]
    };
    for thread_id in thread_ids {
        if let Some(thread) = Session::thread_by_id(&rt.session, thread_id) {
            thread.borrow().state.set(ThreadState::Running);
            Thread::clear_stacks(&thread);
        }
    }
    breakpoints::clear_hits(&rt.store, &rt.session);
}

fn on_terminated(rt: &Rc<SessionRuntime>, event: &WireEvent) {
    let _: Option<TerminatedEventBody> = body_of(event);
    rt.session.borrow().state.set(SessionState::Terminated);
    let rt_owned = rt.clone();
    crate::task::spawn(async move { crate::session::terminate_session(&rt_owned).await; }, Some(&rt.task_scope));
}

fn on_output(rt: &Rc<SessionRuntime>, event: &WireEvent) {
    let Some(body): Option<OutputEventBody> = body_of(event) else { return };
    let category = match body.category.as_deref() {
        Some("stderr") => OutputCategory::Stderr,
        Some("console") => OutputCategory::Console,
        Some("important") => OutputCategory::Important,
        Some("telemetry") => OutputCategory::Telemetry,
        _ => OutputCategory::Stdout,
    };
    let sequence = rt.session.borrow().outputs.snapshot().len() as u64;
    let uri = Uri::Output { session_id: rt.session_id(), sequence }.render();
    let output = Output::new(uri.clone(), body.output, category, sequence);
    rt.store.register(uri, AnyEntity::Output(output.clone()));
    rt.session.borrow().outputs.link(output);
}

fn on_breakpoint(rt: &Rc<SessionRuntime>, event: &WireEvent) {
    let Some(body): Option<BreakpointEventBody> = body_of(event) else { return };
    let Some(id) = body.breakpoint.id else { return };
    breakpoints::update_binding(&rt.store, &rt.session, id, body.breakpoint.verified, body.breakpoint.line, body.breakpoint.column, body.breakpoint.message);
}

fn on_loaded_source(rt: &Rc<SessionRuntime>, event: &WireEvent) {
    let Some(raw) = &event.body else { return };
    let Some(path) = raw.pointer("/source/path").and_then(Value::as_str) else { return };
    let name = raw.pointer("/source/name").and_then(Value::as_str).unwrap_or(path).to_string();
    let key = path.to_string();
    let source = match rt.store.sources.snapshot().into_iter().find(|s| s.borrow().key == key) {
        Some(s) => s,
        None => {
            let uri = Uri::Source { source_key: key.clone() }.render();
            let source = Source::new(uri.clone(), key.clone(), Some(path.to_string()), name);
            rt.store.register(uri, AnyEntity::Source(source.clone()));
            rt.store.sources.link(source.clone());
            source
        }
    };
    let binding_uri = Uri::SourceBinding { session_id: rt.session_id(), source_key: key }.render();
    if rt.store.resolve(&binding_uri).is_err() {
        let binding = SourceBinding::new(binding_uri.clone(), &rt.session, &source);
        rt.store.register(binding_uri, AnyEntity::SourceBinding(binding.clone()));
        rt.session.borrow().source_bindings.link(binding.clone());
        source.borrow().bindings.link(binding);
    }
}

/// Runs before `configurationDone` is sent (§4.8 step 4): pushes the
/// authoritative breakpoint set into the adapter via the synchroniser
/// (C10).
pub async fn before_configuration_done(rt: &Rc<SessionRuntime>) -> DapResult<()> {
    breakpoints::sync_all(&rt.client, &rt.store, &rt.session, &rt.sync).await
}

async fn fetch_stack_trace(rt: &Rc<SessionRuntime>, thread_id: i64) -> DapResult<()> {
    let rt2 = rt.clone();
    rt.stack_memo
        .call(thread_id, async move {
            let body: StackTraceResponseBody = rt2
                .client
                .request_typed("stackTrace", StackTraceArguments { thread_id, start_frame: None, levels: None }, None)
                .await?;
            let Some(thread) = Session::thread_by_id(&rt2.session, thread_id) else {
                return Err(DapError::Schema(format!("no thread {thread_id} for stackTrace result")));
            };
            let seq = rt2.stack_sequence.get();
            rt2.stack_sequence.set(seq + 1);
            let index = thread.borrow().stacks.snapshot().len() as u32;
            let stack_uri = Uri::Stack { session_id: rt2.session_id(), thread_id, stack_index: index }.render();
            let stack = Stack::new(stack_uri.clone(), index, seq, &thread);
            rt2.store.register(stack_uri, AnyEntity::Stack(stack.clone()));

            for wire in &body.stack_frames {
                let frame_uri = Uri::Frame { session_id: rt2.session_id(), frame_id: wire.id, seq }.render();
                let frame = Frame::new(frame_uri.clone(), wire.id, stack.borrow().frames.snapshot().len() as u32, wire.name.clone(), wire.line as u32, wire.column as u32, &stack);
                frame.borrow().presentation_hint.set(rt2.hooks.stack_classifier.classify(wire));
                rt2.store.register(frame_uri, AnyEntity::Frame(frame.clone()));
                stack.borrow().frames.link(frame);
            }
            Thread::push_stack(&thread, stack.clone());
            Ok(stack)
        })
        .await?;
    Ok(())
}

fn to_args(value: impl serde::Serialize) -> DapResult<Value> {
    serde_json::to_value(value).map_err(|e| DapError::Protocol(e.to_string()))
}

/// `thread.continue()` (§4.9 entity methods).
pub async fn thread_continue(rt: &Rc<SessionRuntime>, thread: &Ref<Thread>) -> DapResult<()> {
    let thread_id = thread.borrow().id;
    rt.client.request_no_body("continue", Some(to_args(ThreadScopedArguments { thread_id })?), None).await
}

/// `thread.pause()`.
pub async fn thread_pause(rt: &Rc<SessionRuntime>, thread: &Ref<Thread>) -> DapResult<()> {
    let thread_id = thread.borrow().id;
    rt.client.request_no_body("pause", Some(to_args(ThreadScopedArguments { thread_id })?), None).await
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StepKind {
    Over,
    In,
    Out,
}

/// `thread.stepOver/In/Out({granularity})`.
pub async fn thread_step(rt: &Rc<SessionRuntime>, thread: &Ref<Thread>, kind: StepKind, granularity: Option<&str>) -> DapResult<()> {
    let thread_id = thread.borrow().id;
    let command = match kind {
        StepKind::Over => "next",
        StepKind::In => "stepIn",
        StepKind::Out => "stepOut",
    };
    let mut args = to_args(ThreadScopedArguments { thread_id })?;
    if let Some(g) = granularity {
        args["granularity"] = Value::String(g.to_string());
    }
    rt.client.request_no_body(command, Some(args), None).await
}

/// `frame.fetchScopes()`.
pub async fn frame_fetch_scopes(rt: &Rc<SessionRuntime>, frame: &Ref<Frame>) -> DapResult<()> {
    let frame_id = frame.borrow().id;
    let rt2 = rt.clone();
    let frame2 = frame.clone();
    rt.scopes_memo
        .call(frame_id, async move {
            if !frame2.borrow().scopes.is_empty() {
                return Ok(());
            }
            let body: ScopesResponseBody = rt2.client.request_typed("scopes", ScopesArguments { frame_id }, None).await?;
            for wire in body.scopes {
                let uri = Uri::Scope {
                    session_id: rt2.session_id(),
                    frame_id,
                    seq: frame2.borrow().stack.upgrade().map(|s| s.borrow().sequence).unwrap_or(0),
                    scope_name: wire.name.clone(),
                }
                .render();
                let hint = wire.presentation_hint.clone().unwrap_or_default();
                let scope = VarScope::new(uri.clone(), wire.name, hint, wire.expensive, wire.variables_reference);
                rt2.store.register(uri, AnyEntity::VarScope(scope.clone()));
                frame2.borrow().scopes.link(scope);
            }
            Ok(())
        })
        .await
}

/// `scope.fetchVariables()` and `variable.fetchChildren()` share the same
/// underlying `variables` request, keyed by `variables_reference` (O4).
async fn fetch_variables_into(rt: &Rc<SessionRuntime>, variables_reference: i64, target: &Edge<Variable>) -> DapResult<()> {
    let rt2 = rt.clone();
    rt.variables_memo
        .call(variables_reference, async move {
            let body: VariablesResponseBody =
                rt2.client.request_typed("variables", VariablesArguments { variables_reference }, None).await?;
            for wire in body.variables {
                let rendered = rt2.hooks.variable_renderer.render(&wire);
                let uri = Uri::Variable { session_id: rt2.session_id(), variables_reference, name: wire.name.clone() }.render();
                let variable = Variable::new(uri.clone(), wire.name, rendered.value, rendered.type_annotation, wire.variables_reference);
                variable.borrow().evaluate_name.set(wire.evaluate_name);
                rt2.store.register(uri, AnyEntity::Variable(variable.clone()));
                target.link(variable);
            }
            Ok(())
        })
        .await
}

/// `scope.fetchVariables()`.
pub async fn scope_fetch_variables(rt: &Rc<SessionRuntime>, scope: &Ref<VarScope>) -> DapResult<()> {
    let (variables_reference, already) = {
        let s = scope.borrow();
        (s.variables_reference, !s.variables.is_empty())
    };
    if already {
        return Ok(());
    }
    let target = scope.borrow().variables.clone();
    fetch_variables_into(rt, variables_reference, &target).await
}

/// `variable.fetchChildren()`.
pub async fn variable_fetch_children(rt: &Rc<SessionRuntime>, variable: &Ref<Variable>) -> DapResult<()> {
    let (variables_reference, already) = {
        let v = variable.borrow();
        (v.variables_reference.get(), v.children_fetched.get())
    };
    if already || variables_reference == 0 {
        return Ok(());
    }
    let target = variable.borrow().children.clone();
    fetch_variables_into(rt, variables_reference, &target).await?;
    variable.borrow().children_fetched.set(true);
    Ok(())
}

/// `variable.setValue(v)`.
pub async fn variable_set_value(rt: &Rc<SessionRuntime>, variable: &Ref<Variable>, value: String) -> DapResult<()> {
    let variables_reference = variable.borrow().variables_reference.get();
    if !rt.session.borrow().capabilities.get().supports_set_variable {
        return Err(DapError::Capability { capability: "setVariable".into(), context: "variable.setValue".into() });
    }
    let name = variable.borrow().name.get();
    let body: SetVariableResponseBody = rt
        .client
        .request_typed("setVariable", SetVariableArguments { variables_reference, name, value }, None)
        .await?;
    variable.borrow().value.set(body.value);
    if let Some(vref) = body.variables_reference {
        variable.borrow().variables_reference.set(vref);
        variable.borrow().children.unlink_all();
        variable.borrow().children_fetched.set(false);
    }
    Ok(())
}

pub struct EvaluateResult {
    pub result: String,
    pub type_annotation: Option<String>,
    pub variables_reference: i64,
}

/// `frame.evaluate(expr, context)`, vetted by the evaluate guard hook
/// (§10.4) before ever reaching the wire.
pub async fn frame_evaluate(rt: &Rc<SessionRuntime>, frame: &Ref<Frame>, expression: &str, context: Option<&str>) -> DapResult<EvaluateResult> {
    rt.hooks.evaluate_guard.check(expression, context).map_err(DapError::Schema)?;
    let frame_id = frame.borrow().id;
    let body: EvaluateResponseBody = rt
        .client
        .request_typed(
            "evaluate",
            EvaluateArguments { expression: expression.to_string(), frame_id: Some(frame_id), context: context.map(String::from) },
            None,
        )
        .await?;
    Ok(EvaluateResult { result: body.result, type_annotation: body.type_annotation, variables_reference: body.variables_reference })
}

/// `frame.setExpression(expr, value)` — the write counterpart to
/// `evaluate`, gated behind `supportsSetExpression` (§4.9).
pub async fn frame_set_expression(rt: &Rc<SessionRuntime>, frame: &Ref<Frame>, expression: &str, value: &str) -> DapResult<String> {
    if !rt.session.borrow().capabilities.get().supports_set_expression {
        return Err(DapError::Capability { capability: "setExpression".into(), context: "frame.setExpression".into() });
    }
    let frame_id = frame.borrow().id;
    let body: SetExpressionResponseBody = rt
        .client
        .request_typed(
            "setExpression",
            SetExpressionArguments { expression: expression.to_string(), value: value.to_string(), frame_id: Some(frame_id) },
            None,
        )
        .await?;
    Ok(body.value)
}

/// `session.restart()`, gated behind `supportsRestartRequest`.
pub async fn session_restart(rt: &Rc<SessionRuntime>) -> DapResult<()> {
    if !rt.session.borrow().capabilities.get().supports_restart_request {
        return Err(DapError::Capability { capability: "restart".into(), context: "session.restart".into() });
    }
    rt.client.request_no_body("restart", None, None).await
}

/// `session.disconnect()`.
pub async fn session_disconnect(rt: &Rc<SessionRuntime>) -> DapResult<()> {
    crate::session::terminate_session(rt).await;
    Ok(())
}

/// `Threads` fetch, used by `Debugger::context` helpers to reconcile the
/// thread list outside the `thread(started)`/`thread(exited)` event pair
/// (some adapters omit one or both events on attach).
pub async fn refresh_threads(rt: &Rc<SessionRuntime>) -> DapResult<()> {
    let body: ThreadsResponseBody = rt.client.request_typed("threads", Value::Null, None).await?;
    for wire in body.threads {
        if Session::thread_by_id(&rt.session, wire.id).is_some() {
            continue;
        }
        let uri = Uri::Thread { session_id: rt.session_id(), thread_id: wire.id }.render();
        let thread = Thread::new(uri.clone(), wire.id, wire.name, &rt.session);
        rt.store.register(uri, AnyEntity::Thread(thread.clone()));
        Session::link_thread(&rt.session, thread);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResolvedAdapterConfig;
    use crate::graph::entities::Breakpoint;
    use crate::graph::Store;
    use crate::transport::Transport;
    use serde_json::json;
    use tokio::task::LocalSet;

    fn no_resolver() -> Rc<LaunchResolver> {
        Rc::new(|_: Value| -> DapResult<(ResolvedAdapterConfig, String, Value)> {
            Err(DapError::Configuration("no resolver needed in this test".into()))
        })
    }

    fn rt_with_thread(store: &Rc<Store>, client_side: Transport, thread_id: i64) -> Rc<SessionRuntime> {
        let session = Session::new("session:xotat".into(), "xotat".into(), "test".into(), None);
        store.register("session:xotat".into(), AnyEntity::Session(session.clone()));
        store.sessions.link(session.clone());
        let client = ProtocolClient::start(client_side);
        let rt = Rc::new(SessionRuntime::new(
            session.clone(),
            client,
            store.clone(),
            Hooks::shared(),
            no_resolver(),
            TaskScope::root(),
            Scope::root(),
            Synchroniser::new(),
        ));
        wire_event_dispatch(&rt);
        let thread_uri = Uri::Thread { session_id: "xotat".into(), thread_id }.render();
        let thread = Thread::new(thread_uri.clone(), thread_id, "main".into(), &session);
        store.register(thread_uri, AnyEntity::Thread(thread.clone()));
        Session::link_thread(&session, thread);
        rt
    }

    /// E1: a `stopped(reason=breakpoint)` event fetches a stack/frame for
    /// the stopped thread and marks the bindings named in
    /// `hitBreakpointIds` hit.
    #[tokio::test]
    async fn stopped_on_breakpoint_fetches_stack_and_marks_the_hit_binding() {
        LocalSet::new()
            .run_until(async {
                let store = Store::new();
                let (client_side, mut adapter_side) = Transport::mock_pair(8192);
                let rt = rt_with_thread(&store, client_side, 1);

                let source = crate::graph::entities::Source::new("source:/a.py".into(), "/a.py".into(), Some("/a.py".into()), "a.py".into());
                store.sources.link(source.clone());
                let bp = Breakpoint::new("breakpoint:/a.py:3:_".into(), &source, "/a.py".into(), 3, None, None, None, None);
                crate::graph::entities::Source::link_breakpoint(&source, bp.clone());
                let binding = crate::graph::entities::BreakpointBinding::new("bpbinding:xotat:/a.py:3:_".into(), &rt.session, &bp);
                binding.borrow().adapter_id.set(Some(42));
                bp.borrow().bindings.link(binding.clone());

                crate::task::spawn(
                    async move {
                        adapter_side
                            .send(&json!({
                                "seq": 1, "type": "event", "event": "stopped",
                                "body": {"reason": "breakpoint", "threadId": 1, "allThreadsStopped": true, "hitBreakpointIds": [42]}
                            }))
                            .await
                            .unwrap();
                        let req = adapter_side.recv().await.unwrap().unwrap();
                        let seq = req["seq"].as_i64().unwrap();
                        adapter_side
                            .send(&json!({
                                "seq": 2, "type": "response", "request_seq": seq, "success": true,
                                "command": "stackTrace",
                                "body": {"stackFrames": [{"id": 7, "name": "main", "line": 3, "column": 1}]}
                            }))
                            .await
                            .unwrap();
                    },
                    None,
                );

                // Give the event its turn on the read loop, then the
                // spawned stack-trace fetch a turn to complete its
                // request/response round trip.
                for _ in 0..5 {
                    tokio::task::yield_now().await;
                }

                assert!(binding.borrow().hit.get());
                let thread = Session::thread_by_id(&rt.session, 1).unwrap();
                assert_eq!(thread.borrow().state.get(), ThreadState::Stopped);
            })
            .await;
    }

    /// E2: a `continued` event unlinks a thread's stacks, but a frame
    /// captured before the continue remains a valid, independently
    /// addressable entity (Q1 in DESIGN.md).
    #[tokio::test]
    async fn continued_unlinks_stacks_but_old_frame_stays_resolvable() {
        LocalSet::new()
            .run_until(async {
                let store = Store::new();
                let (client_side, mut adapter_side) = Transport::mock_pair(8192);
                let rt = rt_with_thread(&store, client_side, 1);
                let thread = Session::thread_by_id(&rt.session, 1).unwrap();

                let stack = crate::graph::entities::Stack::new("stack:xotat:1:0".into(), 0, 0, &thread);
                let frame = crate::graph::entities::Frame::new("frame:xotat:7:0".into(), 7, 0, "main".into(), 3, 1, &stack);
                stack.borrow().frames.link(frame.clone());
                Thread::push_stack(&thread, stack.clone());
                store.register("frame:xotat:7:0".into(), AnyEntity::Frame(frame.clone()));
                assert!(stack.borrow().is_current.get());
                assert!(frame.borrow().active.get());

                adapter_side
                    .send(&json!({
                        "seq": 1, "type": "event", "event": "continued",
                        "body": {"threadId": 1, "allThreadsContinued": false}
                    }))
                    .await
                    .unwrap();
                for _ in 0..3 {
                    tokio::task::yield_now().await;
                }

                assert!(thread.borrow().stacks.is_empty());
                assert!(matches!(store.resolve("frame:xotat:7:0"), Ok(AnyEntity::Frame(f)) if Rc::ptr_eq(&f, &frame)));
                assert!(!stack.borrow().is_current.get(), "a stack unlinked by continued is no longer current (I4)");
                assert!(!frame.borrow().active.get(), "its top frame stops being active even though the entity is still resolvable");
            })
            .await;
    }

    /// I4/P3: fetching a fresh stack for a thread that already has one
    /// demotes the old stack's top frame — exactly one frame is ever active
    /// for a thread at a time.
    #[tokio::test]
    async fn stopping_again_deactivates_the_previous_stacks_top_frame() {
        LocalSet::new()
            .run_until(async {
                let store = Store::new();
                let (client_side, mut adapter_side) = Transport::mock_pair(8192);
                let rt = rt_with_thread(&store, client_side, 1);

                crate::task::spawn(async move {
                    adapter_side
                        .send(&json!({
                            "seq": 1, "type": "event", "event": "stopped",
                            "body": {"reason": "step", "threadId": 1, "allThreadsStopped": true}
                        }))
                        .await
                        .unwrap();
                    let req1 = adapter_side.recv().await.unwrap().unwrap();
                    adapter_side
                        .send(&json!({
                            "seq": 2, "type": "response", "request_seq": req1["seq"], "success": true,
                            "command": "stackTrace",
                            "body": {"stackFrames": [{"id": 1, "name": "a", "line": 1, "column": 1}]}
                        }))
                        .await
                        .unwrap();

                    adapter_side
                        .send(&json!({
                            "seq": 3, "type": "event", "event": "stopped",
                            "body": {"reason": "step", "threadId": 1, "allThreadsStopped": true}
                        }))
                        .await
                        .unwrap();
                    let req2 = adapter_side.recv().await.unwrap().unwrap();
                    adapter_side
                        .send(&json!({
                            "seq": 4, "type": "response", "request_seq": req2["seq"], "success": true,
                            "command": "stackTrace",
                            "body": {"stackFrames": [{"id": 2, "name": "b", "line": 2, "column": 1}]}
                        }))
                        .await
                        .unwrap();
                }, None);

                for _ in 0..20 {
                    tokio::task::yield_now().await;
                }

                let thread = Session::thread_by_id(&rt.session, 1).unwrap();
                let stacks = thread.borrow().stacks.snapshot();
                assert_eq!(stacks.len(), 2);
                let (newest, oldest) = (&stacks[0], &stacks[1]);

                assert!(newest.borrow().is_current.get());
                assert!(!oldest.borrow().is_current.get());
                assert!(crate::graph::entities::Stack::top_frame(newest).unwrap().borrow().active.get());
                assert!(!crate::graph::entities::Stack::top_frame(oldest).unwrap().borrow().active.get());
            })
            .await;
    }

    /// E4: a bound breakpoint's `hit` flag, once set by a stop, clears on
    /// the next `continued` for the session.
    #[tokio::test]
    async fn continued_clears_a_previously_hit_binding() {
        LocalSet::new()
            .run_until(async {
                let store = Store::new();
                let (client_side, mut adapter_side) = Transport::mock_pair(8192);
                let rt = rt_with_thread(&store, client_side, 1);

                let source = crate::graph::entities::Source::new("source:/a.py".into(), "/a.py".into(), Some("/a.py".into()), "a.py".into());
                store.sources.link(source.clone());
                let bp = Breakpoint::new("breakpoint:/a.py:3:_".into(), &source, "/a.py".into(), 3, None, None, None, None);
                crate::graph::entities::Source::link_breakpoint(&source, bp.clone());
                let binding = crate::graph::entities::BreakpointBinding::new("bpbinding:xotat:/a.py:3:_".into(), &rt.session, &bp);
                bp.borrow().bindings.link(binding.clone());
                binding.borrow().hit.set(true);

                adapter_side
                    .send(&json!({
                        "seq": 1, "type": "event", "event": "continued",
                        "body": {"threadId": 1, "allThreadsContinued": true}
                    }))
                    .await
                    .unwrap();
                for _ in 0..3 {
                    tokio::task::yield_now().await;
                }

                assert!(!binding.borrow().hit.get());
            })
            .await;
    }
}
