//! Breakpoint synchroniser (C10, §4.10).
//!
//! The authoritative state is the set of `Breakpoint` entities a `Source`
//! owns; this module reconciles that set into per-session
//! `BreakpointBinding`s via `setBreakpoints`, serialised per (session,
//! source) pair the way the teacher's `tcp_attach.rs` serialises connect
//! attempts through a single in-flight guard — here the guard is the
//! crate's own [`crate::task::Mutex`] (O3).

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::error::DapResult;
use crate::graph::entities::{Breakpoint, BreakpointBinding, Ref, Session, Source};
use crate::graph::Store;
use crate::identity::Uri;
use crate::protocol::{ProtocolClient, SetBreakpointsArguments, SetBreakpointsResponseBody, SourceBreakpoint, SourceRef};
use crate::task::Mutex as TaskMutex;

/// Owns one FIFO mutex per (session id, source key) pair so concurrent
/// triggers for the same pair (an `enable()` racing a `loadedSource` event,
/// say) serialise rather than interleave their `setBreakpoints` calls.
#[derive(Default)]
pub struct Synchroniser {
    mutexes: RefCell<HashMap<(String, String), TaskMutex>>,
}

impl Synchroniser {
    pub fn new() -> Self {
        Self::default()
    }

    fn mutex_for(&self, session_id: &str, source_key: &str) -> TaskMutex {
        let key = (session_id.to_string(), source_key.to_string());
        if let Some(m) = self.mutexes.borrow().get(&key) {
            return m.clone();
        }
        let m = TaskMutex::new();
        self.mutexes.borrow_mut().insert(key, m.clone());
        m
    }
}

fn find_binding(bp: &Ref<Breakpoint>, session_id: &str) -> Option<Ref<BreakpointBinding>> {
    bp.borrow().bindings.snapshot().into_iter().find(|b| {
        b.borrow().session.upgrade().map(|s| s.borrow().id.clone()).as_deref() == Some(session_id)
    })
}

/// Runs the sync algorithm for one (session, source) pair: diffs the
/// enabled `Breakpoint`s under `source` against the session's current
/// bindings and issues exactly one `setBreakpoints` call reflecting the
/// state at lock-acquisition time (O3).
pub async fn sync_source(
    client: &ProtocolClient,
    store: &Rc<Store>,
    session: &Ref<Session>,
    source: &Ref<Source>,
    sync: &Synchroniser,
) -> DapResult<()> {
    let session_id = session.borrow().id.clone();
    let source_key = source.borrow().key.clone();
    let mutex = sync.mutex_for(&session_id, &source_key);
    let _permit = mutex.lock().await;

    let all = source.borrow().breakpoints.snapshot();
    let disabled: Vec<Ref<Breakpoint>> = all.iter().filter(|b| !b.borrow().enabled.get()).cloned().collect();
    let mut enabled: Vec<Ref<Breakpoint>> = all.iter().filter(|b| b.borrow().enabled.get()).cloned().collect();
    enabled.sort_by_key(|b| {
        let b = b.borrow();
        (b.line.get(), b.column.get().unwrap_or(i64::MIN))
    });

    let descriptors: Vec<SourceBreakpoint> = enabled
        .iter()
        .map(|bp| {
            let bp = bp.borrow();
            SourceBreakpoint {
                line: bp.line.get(),
                column: bp.column.get(),
                condition: bp.condition.get(),
                hit_condition: bp.hit_condition.get(),
                log_message: bp.log_message.get(),
            }
        })
        .collect();

    let (path, name) = {
        let s = source.borrow();
        (s.path.get(), s.name.get())
    };
    let args = SetBreakpointsArguments {
        source: SourceRef { path, name: Some(name), source_reference: None },
        breakpoints: Some(descriptors),
    };

    let body: SetBreakpointsResponseBody = client.request_typed("setBreakpoints", args, None).await?;

    // I6: a disabled Breakpoint owns no binding in any session. Applied
    // only once the call above has actually succeeded, so a cancelled
    // setBreakpoints leaves binding state unchanged (§4.4 cancellation).
    for bp in &disabled {
        if let Some(binding) = find_binding(bp, &session_id) {
            let uri = binding.borrow().uri.clone();
            bp.borrow().bindings.unlink(&binding);
            store.mark_deleted(&uri);
        }
    }

    for (bp, wire) in enabled.iter().zip(body.breakpoints.iter()) {
        let binding = match find_binding(bp, &session_id) {
            Some(b) => b,
            None => {
                let (source_path, line, column) = {
                    let b = bp.borrow();
                    (b.source_key.clone(), b.line.get(), b.column.get())
                };
                let uri = Uri::BreakpointBinding { session_id: session_id.clone(), source_path, line, column }.render();
                let binding = BreakpointBinding::new(uri.clone(), session, bp);
                bp.borrow().bindings.link(binding.clone());
                store.register(uri, crate::graph::store::AnyEntity::BreakpointBinding(binding.clone()));
                binding
            }
        };
        let b = binding.borrow();
        b.adapter_id.set(wire.id);
        b.verified.set(wire.verified);
        b.actual_line.set(wire.line);
        b.actual_column.set(wire.column);
        b.message.set(wire.message.clone());
    }

    Ok(())
}

/// Runs [`sync_source`] for every Source with at least one Breakpoint
/// (enabled or not — a source whose last enabled breakpoint was just
/// disabled still needs the clearing call), used from
/// `beforeConfigurationDone` and on session termination.
pub async fn sync_all(client: &ProtocolClient, store: &Rc<Store>, session: &Ref<Session>, sync: &Synchroniser) -> DapResult<()> {
    for source in store.sources.snapshot() {
        if !source.borrow().breakpoints.is_empty() {
            sync_source(client, store, session, &source, sync).await?;
        }
    }
    Ok(())
}

/// On `stopped(reason=breakpoint, hitBreakpointIds)`: marks the referenced
/// bindings hit (§4.10 "Hit tracking"). Linear in the number of breakpoint
/// bindings in the store, which is acceptable for a stop event (not a hot
/// path).
pub fn mark_hits(store: &Rc<Store>, session: &Ref<Session>, hit_ids: &[i64]) {
    let session_id = session.borrow().id.clone();
    for source in store.sources.snapshot() {
        for bp in source.borrow().breakpoints.snapshot() {
            if let Some(binding) = find_binding(&bp, &session_id) {
                let adapter_id = binding.borrow().adapter_id.get();
                if adapter_id.map(|id| hit_ids.contains(&id)).unwrap_or(false) {
                    binding.borrow().hit.set(true);
                }
            }
        }
    }
}

/// On `continued` for the owning thread: clears every hit flag in the
/// session (I7 — a binding's `hit` is cleared on the next continued/resume
/// of its owning thread; this crate clears session-wide on any continue,
/// which is a superset-safe approximation since a binding can only be hit
/// while its session is stopped).
pub fn clear_hits(store: &Rc<Store>, session: &Ref<Session>) {
    let session_id = session.borrow().id.clone();
    for source in store.sources.snapshot() {
        for bp in source.borrow().breakpoints.snapshot() {
            if let Some(binding) = find_binding(&bp, &session_id) {
                binding.borrow().hit.set(false);
            }
        }
    }
}

/// On `breakpoint{reason=changed}`: updates the binding matching the
/// wire-reported adapter id.
pub fn update_binding(store: &Rc<Store>, session: &Ref<Session>, adapter_id: i64, verified: bool, line: Option<i64>, column: Option<i64>, message: Option<String>) {
    let session_id = session.borrow().id.clone();
    for source in store.sources.snapshot() {
        for bp in source.borrow().breakpoints.snapshot() {
            if let Some(binding) = find_binding(&bp, &session_id) {
                if binding.borrow().adapter_id.get() == Some(adapter_id) {
                    let b = binding.borrow();
                    b.verified.set(verified);
                    b.actual_line.set(line);
                    b.actual_column.set(column);
                    b.message.set(message.clone());
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::entities::Source;
    use crate::transport::Transport;
    use serde_json::json;
    use tokio::task::LocalSet;

    #[tokio::test]
    async fn sync_source_creates_bindings_in_response_order() {
        LocalSet::new()
            .run_until(async {
                let store = Store::new();
                let session = Session::new("session:xotat".into(), "xotat".into(), "test".into(), None);
                store.sessions.link(session.clone());
                store.register("session:xotat".into(), crate::graph::store::AnyEntity::Session(session.clone()));

                let source = Source::new("source:/x/hello.py".into(), "/x/hello.py".into(), Some("/x/hello.py".into()), "hello.py".into());
                store.sources.link(source.clone());

                let bp1 = Breakpoint::new("breakpoint:/x/hello.py:3:_".into(), &source, "/x/hello.py".into(), 3, None, None, None, None);
                Source::link_breakpoint(&source, bp1.clone());
                let bp2 = Breakpoint::new("breakpoint:/x/hello.py:5:_".into(), &source, "/x/hello.py".into(), 5, None, None, None, None);
                Source::link_breakpoint(&source, bp2.clone());

                let (client_transport, mut adapter_transport) = Transport::mock_pair(8192);
                let client = ProtocolClient::start(client_transport);

                crate::task::spawn(
                    async move {
                        let req = adapter_transport.recv().await.unwrap().unwrap();
                        let seq = req["seq"].as_i64().unwrap();
                        let resp = json!({
                            "seq": 1, "type": "response", "request_seq": seq, "success": true,
                            "command": "setBreakpoints",
                            "body": {"breakpoints": [
                                {"id": 1, "verified": true, "line": 3},
                                {"id": 2, "verified": true, "line": 5}
                            ]}
                        });
                        adapter_transport.send(&resp).await.unwrap();
                    },
                    None,
                );

                let sync = Synchroniser::new();
                sync_source(&client, &store, &session, &source, &sync).await.unwrap();

                assert!(find_binding(&bp1, "xotat").unwrap().borrow().verified.get());
                assert!(find_binding(&bp2, "xotat").unwrap().borrow().verified.get());
            })
            .await;
    }

    #[tokio::test]
    async fn disabling_a_breakpoint_unlinks_its_binding() {
        LocalSet::new()
            .run_until(async {
                let store = Store::new();
                let session = Session::new("session:xotat".into(), "xotat".into(), "test".into(), None);
                store.sessions.link(session.clone());

                let source = Source::new("source:/x/hello.py".into(), "/x/hello.py".into(), None, "hello.py".into());
                let bp = Breakpoint::new("breakpoint:/x/hello.py:3:_".into(), &source, "/x/hello.py".into(), 3, None, None, None, None);
                Source::link_breakpoint(&source, bp.clone());

                let binding = BreakpointBinding::new("bpbinding:xotat:/x/hello.py:3:_".into(), &session, &bp);
                bp.borrow().bindings.link(binding);
                assert_eq!(bp.borrow().bindings.len(), 1);

                bp.borrow().enabled.set(false);

                let (client_transport, mut adapter_transport) = Transport::mock_pair(8192);
                let client = ProtocolClient::start(client_transport);
                crate::task::spawn(
                    async move {
                        let req = adapter_transport.recv().await.unwrap().unwrap();
                        let seq = req["seq"].as_i64().unwrap();
                        adapter_transport
                            .send(&json!({"seq": 1, "type": "response", "request_seq": seq, "success": true, "command": "setBreakpoints", "body": {"breakpoints": []}}))
                            .await
                            .unwrap();
                    },
                    None,
                );

                let sync = Synchroniser::new();
                sync_source(&client, &store, &session, &source, &sync).await.unwrap();
                assert_eq!(bp.borrow().bindings.len(), 0);
            })
            .await;
    }

    /// §4.4: "A cancelled setBreakpoints leaves the binding state
    /// unchanged." The disable-and-unlink step must not run until the wire
    /// round trip actually succeeds, or a call cancelled mid-flight leaves
    /// the binding unlinked with no adapter exchange to justify it.
    #[tokio::test]
    async fn cancelling_mid_flight_leaves_a_disabled_breakpoints_binding_untouched() {
        LocalSet::new()
            .run_until(async {
                let store = Store::new();
                let session = Session::new("session:xotat".into(), "xotat".into(), "test".into(), None);
                store.sessions.link(session.clone());

                let source = Source::new("source:/x/hello.py".into(), "/x/hello.py".into(), None, "hello.py".into());
                let bp = Breakpoint::new("breakpoint:/x/hello.py:3:_".into(), &source, "/x/hello.py".into(), 3, None, None, None, None);
                Source::link_breakpoint(&source, bp.clone());

                let binding_uri = "bpbinding:xotat:/x/hello.py:3:_".to_string();
                let binding = BreakpointBinding::new(binding_uri.clone(), &session, &bp);
                bp.borrow().bindings.link(binding.clone());
                store.register(binding_uri.clone(), crate::graph::store::AnyEntity::BreakpointBinding(binding));
                bp.borrow().enabled.set(false);

                let (client_transport, mut adapter_transport) = Transport::mock_pair(8192);
                let client = ProtocolClient::start(client_transport);

                // Consumes the setBreakpoints request but never answers it,
                // so sync_source is left awaiting the response when cancelled.
                crate::task::spawn(
                    async move {
                        let _ = adapter_transport.recv().await;
                    },
                    None,
                );

                let store2 = store.clone();
                let sync = Synchroniser::new();
                let handle = crate::task::spawn(
                    async move { sync_source(&client, &store2, &session, &source, &sync).await },
                    None,
                );
                for _ in 0..5 {
                    tokio::task::yield_now().await;
                }
                handle.cancel();
                for _ in 0..5 {
                    tokio::task::yield_now().await;
                }

                assert_eq!(bp.borrow().bindings.len(), 1, "the binding must still be linked after a cancelled call");
                assert!(store.resolve(&binding_uri).is_ok(), "the binding must not have been marked deleted");
            })
            .await;
    }
}
