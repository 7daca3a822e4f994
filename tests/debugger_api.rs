//! Black-box coverage of the public `Debugger` surface that doesn't require
//! a live adapter process: breakpoint bookkeeping, the URI/URL query layer,
//! `watch`, and focus/context.

use dap_graph::config::AdapterConfig;
use dap_graph::{AnyEntity, BreakpointOptions, BreakpointSpec, Debugger};
use tokio::task::LocalSet;

#[tokio::test]
async fn register_adapter_accepts_a_well_formed_config_and_rejects_a_blank_command() {
    let dbg = Debugger::new();
    dbg.register_adapter(
        "python",
        AdapterConfig::Stdio { command: "python3".into(), args: vec!["-m".into(), "debugpy".into()], env: Default::default(), cwd: None },
    )
    .unwrap();

    let err = dbg.register_adapter("broken", AdapterConfig::Stdio { command: "   ".into(), args: vec![], env: Default::default(), cwd: None });
    assert!(err.is_err());
}

#[tokio::test]
async fn add_breakpoint_is_idempotent_and_remove_disables_before_unlinking() {
    LocalSet::new()
        .run_until(async {
            let dbg = Debugger::new();

            let bp1 = dbg.add_breakpoint("/repo/main.py", 10, BreakpointOptions::default()).await.unwrap();
            let bp2 = dbg.add_breakpoint("/repo/main.py", 10, BreakpointOptions::default()).await.unwrap();
            assert!(std::rc::Rc::ptr_eq(&bp1, &bp2), "adding the same (source, line, column) twice must return the same breakpoint");

            let at_line_11 = dbg.add_breakpoint("/repo/main.py", 11, BreakpointOptions::default()).await.unwrap();
            assert!(!std::rc::Rc::ptr_eq(&bp1, &at_line_11));

            let before = dbg.query("/sources/breakpoints").unwrap();
            assert_eq!(before.len(), 2);

            dbg.remove_breakpoint(&bp1).await.unwrap();
            assert!(!bp1.borrow().enabled.get(), "remove_breakpoint disables before it unlinks (I6)");

            let after = dbg.query("/sources/breakpoints").unwrap();
            assert_eq!(after.len(), 1);
        })
        .await;
}

#[tokio::test]
async fn export_then_import_breakpoints_round_trips_through_a_fresh_debugger() {
    LocalSet::new()
        .run_until(async {
            let original = Debugger::new();
            original.add_breakpoint("/repo/a.py", 5, BreakpointOptions { condition: Some("x > 0".into()), ..Default::default() }).await.unwrap();
            let disabled = original.add_breakpoint("/repo/a.py", 9, BreakpointOptions::default()).await.unwrap();
            disabled.borrow().enabled.set(false);

            let specs = original.export_breakpoints();
            assert_eq!(specs.len(), 2);

            let restored = Debugger::new();
            restored.import_breakpoints(specs).await.unwrap();

            let mut by_line: Vec<(i64, bool)> = restored
                .export_breakpoints()
                .into_iter()
                .map(|s: BreakpointSpec| (s.line, s.enabled))
                .collect();
            by_line.sort();
            assert_eq!(by_line, vec![(5, true), (9, false)]);
        })
        .await;
}

#[tokio::test]
async fn query_and_resolve_agree_on_the_same_breakpoint() {
    LocalSet::new()
        .run_until(async {
            let dbg = Debugger::new();
            let bp = dbg.add_breakpoint("/repo/main.py", 3, BreakpointOptions::default()).await.unwrap();

            let uri = bp.borrow().uri.clone();
            let by_uri = dbg.resolve(&uri).unwrap();
            assert_eq!(by_uri.len(), 1);
            match &by_uri[0] {
                AnyEntity::Breakpoint(b) => assert!(std::rc::Rc::ptr_eq(b, &bp)),
                _ => panic!("expected a Breakpoint"),
            }

            let by_url = dbg.query("/sources/breakpoints(enabled=true)").unwrap();
            assert_eq!(by_url.len(), 1);

            dbg.remove_breakpoint(&bp).await.unwrap();
            assert!(dbg.resolve(&uri).unwrap().is_empty(), "a removed breakpoint's uri no longer resolves to anything live");
        })
        .await;
}

#[tokio::test]
async fn watch_refreshes_after_a_mutating_call_but_not_on_its_own() {
    LocalSet::new()
        .run_until(async {
            let dbg = Debugger::new();
            let watch = dbg.watch("/sources/breakpoints").unwrap();
            assert!(watch.get().is_empty());

            dbg.add_breakpoint("/repo/main.py", 1, BreakpointOptions::default()).await.unwrap();
            assert_eq!(watch.get().len(), 1);

            dbg.add_breakpoint("/repo/main.py", 2, BreakpointOptions::default()).await.unwrap();
            assert_eq!(watch.get().len(), 2);
        })
        .await;
}

#[tokio::test]
async fn context_has_no_focused_session_thread_or_frame_before_any_session_starts() {
    let dbg = Debugger::new();
    let ctx = dbg.context();
    assert!(ctx.session().is_none());
    assert!(ctx.thread().is_none());
    assert!(ctx.frame().is_none());
}

#[tokio::test]
async fn focus_moves_the_url_consulted_by_context_even_without_a_matching_entity() {
    let dbg = Debugger::new();
    dbg.focus("/sessions:ghost/threads:1");
    // No such session is registered, so both the focused context and a
    // direct query against the same url come back empty rather than
    // erroring — an absent edge target is not a malformed query.
    assert!(dbg.context().session().is_none());
    assert_eq!(dbg.query("/sessions:ghost/threads:1").unwrap().len(), 0);
}
