//! URL navigation paths over the graph (C7, §4.7) plus focus/context.
//!
//! ```text
//! URL       := Prefix? Segment ('/' Segment)*
//! Prefix    := '/' | '@' Marker
//! Marker    := 'debugger' | 'session' | 'thread' | 'frame' | 'frame+' N | 'frame-' N
//! Segment   := EdgeName (':' Key)? ('(' FilterList ')')? ('[' Index ']')?
//! Index     := SignedInt
//! FilterList:= Field '=' Literal (',' Field '=' Literal)*
//! ```
//!
//! Evaluation is dynamic (entity-type-tagged dispatch), unlike the rest of
//! the graph, per the design notes: this is exactly where a strictly typed
//! implementation is expected to fall back to runtime lookup.

use std::rc::Rc;

use crate::error::QueryError;
use crate::graph::entities::*;
use crate::graph::store::{AnyEntity, Store};

#[derive(Debug, Clone)]
pub enum Prefix {
    Root,
    Marker(Marker),
}

#[derive(Debug, Clone)]
pub enum Marker {
    Debugger,
    Session,
    Thread,
    Frame,
    FrameOffset(i64),
}

#[derive(Debug, Clone)]
pub struct Filter {
    pub field: String,
    pub value: String,
}

#[derive(Debug, Clone)]
pub struct Segment {
    pub edge: String,
    pub key: Option<String>,
    pub filters: Vec<Filter>,
    pub index: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct Url {
    pub prefix: Prefix,
    pub segments: Vec<Segment>,
}

impl Url {
    pub fn parse(s: &str) -> Result<Url, QueryError> {
        let mut chars = s.char_indices().peekable();
        let prefix;
        let rest_start;

        if s.starts_with('@') {
            let end = s.find('/').unwrap_or(s.len());
            let marker_str = &s[1..end];
            prefix = Prefix::Marker(parse_marker(marker_str)?);
            rest_start = end;
        } else if let Some(stripped) = s.strip_prefix('/') {
            let _ = stripped;
            prefix = Prefix::Root;
            rest_start = 1;
        } else {
            prefix = Prefix::Root;
            rest_start = 0;
        }
        let _ = &mut chars;

        let rest = s.get(rest_start..).unwrap_or("");
        let rest = rest.strip_prefix('/').unwrap_or(rest);
        let mut segments = Vec::new();
        if !rest.is_empty() {
            for raw in rest.split('/') {
                segments.push(parse_segment(raw)?);
            }
        }
        Ok(Url { prefix, segments })
    }

    /// Re-renders a parsed URL to its canonical form (R2).
    pub fn render(&self) -> String {
        let mut out = match &self.prefix {
            Prefix::Root => String::from("/"),
            Prefix::Marker(Marker::Debugger) => String::from("@debugger"),
            Prefix::Marker(Marker::Session) => String::from("@session"),
            Prefix::Marker(Marker::Thread) => String::from("@thread"),
            Prefix::Marker(Marker::Frame) => String::from("@frame"),
            Prefix::Marker(Marker::FrameOffset(n)) => {
                format!("@frame{}{}", if *n >= 0 { "+" } else { "-" }, n.abs())
            }
        };
        if !matches!(self.prefix, Prefix::Root) && !self.segments.is_empty() {
            out.push('/');
        }
        let rendered_segments: Vec<String> = self.segments.iter().map(render_segment).collect();
        out.push_str(&rendered_segments.join("/"));
        out
    }
}

fn render_segment(seg: &Segment) -> String {
    let mut s = seg.edge.clone();
    if let Some(key) = &seg.key {
        s.push(':');
        s.push_str(key);
    }
    if !seg.filters.is_empty() {
        s.push('(');
        s.push_str(
            &seg.filters.iter().map(|f| format!("{}={}", f.field, f.value)).collect::<Vec<_>>().join(","),
        );
        s.push(')');
    }
    if let Some(idx) = seg.index {
        s.push_str(&format!("[{idx}]"));
    }
    s
}

fn parse_marker(s: &str) -> Result<Marker, QueryError> {
    match s {
        "debugger" => Ok(Marker::Debugger),
        "session" => Ok(Marker::Session),
        "thread" => Ok(Marker::Thread),
        "frame" => Ok(Marker::Frame),
        _ if s.starts_with("frame+") => {
            s[6..].parse().map(Marker::FrameOffset).map_err(|_| QueryError::UnknownMarker(s.to_string()))
        }
        _ if s.starts_with("frame-") => {
            s[6..].parse::<i64>().map(|n| Marker::FrameOffset(-n)).map_err(|_| QueryError::UnknownMarker(s.to_string()))
        }
        other => Err(QueryError::UnknownMarker(other.to_string())),
    }
}

fn parse_segment(raw: &str) -> Result<Segment, QueryError> {
    let mut rest = raw;
    let mut index = None;
    if let Some(open) = rest.rfind('[') {
        if rest.ends_with(']') {
            let idx_str = &rest[open + 1..rest.len() - 1];
            index = Some(
                idx_str
                    .parse()
                    .map_err(|_| QueryError::MalformedUrl { col: open, msg: format!("bad index {idx_str:?}") })?,
            );
            rest = &rest[..open];
        }
    }
    let mut filters = Vec::new();
    if let Some(open) = rest.find('(') {
        if rest.ends_with(')') {
            let filter_str = &rest[open + 1..rest.len() - 1];
            for clause in filter_str.split(',') {
                let (field, value) = clause
                    .split_once('=')
                    .ok_or_else(|| QueryError::MalformedUrl { col: open, msg: format!("bad filter {clause:?}") })?;
                filters.push(Filter { field: field.to_string(), value: value.to_string() });
            }
            rest = &rest[..open];
        }
    }
    let (edge, key) = match rest.split_once(':') {
        Some((e, k)) => (e.to_string(), Some(k.to_string())),
        None => (rest.to_string(), None),
    };
    if edge.is_empty() {
        return Err(QueryError::MalformedUrl { col: 0, msg: "empty edge name".into() });
    }
    Ok(Segment { edge, key, filters, index })
}

/// Derived focus observables: resolving a focused URL up/down the
/// canonical hierarchy to the requested entity type (§4.7 "Focus/
/// context").
pub struct Context<'s> {
    store: &'s Store,
}

impl<'s> Context<'s> {
    pub fn new(store: &'s Store) -> Self {
        Self { store }
    }

    pub fn session(&self) -> Option<Ref<Session>> {
        let url = self.store.focused_url.get();
        let results = query(self.store, &url).ok()?;
        results.into_iter().find_map(as_session_ancestor)
    }

    pub fn thread(&self) -> Option<Ref<Thread>> {
        let url = self.store.focused_url.get();
        let results = query(self.store, &url).ok()?;
        results.into_iter().find_map(as_thread_ancestor)
    }

    pub fn frame(&self) -> Option<Ref<Frame>> {
        let url = self.store.focused_url.get();
        let results = query(self.store, &url).ok()?;
        results.into_iter().find_map(as_frame_ancestor)
    }
}

fn as_session_ancestor(e: AnyEntity) -> Option<Ref<Session>> {
    match e {
        AnyEntity::Session(s) => Some(s),
        AnyEntity::Thread(t) => t.borrow().session.upgrade(),
        AnyEntity::Stack(s) => s.borrow().thread.upgrade().and_then(|t| t.borrow().session.upgrade()),
        AnyEntity::Frame(f) => {
            f.borrow().stack.upgrade().and_then(|s| s.borrow().thread.upgrade()).and_then(|t| t.borrow().session.upgrade())
        }
        _ => None,
    }
}

fn as_thread_ancestor(e: AnyEntity) -> Option<Ref<Thread>> {
    match e {
        AnyEntity::Thread(t) => Some(t),
        AnyEntity::Stack(s) => s.borrow().thread.upgrade(),
        AnyEntity::Frame(f) => f.borrow().stack.upgrade().and_then(|s| s.borrow().thread.upgrade()),
        _ => None,
    }
}

fn as_frame_ancestor(e: AnyEntity) -> Option<Ref<Frame>> {
    match e {
        AnyEntity::Frame(f) => Some(f),
        _ => None,
    }
}

/// Materialises `url` once against `store`, returning the resulting
/// sequence of entities (possibly empty, possibly singleton) (§4.7
/// `query`).
pub fn query(store: &Store, url: &str) -> Result<Vec<AnyEntity>, QueryError> {
    let parsed = Url::parse(url)?;
    let mut current: Vec<AnyEntity> = vec![root_for(store, &parsed.prefix)?];
    for seg in &parsed.segments {
        current = step(store, &current, seg)?;
    }
    Ok(current)
}

fn root_for(store: &Store, prefix: &Prefix) -> Result<AnyEntity, QueryError> {
    match prefix {
        Prefix::Root => Ok(store.as_any_entity()),
        Prefix::Marker(Marker::Debugger) => Ok(store.as_any_entity()),
        Prefix::Marker(Marker::Session) => {
            let ctx = Context::new(store);
            ctx.session().map(AnyEntity::Session).ok_or_else(|| QueryError::UnknownMarker("session".into()))
        }
        Prefix::Marker(Marker::Thread) => {
            let ctx = Context::new(store);
            ctx.thread().map(AnyEntity::Thread).ok_or_else(|| QueryError::UnknownMarker("thread".into()))
        }
        Prefix::Marker(Marker::Frame) | Prefix::Marker(Marker::FrameOffset(_)) => {
            let ctx = Context::new(store);
            let offset = match prefix {
                Prefix::Marker(Marker::FrameOffset(n)) => *n,
                _ => 0,
            };
            let frame = ctx.frame().ok_or_else(|| QueryError::UnknownMarker("frame".into()))?;
            Ok(AnyEntity::Frame(offset_frame(&frame, offset)))
        }
    }
}

fn offset_frame(frame: &Ref<Frame>, offset: i64) -> Ref<Frame> {
    if offset == 0 {
        return frame.clone();
    }
    let Some(stack) = frame.borrow().stack.upgrade() else {
        return frame.clone();
    };
    let siblings = stack.borrow().frames.snapshot();
    let Some(pos) = siblings.iter().position(|f| Rc::ptr_eq(f, frame)) else {
        return frame.clone();
    };
    let target = pos as i64 + offset;
    if target < 0 {
        return frame.clone();
    }
    siblings.get(target as usize).cloned().unwrap_or_else(|| frame.clone())
}

fn step(store: &Store, current: &[AnyEntity], seg: &Segment) -> Result<Vec<AnyEntity>, QueryError> {
    let mut out = Vec::new();
    for entity in current {
        out.extend(edge_of(store, entity, &seg.edge)?);
    }
    if let Some(key) = &seg.key {
        out.retain(|e| matches_key(e, key));
    }
    for filter in &seg.filters {
        out.retain(|e| matches_filter(e, filter));
    }
    if let Some(idx) = seg.index {
        let picked = if idx >= 0 {
            out.get(idx as usize).cloned()
        } else {
            let len = out.len() as i64;
            let real = len + idx;
            if real >= 0 { out.get(real as usize).cloned() } else { None }
        };
        out = picked.into_iter().collect();
    }
    Ok(out)
}

fn edge_of(store: &Store, entity: &AnyEntity, name: &str) -> Result<Vec<AnyEntity>, QueryError> {
    let unsupported = || QueryError::MalformedUrl { col: 0, msg: format!("no edge {name:?} on this entity") };
    Ok(match (entity, name) {
        (AnyEntity::Debugger(_), "sessions") => store.sessions.snapshot().into_iter().map(AnyEntity::Session).collect(),
        (AnyEntity::Debugger(_), "sources") => store.sources.snapshot().into_iter().map(AnyEntity::Source).collect(),
        (AnyEntity::Session(s), "children") => s.borrow().children.snapshot().into_iter().map(AnyEntity::Session).collect(),
        (AnyEntity::Session(s), "threads") => s.borrow().threads.snapshot().into_iter().map(AnyEntity::Thread).collect(),
        (AnyEntity::Session(s), "sourceBindings") => {
            s.borrow().source_bindings.snapshot().into_iter().map(AnyEntity::SourceBinding).collect()
        }
        (AnyEntity::Session(s), "outputs") => s.borrow().outputs.snapshot().into_iter().map(AnyEntity::Output).collect(),
        (AnyEntity::Session(s), "exceptionFilters") => {
            s.borrow().exception_filters.snapshot().into_iter().map(AnyEntity::ExceptionFilter).collect()
        }
        (AnyEntity::Thread(t), "stacks") => t.borrow().stacks.snapshot().into_iter().map(AnyEntity::Stack).collect(),
        (AnyEntity::Stack(st), "frames") => st.borrow().frames.snapshot().into_iter().map(AnyEntity::Frame).collect(),
        (AnyEntity::Frame(f), "scopes") => f.borrow().scopes.snapshot().into_iter().map(AnyEntity::VarScope).collect(),
        (AnyEntity::VarScope(sc), "variables") => sc.borrow().variables.snapshot().into_iter().map(AnyEntity::Variable).collect(),
        (AnyEntity::Variable(v), "children") => v.borrow().children.snapshot().into_iter().map(AnyEntity::Variable).collect(),
        (AnyEntity::Source(src), "breakpoints") => src.borrow().breakpoints.snapshot().into_iter().map(AnyEntity::Breakpoint).collect(),
        (AnyEntity::Source(src), "bindings") => src.borrow().bindings.snapshot().into_iter().map(AnyEntity::SourceBinding).collect(),
        (AnyEntity::Breakpoint(bp), "bindings") => bp.borrow().bindings.snapshot().into_iter().map(AnyEntity::BreakpointBinding).collect(),
        _ => return Err(unsupported()),
    })
}

fn matches_key(entity: &AnyEntity, key: &str) -> bool {
    match entity {
        AnyEntity::Session(s) => s.borrow().id == key,
        AnyEntity::Thread(t) => t.borrow().id.to_string() == key,
        AnyEntity::Source(s) => s.borrow().key == key,
        AnyEntity::VarScope(sc) => sc.borrow().name.get() == key,
        AnyEntity::Variable(v) => v.borrow().name.get() == key,
        AnyEntity::ExceptionFilter(f) => f.borrow().filter_id == key,
        _ => false,
    }
}

fn matches_filter(entity: &AnyEntity, filter: &Filter) -> bool {
    let rendered = field_value(entity, &filter.field);
    rendered.as_deref() == Some(filter.value.as_str())
}

fn field_value(entity: &AnyEntity, field: &str) -> Option<String> {
    match (entity, field) {
        (AnyEntity::Thread(t), "state") => Some(
            match t.borrow().state.get() {
                ThreadState::Running => "running",
                ThreadState::Stopped => "stopped",
                ThreadState::Exited => "exited",
            }
            .to_string(),
        ),
        (AnyEntity::Thread(t), "name") => Some(t.borrow().name.get()),
        (AnyEntity::Thread(t), "focused") => Some(t.borrow().focused.get().to_string()),
        (AnyEntity::Session(s), "state") => Some(
            match s.borrow().state.get() {
                SessionState::Starting => "starting",
                SessionState::Running => "running",
                SessionState::Stopped => "stopped",
                SessionState::Terminated => "terminated",
            }
            .to_string(),
        ),
        (AnyEntity::Stack(s), "is_current") => Some(s.borrow().is_current.get().to_string()),
        (AnyEntity::Frame(f), "active") => Some(f.borrow().active.get().to_string()),
        (AnyEntity::Breakpoint(b), "enabled") => Some(b.borrow().enabled.get().to_string()),
        (AnyEntity::BreakpointBinding(b), "verified") => Some(b.borrow().verified.get().to_string()),
        (AnyEntity::BreakpointBinding(b), "hit") => Some(b.borrow().hit.get().to_string()),
        (AnyEntity::Output(o), "category") => Some(
            match o.borrow().category {
                OutputCategory::Stdout => "stdout",
                OutputCategory::Stderr => "stderr",
                OutputCategory::Console => "console",
                OutputCategory::Important => "important",
                OutputCategory::Telemetry => "telemetry",
            }
            .to_string(),
        ),
        _ => None,
    }
}

/// `resolve(str)` (§4.7): auto-detects URI vs. URL and dispatches
/// accordingly, returning a sequence either way (a URI resolves to at most
/// one entity).
pub fn resolve(store: &Store, s: &str) -> Result<Vec<AnyEntity>, QueryError> {
    if crate::identity::Uri::looks_like_uri(s) {
        let _ = crate::identity::Uri::parse(s)?;
        return Ok(store_resolve_uri(store, s).into_iter().collect());
    }
    query(store, s)
}

fn store_resolve_uri(store: &Store, uri: &str) -> Option<AnyEntity> {
    store.resolve(uri).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_filter_and_index_segment() {
        let url = Url::parse("/sessions:xotat/threads(state=stopped)[0]").unwrap();
        assert_eq!(url.segments.len(), 2);
        assert_eq!(url.segments[0].edge, "sessions");
        assert_eq!(url.segments[0].key.as_deref(), Some("xotat"));
        assert_eq!(url.segments[1].edge, "threads");
        assert_eq!(url.segments[1].filters[0].field, "state");
        assert_eq!(url.segments[1].index, Some(0));
    }

    #[test]
    fn render_round_trips_canonical_form() {
        let url = Url::parse("/sessions:xotat/threads(state=stopped)[0]").unwrap();
        assert_eq!(url.render(), "/sessions:xotat/threads(state=stopped)[0]");
    }

    #[test]
    fn negative_index_counts_from_end() {
        let url = Url::parse("/sessions/threads[-1]").unwrap();
        assert_eq!(url.segments[1].index, Some(-1));
    }
}
