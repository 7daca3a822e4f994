//! Stable entity URIs (C7, §4.7).
//!
//! Canonical grammar: `type:component(:component)*`. Builders here are the
//! single source of truth for how a URI is assembled; `resolve` (on
//! [`crate::graph::Store`]) is the single source of truth for how it's
//! looked up, so the round-trip law R1 (`build(..).parse() == (type,
//! components)`) holds by construction rather than by convention.

use crate::error::QueryError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Uri {
    Debugger,
    Session { session_id: String },
    Thread { session_id: String, thread_id: i64 },
    Stack { session_id: String, thread_id: i64, stack_index: u32 },
    Frame { session_id: String, frame_id: i64, seq: u64 },
    Scope { session_id: String, frame_id: i64, seq: u64, scope_name: String },
    Variable { session_id: String, variables_reference: i64, name: String },
    Source { source_key: String },
    SourceBinding { session_id: String, source_key: String },
    Breakpoint { source_path: String, line: i64, column: Option<i64> },
    BreakpointBinding { session_id: String, source_path: String, line: i64, column: Option<i64> },
    Output { session_id: String, sequence: u64 },
    ExceptionFilter { session_id: String, filter_id: String },
}

fn join(parts: &[&str]) -> String {
    parts.join(":")
}

fn col_component(column: Option<i64>) -> String {
    match column {
        Some(c) => c.to_string(),
        None => "_".to_string(),
    }
}

fn parse_col_component(s: &str) -> Option<i64> {
    if s == "_" {
        None
    } else {
        s.parse().ok()
    }
}

impl Uri {
    pub fn render(&self) -> String {
        match self {
            Uri::Debugger => "debugger".to_string(),
            Uri::Session { session_id } => join(&["session", session_id]),
            Uri::Thread { session_id, thread_id } => join(&["thread", session_id, &thread_id.to_string()]),
            Uri::Stack { session_id, thread_id, stack_index } => {
                join(&["stack", session_id, &thread_id.to_string(), &stack_index.to_string()])
            }
            Uri::Frame { session_id, frame_id, seq } => join(&["frame", session_id, &frame_id.to_string(), &seq.to_string()]),
            Uri::Scope { session_id, frame_id, seq, scope_name } => {
                join(&["scope", session_id, &frame_id.to_string(), &seq.to_string(), scope_name])
            }
            Uri::Variable { session_id, variables_reference, name } => {
                join(&["variable", session_id, &variables_reference.to_string(), name])
            }
            Uri::Source { source_key } => join(&["source", source_key]),
            Uri::SourceBinding { session_id, source_key } => join(&["sourcebinding", session_id, source_key]),
            Uri::Breakpoint { source_path, line, column } => {
                join(&["breakpoint", source_path, &line.to_string(), &col_component(*column)])
            }
            Uri::BreakpointBinding { session_id, source_path, line, column } => {
                join(&["bpbinding", session_id, source_path, &line.to_string(), &col_component(*column)])
            }
            Uri::Output { session_id, sequence } => join(&["output", session_id, &sequence.to_string()]),
            Uri::ExceptionFilter { session_id, filter_id } => join(&["exceptionfilter", session_id, filter_id]),
        }
    }

    pub fn parse(s: &str) -> Result<Uri, QueryError> {
        let parts: Vec<&str> = s.split(':').collect();
        let err = || QueryError::MalformedUri(s.to_string());
        match parts.as_slice() {
            ["debugger"] => Ok(Uri::Debugger),
            ["session", id] => Ok(Uri::Session { session_id: id.to_string() }),
            ["thread", sid, tid] => Ok(Uri::Thread {
                session_id: sid.to_string(),
                thread_id: tid.parse().map_err(|_| err())?,
            }),
            ["stack", sid, tid, idx] => Ok(Uri::Stack {
                session_id: sid.to_string(),
                thread_id: tid.parse().map_err(|_| err())?,
                stack_index: idx.parse().map_err(|_| err())?,
            }),
            ["frame", sid, fid, seq] => Ok(Uri::Frame {
                session_id: sid.to_string(),
                frame_id: fid.parse().map_err(|_| err())?,
                seq: seq.parse().map_err(|_| err())?,
            }),
            ["scope", sid, fid, seq, name] => Ok(Uri::Scope {
                session_id: sid.to_string(),
                frame_id: fid.parse().map_err(|_| err())?,
                seq: seq.parse().map_err(|_| err())?,
                scope_name: name.to_string(),
            }),
            ["variable", sid, vref, name] => Ok(Uri::Variable {
                session_id: sid.to_string(),
                variables_reference: vref.parse().map_err(|_| err())?,
                name: name.to_string(),
            }),
            ["source", key] => Ok(Uri::Source { source_key: key.to_string() }),
            ["sourcebinding", sid, key] => {
                Ok(Uri::SourceBinding { session_id: sid.to_string(), source_key: key.to_string() })
            }
            ["breakpoint", path, line, col] => Ok(Uri::Breakpoint {
                source_path: path.to_string(),
                line: line.parse().map_err(|_| err())?,
                column: parse_col_component(col),
            }),
            ["bpbinding", sid, path, line, col] => Ok(Uri::BreakpointBinding {
                session_id: sid.to_string(),
                source_path: path.to_string(),
                line: line.parse().map_err(|_| err())?,
                column: parse_col_component(col),
            }),
            ["output", sid, seq] => {
                Ok(Uri::Output { session_id: sid.to_string(), sequence: seq.parse().map_err(|_| err())? })
            }
            ["exceptionfilter", sid, fid] => {
                Ok(Uri::ExceptionFilter { session_id: sid.to_string(), filter_id: fid.to_string() })
            }
            _ => Err(err()),
        }
    }

    /// True if `s` looks like a URI at all (starts with a known type tag),
    /// used by `resolve(str)` to auto-detect URI vs. URL (§4.7).
    pub fn looks_like_uri(s: &str) -> bool {
        const TAGS: &[&str] = &[
            "debugger",
            "session",
            "thread",
            "stack",
            "frame",
            "scope",
            "variable",
            "source",
            "sourcebinding",
            "breakpoint",
            "bpbinding",
            "output",
            "exceptionfilter",
        ];
        match s.split_once(':') {
            Some((tag, _)) => TAGS.contains(&tag),
            None => s == "debugger",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn round_trips_each_variant() {
        let cases = vec![
            Uri::Debugger,
            Uri::Session { session_id: "xotat".into() },
            Uri::Thread { session_id: "xotat".into(), thread_id: 7 },
            Uri::Stack { session_id: "xotat".into(), thread_id: 7, stack_index: 0 },
            Uri::Frame { session_id: "xotat".into(), frame_id: 3, seq: 1 },
            Uri::Scope { session_id: "xotat".into(), frame_id: 3, seq: 1, scope_name: "Locals".into() },
            Uri::Variable { session_id: "xotat".into(), variables_reference: 9, name: "x".into() },
            Uri::Source { source_key: "/x/hello.py".into() },
            Uri::SourceBinding { session_id: "xotat".into(), source_key: "/x/hello.py".into() },
            Uri::Breakpoint { source_path: "/x/hello.py".into(), line: 3, column: None },
            Uri::Breakpoint { source_path: "/x/hello.py".into(), line: 3, column: Some(5) },
            Uri::BreakpointBinding { session_id: "xotat".into(), source_path: "/x/hello.py".into(), line: 3, column: None },
            Uri::Output { session_id: "xotat".into(), sequence: 4 },
            Uri::ExceptionFilter { session_id: "xotat".into(), filter_id: "uncaught".into() },
        ];
        for uri in cases {
            let rendered = uri.render();
            let parsed = Uri::parse(&rendered).unwrap();
            assert_eq!(parsed, uri, "round-trip failed for {rendered}");
        }
    }

    #[test]
    fn looks_like_uri_detects_known_tags() {
        assert!(Uri::looks_like_uri("session:xotat"));
        assert!(Uri::looks_like_uri("debugger"));
        assert!(!Uri::looks_like_uri("/sessions:xotat/threads"));
    }

    proptest! {
        #[test]
        fn session_uri_round_trips_arbitrary_ids(id in "[a-z]{1,10}") {
            let uri = Uri::Session { session_id: id.clone() };
            prop_assert_eq!(Uri::parse(&uri.render()).unwrap(), uri);
        }

        #[test]
        fn breakpoint_uri_round_trips_arbitrary_lines(line in 0i64..100000, col in proptest::option::of(0i64..500)) {
            let uri = Uri::Breakpoint { source_path: "/a/b.py".into(), line, column: col };
            prop_assert_eq!(Uri::parse(&uri.render()).unwrap(), uri);
        }
    }
}
