//! A single-threaded, reactive client runtime for the Debug Adapter
//! Protocol (DAP).
//!
//! A [`Debugger`] owns zero or more debug sessions, each backed by its own
//! [`bridge::SessionRuntime`], and exposes them as a graph of observable
//! entities (threads, stacks, frames, scopes, variables, breakpoints)
//! addressable by stable URI ([`identity`]) or by a small query language
//! ([`query`]). Everything runs on one `tokio::task::LocalSet` ([`task`]):
//! there is no `Send`/`Sync` traffic between sessions, only cooperative
//! `spawn_local` tasks coordinated through the entity graph's own signals
//! and rollups ([`graph`]).
//!
//! The wire protocol itself is layered bottom-up: [`codec`] frames bytes,
//! [`transport`] moves framed bytes to and from an adapter process or
//! socket, [`protocol`] turns that into typed DAP requests/responses/events,
//! and [`bridge`] projects protocol events onto the entity graph. Consumers
//! normally only need [`Debugger`] and the graph types it returns.

pub mod breakpoints;
pub mod bridge;
pub mod codec;
pub mod config;
pub mod debugger;
pub mod error;
pub mod eval_guard;
pub mod graph;
pub mod hooks;
pub mod id;
pub mod identity;
pub mod protocol;
pub mod query;
pub mod scope;
pub mod session;
pub mod stack_classify;
pub mod task;
pub mod transport;
pub mod variable_render;

pub use debugger::{BreakpointOptions, BreakpointSpec, Context, Debugger};
pub use error::{DapError, DapResult};
pub use graph::{AnyEntity, Edge, Order, Rollup, Signal, Store};
pub use identity::Uri;
