//! The reactive entity graph (C6): signals, edges, rollups, entities, and
//! the indexed store that ties them to stable URIs.

pub mod edge;
pub mod entities;
pub mod rollup;
pub mod signal;
pub mod store;

pub use edge::{Edge, Order};
pub use entities::*;
pub use rollup::Rollup;
pub use signal::Signal;
pub use store::{AnyEntity, Store};
