//! Error taxonomy (§7).
//!
//! Every public error type is a `thiserror` enum so callers can match on
//! cause rather than parse a message string. Call chains are recorded as a
//! stack of `(method, entity uri)` frames, pushed from innermost to
//! outermost as an error unwinds through entity methods and the bridge.

use std::fmt;

/// One frame of the logical call chain that produced a [`DapError`].
#[derive(Debug, Clone)]
pub struct Frame {
    pub method: String,
    pub entity: Option<String>,
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.entity {
            Some(uri) => write!(f, "{}({})", self.method, uri),
            None => write!(f, "{}", self.method),
        }
    }
}

/// The closed error taxonomy described in §7 of the specification.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DapError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("transport closed")]
    TransportClosed,

    #[error("adapter rejected {command}: {message}")]
    Adapter { command: String, message: String },

    #[error("request {command} timed out")]
    RequestTimeout { command: String },

    #[error("cancelled")]
    Cancelled,

    #[error("schema error: {0}")]
    Schema(String),

    #[error("operation attempted on deleted entity {uri}")]
    DeletedEntity { uri: String },

    #[error("capability {capability} not supported by adapter ({context})")]
    Capability { capability: String, context: String },

    #[error("invalid adapter configuration: {0}")]
    Configuration(String),

    #[error("{source}\n  while: {}", render_chain(chain))]
    WithChain {
        #[source]
        source: Box<DapError>,
        chain: Vec<Frame>,
    },
}

fn render_chain(chain: &[Frame]) -> String {
    chain
        .iter()
        .rev()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join(" <- ")
}

impl DapError {
    /// Pushes an enclosing call frame onto this error, building up the
    /// logical call path across cooperative suspensions (§7, "Propagation
    /// policy").
    pub fn with_frame(self, method: impl Into<String>, entity: Option<String>) -> Self {
        let frame = Frame { method: method.into(), entity };
        match self {
            DapError::WithChain { source, mut chain } => {
                chain.push(frame);
                DapError::WithChain { source, chain }
            }
            other => DapError::WithChain { source: Box::new(other), chain: vec![frame] },
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, DapError::Cancelled)
            || matches!(self, DapError::WithChain { source, .. } if source.is_cancelled())
    }
}

pub type DapResult<T> = Result<T, DapError>;

/// Errors raised by the graph store (C6) itself, distinct from protocol
/// errors because they indicate programmer misuse rather than adapter
/// behaviour.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("no entity with uri {0}")]
    NotFound(String),
    #[error("edge {edge} does not accept target type {target_type}")]
    WrongTargetType { edge: String, target_type: String },
    #[error("entity {0} has been deleted")]
    Deleted(String),
}

impl From<GraphError> for DapError {
    fn from(e: GraphError) -> Self {
        match e {
            GraphError::Deleted(uri) => DapError::DeletedEntity { uri },
            other => DapError::Schema(other.to_string()),
        }
    }
}

/// Errors raised while decoding/encoding the wire format (C1).
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("malformed frame header: {0}")]
    MalformedHeader(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("transport closed")]
    Closed,
}

impl From<TransportError> for DapError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Closed => DapError::TransportClosed,
            other => DapError::Protocol(other.to_string()),
        }
    }
}

/// Errors raised by the URI/URL query layer (C7).
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("malformed uri: {0}")]
    MalformedUri(String),
    #[error("malformed url at column {col}: {msg}")]
    MalformedUrl { col: usize, msg: String },
    #[error("unknown marker @{0}")]
    UnknownMarker(String),
}

impl From<QueryError> for DapError {
    fn from(e: QueryError) -> Self {
        DapError::Schema(e.to_string())
    }
}
