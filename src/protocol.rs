//! DAP wire message types and the request/response/event client (C3).
//!
//! Message shapes mirror `perl-dap::protocol` field-for-field (so adapters
//! speaking real DAP don't notice the difference), but the client itself is
//! new: where the teacher is the *adapter* side synchronously answering
//! requests, this is the *client* side, correlating outgoing requests with
//! their eventual responses, dispatching events to ordered handlers, and
//! answering reverse-requests the adapter sends back (§4.3).

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{DapError, DapResult};
use crate::task::{Mutex as TaskMutex, TaskHandle};
use crate::transport::{Transport, TransportWriter};

/// Default per-request timeout (§4.3), overridable per call.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub seq: i64,
    #[serde(rename = "type")]
    pub msg_type: String,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub seq: i64,
    #[serde(rename = "type")]
    pub msg_type: String,
    pub request_seq: i64,
    pub success: bool,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub seq: i64,
    #[serde(rename = "type")]
    pub msg_type: String,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// A decoded incoming frame, tagged by its `type` field (§4.1). A `Request`
/// arriving on this side of the wire is always a *reverse* request — the
/// adapter asking the client to do something (e.g. `startDebugging`).
pub enum Incoming {
    Response(Response),
    Event(Event),
    ReverseRequest(Request),
}

impl Incoming {
    fn from_value(value: Value) -> DapResult<Incoming> {
        let msg_type = value.get("type").and_then(Value::as_str).ok_or_else(|| DapError::Protocol("message missing type".into()))?;
        match msg_type {
            "response" => Ok(Incoming::Response(serde_json::from_value(value).map_err(|e| DapError::Protocol(e.to_string()))?)),
            "event" => Ok(Incoming::Event(serde_json::from_value(value).map_err(|e| DapError::Protocol(e.to_string()))?)),
            "request" => Ok(Incoming::ReverseRequest(serde_json::from_value(value).map_err(|e| DapError::Protocol(e.to_string()))?)),
            other => Err(DapError::Protocol(format!("unknown message type {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supports_configuration_done_request: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supports_conditional_breakpoints: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supports_hit_conditional_breakpoints: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supports_log_points: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supports_set_variable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supports_set_expression: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supports_terminate_request: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supports_restart_request: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supports_exception_info_request: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supports_start_debugging_request: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception_breakpoint_filters: Option<Vec<ExceptionBreakpointFilter>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionBreakpointFilter {
    pub filter: String,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supports_condition: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeRequestArguments {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    pub adapter_id: String,
    pub lines_start_at1: bool,
    pub columns_start_at1: bool,
    pub path_format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRef {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_reference: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceBreakpoint {
    pub line: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hit_condition: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetBreakpointsArguments {
    pub source: SourceRef,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breakpoints: Option<Vec<SourceBreakpoint>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireBreakpoint {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetBreakpointsResponseBody {
    pub breakpoints: Vec<WireBreakpoint>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetExceptionBreakpointsArguments {
    pub filters: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter_options: Option<Vec<ExceptionFilterOptions>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionFilterOptions {
    pub filter_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionInfoArguments {
    pub thread_id: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadScopedArguments {
    pub thread_id: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StackTraceArguments {
    pub thread_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_frame: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub levels: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireStackFrame {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub source: Option<SourceRef>,
    pub line: i64,
    pub column: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presentation_hint: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackTraceResponseBody {
    pub stack_frames: Vec<WireStackFrame>,
    #[serde(default)]
    pub total_frames: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopesArguments {
    pub frame_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireScope {
    pub name: String,
    #[serde(default)]
    pub presentation_hint: Option<String>,
    pub variables_reference: i64,
    #[serde(default)]
    pub expensive: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopesResponseBody {
    pub scopes: Vec<WireScope>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VariablesArguments {
    pub variables_reference: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireVariable {
    pub name: String,
    pub value: String,
    #[serde(default)]
    #[serde(rename = "type")]
    pub type_annotation: Option<String>,
    #[serde(default)]
    pub evaluate_name: Option<String>,
    #[serde(default)]
    pub variables_reference: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariablesResponseBody {
    pub variables: Vec<WireVariable>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetVariableArguments {
    pub variables_reference: i64,
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetVariableResponseBody {
    pub value: String,
    #[serde(default)]
    pub variables_reference: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetExpressionArguments {
    pub expression: String,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_id: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetExpressionResponseBody {
    pub value: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateArguments {
    pub expression: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateResponseBody {
    pub result: String,
    #[serde(default)]
    #[serde(rename = "type")]
    pub type_annotation: Option<String>,
    #[serde(default)]
    pub variables_reference: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionInfoResponseBody {
    pub exception_id: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub break_mode: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireThread {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadsResponseBody {
    pub threads: Vec<WireThread>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoppedEventBody {
    pub reason: String,
    #[serde(default)]
    pub thread_id: Option<i64>,
    #[serde(default)]
    pub all_threads_stopped: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinuedEventBody {
    pub thread_id: i64,
    #[serde(default)]
    pub all_threads_continued: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadEventBody {
    pub reason: String,
    pub thread_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputEventBody {
    #[serde(default)]
    pub category: Option<String>,
    pub output: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitedEventBody {
    pub exit_code: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminatedEventBody {
    #[serde(default)]
    pub restart: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakpointEventBody {
    pub reason: String,
    pub breakpoint: WireBreakpoint,
}

/// Arguments the adapter sends back on the `startDebugging` reverse-request
/// (§4.8 hierarchical sessions).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartDebuggingRequestArguments {
    pub configuration: Value,
    pub request: String,
}

type PendingMap = Rc<RefCell<HashMap<i64, oneshot::Sender<Response>>>>;
type EventHandler = Box<dyn Fn(&Event)>;
/// Returns `Some(body-or-error)` if this handler claims the reverse
/// request; `None` lets the next handler try, falling through to a
/// "not supported" error response if none claim it.
type ReverseHandler = Box<dyn Fn(&Request) -> Option<Result<Value, String>>>;

/// Correlates requests with responses, dispatches events to ordered
/// handlers, and answers reverse-requests (§4.3).
pub struct ProtocolClient {
    writer: RefCell<TransportWriter>,
    /// Serialises every write to `writer`: a `RefCell` borrow on the writer
    /// is held across its own `.await`, which is only sound if no other
    /// task can attempt a concurrent borrow — this mutex is what guarantees
    /// that, since outgoing requests and reverse-request replies both go
    /// through it before ever touching `writer`.
    write_lock: TaskMutex,
    next_seq: Cell<i64>,
    pending: PendingMap,
    event_handlers: RefCell<Vec<EventHandler>>,
    reverse_handlers: RefCell<Vec<ReverseHandler>>,
    default_timeout: Cell<Duration>,
    read_loop: RefCell<Option<TaskHandle<()>>>,
}

impl ProtocolClient {
    /// Splits `transport`, spawns the background read loop on the current
    /// `LocalSet`, and returns the client.
    pub fn start(transport: Transport) -> Rc<ProtocolClient> {
        let (mut reader, writer) = transport.split();
        let client = Rc::new(ProtocolClient {
            writer: RefCell::new(writer),
            write_lock: TaskMutex::new(),
            next_seq: Cell::new(1),
            pending: Rc::new(RefCell::new(HashMap::new())),
            event_handlers: RefCell::new(Vec::new()),
            reverse_handlers: RefCell::new(Vec::new()),
            default_timeout: Cell::new(DEFAULT_REQUEST_TIMEOUT),
            read_loop: RefCell::new(None),
        });

        let loop_client = client.clone();
        let handle = crate::task::spawn(
            async move {
                loop {
                    match reader.recv().await {
                        Ok(Some(value)) => loop_client.dispatch(value).await,
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!("transport read loop ending: {e}");
                            break;
                        }
                    }
                }
                loop_client.fail_all_pending();
            },
            None,
        );
        *client.read_loop.borrow_mut() = Some(handle);

        client
    }

    /// Stops the read loop and closes the write half; pending requests fail
    /// with `TransportClosed` (§4.8 session termination).
    pub async fn shutdown(&self) {
        if let Some(handle) = self.read_loop.borrow_mut().take() {
            handle.cancel();
        }
        self.fail_all_pending();
        let _permit = self.write_lock.lock().await;
        self.writer.borrow_mut().close().await;
    }

    pub fn set_default_timeout(&self, timeout: Duration) {
        self.default_timeout.set(timeout);
    }

    pub fn on_event(&self, handler: impl Fn(&Event) + 'static) {
        self.event_handlers.borrow_mut().push(Box::new(handler));
    }

    /// Registers a reverse-request handler; the first handler to return
    /// `Some` wins. With no claiming handler, the reverse request is
    /// answered with `success: false` (§4.3 "not supported" fallback).
    pub fn on_reverse_request(&self, handler: impl Fn(&Request) -> Option<Result<Value, String>> + 'static) {
        self.reverse_handlers.borrow_mut().push(Box::new(handler));
    }

    async fn dispatch(&self, value: Value) {
        let incoming = match Incoming::from_value(value) {
            Ok(i) => i,
            Err(e) => {
                tracing::warn!("dropping malformed message: {e}");
                return;
            }
        };
        match incoming {
            Incoming::Response(resp) => {
                if let Some(tx) = self.pending.borrow_mut().remove(&resp.request_seq) {
                    let _ = tx.send(resp);
                }
            }
            Incoming::Event(event) => {
                for handler in self.event_handlers.borrow().iter() {
                    handler(&event);
                }
            }
            Incoming::ReverseRequest(req) => self.answer_reverse_request(req).await,
        }
    }

    async fn answer_reverse_request(&self, req: Request) {
        let outcome = self.reverse_handlers.borrow().iter().find_map(|h| h(&req));
        let (success, body, message) = match outcome {
            Some(Ok(body)) => (true, Some(body), None),
            Some(Err(msg)) => (false, None, Some(msg)),
            None => (false, None, Some(format!("unsupported reverse request: {}", req.command))),
        };
        let seq = self.allocate_seq();
        let response = Response {
            seq,
            msg_type: "response".into(),
            request_seq: req.seq,
            success,
            command: req.command,
            message,
            body,
        };
        let value = match serde_json::to_value(&response) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("failed to encode reverse-request response: {e}");
                return;
            }
        };
        let _permit = self.write_lock.lock().await;
        if let Err(e) = self.writer.borrow_mut().send(&value).await {
            tracing::warn!("failed to send reverse-request response: {e}");
        }
    }

    fn allocate_seq(&self) -> i64 {
        let seq = self.next_seq.get();
        self.next_seq.set(seq + 1);
        seq
    }

    /// Drops every pending response sender, failing the corresponding
    /// `request()` calls with `TransportClosed`.
    fn fail_all_pending(&self) {
        self.pending.borrow_mut().clear();
    }

    /// Sends `command`/`arguments` and awaits the matching response, bounded
    /// by `timeout` (or the client's default). Does not decode `body`;
    /// callers deserialize into the response shape they expect.
    pub async fn request(&self, command: &str, arguments: Option<Value>, timeout: Option<Duration>) -> DapResult<Response> {
        let seq = self.allocate_seq();
        let request = Request { seq, msg_type: "request".into(), command: command.to_string(), arguments };
        let (tx, rx) = oneshot::channel();
        self.pending.borrow_mut().insert(seq, tx);

        let value = serde_json::to_value(&request).map_err(|e| DapError::Protocol(e.to_string()))?;
        {
            let _permit = self.write_lock.lock().await;
            if let Err(e) = self.writer.borrow_mut().send(&value).await {
                self.pending.borrow_mut().remove(&seq);
                return Err(e);
            }
        }

        let wait = timeout.unwrap_or_else(|| self.default_timeout.get());
        let response = match tokio::time::timeout(wait, rx).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(_)) => return Err(DapError::TransportClosed),
            Err(_) => {
                self.pending.borrow_mut().remove(&seq);
                return Err(DapError::RequestTimeout { command: command.to_string() });
            }
        };

        if !response.success {
            return Err(DapError::Adapter {
                command: command.to_string(),
                message: response.message.clone().unwrap_or_else(|| "request failed".into()),
            });
        }
        Ok(response)
    }

    /// `request` plus strongly-typed decode of `body` (§4.3 typed request
    /// helpers used by the bridge).
    pub async fn request_typed<A: Serialize, B: for<'de> Deserialize<'de>>(
        &self,
        command: &str,
        arguments: A,
        timeout: Option<Duration>,
    ) -> DapResult<B> {
        let args = serde_json::to_value(arguments).map_err(|e| DapError::Protocol(e.to_string()))?;
        let response = self.request(command, Some(args), timeout).await?;
        let body = response.body.unwrap_or(Value::Null);
        serde_json::from_value(body).map_err(|e| DapError::Protocol(e.to_string()))
    }

    pub async fn request_no_body(&self, command: &str, arguments: Option<Value>, timeout: Option<Duration>) -> DapResult<()> {
        self.request(command, arguments, timeout).await.map(|_| ())
    }
}
