//! Byte transports for the DAP wire format (C2).
//!
//! Three ways to reach an adapter are supported: spawn it as a child
//! process and talk over its stdio, connect directly to a TCP socket, or
//! spawn a server process and then connect to the port it opens. All three
//! reduce to the same `Box<dyn AsyncRead>` / `Box<dyn AsyncWrite>` pair
//! fed through the [`crate::codec`], grounded on `perl-dap`'s
//! `TcpAttachSession` framing (adapted here to tokio's async I/O instead of
//! the teacher's blocking `std::net`/`std::thread` version, to fit the
//! cooperative single-threaded runtime of [`crate::task`]).

use std::cell::Cell;
use std::net::SocketAddr;
use std::process::Stdio;
use std::rc::Rc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};

use crate::codec::{encode, Decoder};
use crate::error::{DapResult, TransportError};

/// Scans bytes observed on a spawned adapter's stdout for the port (and the
/// host to reach it on) the adapter ended up listening on (§4.2, §6's
/// `connect_condition`). Called with the full buffer accumulated so far on
/// every stdout read until it returns `Some`.
pub type PortDetector = dyn Fn(&[u8]) -> Option<(u16, String)>;

/// Minimum connection timeout accepted for TCP transports (§10.5).
pub const MIN_CONNECT_TIMEOUT_MS: u64 = 1;
/// Default TCP connect timeout, matching the teacher's `DEFAULT_TIMEOUT_MS`.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;
/// Maximum TCP connect timeout, matching the teacher's `MAX_TIMEOUT_MS`.
pub const MAX_CONNECT_TIMEOUT_MS: u64 = 300_000;

/// A framed duplex byte connection to a debug adapter.
///
/// Reads and writes are boxed trait objects rather than an enum over
/// stdio/TCP/mock variants: the three concrete sources differ only in how
/// they're constructed, never in how they're driven, so there's no
/// behavioural switch to preserve by keeping them as distinct types.
pub struct Transport {
    writer: Box<dyn AsyncWrite + Unpin>,
    reader: Box<dyn AsyncRead + Unpin>,
    decoder: Decoder,
    read_buf: [u8; 8192],
    closed: Rc<Cell<bool>>,
    /// Kept alive so the adapter process isn't reaped while still in use;
    /// killed on [`Transport::close`].
    child: Option<Child>,
}

/// The read half of a [`Transport`], produced by [`Transport::split`].
pub struct TransportReader {
    reader: Box<dyn AsyncRead + Unpin>,
    decoder: Decoder,
    read_buf: [u8; 8192],
    closed: Rc<Cell<bool>>,
}

/// The write half of a [`Transport`], produced by [`Transport::split`].
/// Owns the spawned child, if any, so closing the write side is what tears
/// the adapter process down.
pub struct TransportWriter {
    writer: Box<dyn AsyncWrite + Unpin>,
    closed: Rc<Cell<bool>>,
    child: Option<Child>,
}

impl Transport {
    fn new(
        reader: Box<dyn AsyncRead + Unpin>,
        writer: Box<dyn AsyncWrite + Unpin>,
        child: Option<Child>,
    ) -> Self {
        Self { writer, reader, decoder: Decoder::new(), read_buf: [0u8; 8192], closed: Rc::new(Cell::new(false)), child }
    }

    /// Splits into independent read/write halves so a read loop and
    /// outgoing request submission can run concurrently without fighting
    /// over `&mut self` (used by [`crate::protocol::ProtocolClient`]).
    pub fn split(self) -> (TransportReader, TransportWriter) {
        let closed = self.closed;
        (
            TransportReader { reader: self.reader, decoder: self.decoder, read_buf: self.read_buf, closed: closed.clone() },
            TransportWriter { writer: self.writer, closed, child: self.child },
        )
    }

    /// Spawns `command` and talks DAP over its stdin/stdout.
    pub async fn stdio(mut command: Command) -> DapResult<Transport> {
        command.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut child = command.spawn().map_err(TransportError::Io)?;
        let stdin = child.stdin.take().ok_or_else(|| TransportError::MalformedHeader("no stdin".into()))?;
        let stdout = child.stdout.take().ok_or_else(|| TransportError::MalformedHeader("no stdout".into()))?;
        if let Some(stderr) = child.stderr.take() {
            spawn_stderr_logger(stderr);
        }
        Ok(Transport::new(Box::new(stdout), Box::new(stdin), Some(child)))
    }

    /// Connects directly to `addr`, bounded by `connect_timeout` (clamped
    /// to `[MIN_CONNECT_TIMEOUT_MS, MAX_CONNECT_TIMEOUT_MS]`, default
    /// `DEFAULT_CONNECT_TIMEOUT_MS`; §10.5).
    pub async fn tcp(addr: SocketAddr, connect_timeout: Option<Duration>) -> DapResult<Transport> {
        let timeout = clamp_timeout(connect_timeout);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out")))?
            .map_err(TransportError::Io)?;
        stream.set_nodelay(true).map_err(TransportError::Io)?;
        let (read_half, write_half) = stream.into_split();
        Ok(Transport::new(Box::new(read_half), Box::new(write_half), None))
    }

    /// Spawns `command` (expected to announce a listening port on its
    /// stdout) and connects once `port_detector` recognises that
    /// announcement, retrying the connect itself until `connect_timeout`
    /// elapses. The "server" variant of attach: launch a long-running
    /// adapter process — e.g. `js-debug` binding an ephemeral port — rather
    /// than requiring the port to be known up front.
    pub async fn spawn_then_tcp(
        mut command: Command,
        port_detector: Rc<PortDetector>,
        connect_timeout: Option<Duration>,
    ) -> DapResult<Transport> {
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut child = command.spawn().map_err(TransportError::Io)?;
        let mut stdout = child.stdout.take().ok_or_else(|| TransportError::MalformedHeader("no stdout".into()))?;
        if let Some(stderr) = child.stderr.take() {
            spawn_stderr_logger(stderr);
        }
        let timeout = clamp_timeout(connect_timeout);
        let deadline = tokio::time::Instant::now() + timeout;

        let (port, host) = match scan_for_port(&mut stdout, &*port_detector, deadline).await {
            Ok(found) => found,
            Err(e) => {
                let _ = child.start_kill();
                return Err(e);
            }
        };
        spawn_stdout_drain(stdout);

        loop {
            match TcpStream::connect((host.as_str(), port)).await {
                Ok(stream) => {
                    stream.set_nodelay(true).map_err(TransportError::Io)?;
                    let (read_half, write_half) = stream.into_split();
                    return Ok(Transport::new(Box::new(read_half), Box::new(write_half), Some(child)));
                }
                Err(e) => {
                    if tokio::time::Instant::now() >= deadline {
                        let _ = child.start_kill();
                        return Err(TransportError::Io(e).into());
                    }
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }

    /// An in-process, in-memory pair for tests: writes to one side become
    /// readable on the other (§ ambient test tooling).
    pub fn mock_pair(buffer_size: usize) -> (Transport, Transport) {
        let (a, b) = tokio::io::duplex(buffer_size);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        (Transport::new(Box::new(a_read), Box::new(a_write), None), Transport::new(Box::new(b_read), Box::new(b_write), None))
    }

    pub async fn send(&mut self, message: &Value) -> DapResult<()> {
        if self.closed.get() {
            return Err(TransportError::Closed.into());
        }
        let framed = encode(message)?;
        if let Err(e) = self.writer.write_all(&framed).await {
            self.closed.set(true);
            return Err(TransportError::Io(e).into());
        }
        if let Err(e) = self.writer.flush().await {
            self.closed.set(true);
            return Err(TransportError::Io(e).into());
        }
        Ok(())
    }

    /// Returns the next decoded message, or `Ok(None)` on a clean EOF.
    pub async fn recv(&mut self) -> DapResult<Option<Value>> {
        if self.closed.get() {
            return Err(TransportError::Closed.into());
        }
        loop {
            if let Some(msg) = self.decoder.next_message()? {
                return Ok(Some(msg));
            }
            let n = self.reader.read(&mut self.read_buf).await.map_err(TransportError::Io)?;
            if n == 0 {
                self.closed.set(true);
                return Ok(None);
            }
            self.decoder.feed(&self.read_buf[..n]);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    /// Idempotent; best-effort terminates a spawned child.
    pub async fn close(&mut self) {
        if self.closed.replace(true) {
            return;
        }
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

impl TransportReader {
    /// Returns the next decoded message, or `Ok(None)` on a clean EOF.
    pub async fn recv(&mut self) -> DapResult<Option<Value>> {
        if self.closed.get() {
            return Err(TransportError::Closed.into());
        }
        loop {
            if let Some(msg) = self.decoder.next_message()? {
                return Ok(Some(msg));
            }
            let n = self.reader.read(&mut self.read_buf).await.map_err(TransportError::Io)?;
            if n == 0 {
                self.closed.set(true);
                return Ok(None);
            }
            self.decoder.feed(&self.read_buf[..n]);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }
}

impl TransportWriter {
    pub async fn send(&mut self, message: &Value) -> DapResult<()> {
        if self.closed.get() {
            return Err(TransportError::Closed.into());
        }
        let framed = encode(message)?;
        if let Err(e) = self.writer.write_all(&framed).await {
            self.closed.set(true);
            return Err(TransportError::Io(e).into());
        }
        if let Err(e) = self.writer.flush().await {
            self.closed.set(true);
            return Err(TransportError::Io(e).into());
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    /// Idempotent; best-effort terminates a spawned child.
    pub async fn close(&mut self) {
        if self.closed.replace(true) {
            return;
        }
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

fn clamp_timeout(requested: Option<Duration>) -> Duration {
    let ms = requested.map(|d| d.as_millis() as u64).unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS);
    Duration::from_millis(ms.clamp(MIN_CONNECT_TIMEOUT_MS, MAX_CONNECT_TIMEOUT_MS))
}

/// Feeds `port_detector` the bytes accumulated from `stdout` so far after
/// every read, until it recognises a port announcement or `deadline` passes.
async fn scan_for_port(
    stdout: &mut (impl AsyncRead + Unpin),
    port_detector: &PortDetector,
    deadline: tokio::time::Instant,
) -> DapResult<(u16, String)> {
    let mut seen = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(found) = port_detector(&seen) {
            return Ok(found);
        }
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "timed out waiting for the adapter to announce a port",
            ))
            .into());
        }
        let n = tokio::time::timeout(remaining, stdout.read(&mut chunk))
            .await
            .map_err(|_| {
                TransportError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out waiting for the adapter to announce a port"))
            })?
            .map_err(TransportError::Io)?;
        if n == 0 {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "adapter closed stdout before announcing a port",
            ))
            .into());
        }
        seen.extend_from_slice(&chunk[..n]);
    }
}

/// Once the port has been found, stdout is no longer consulted for
/// anything — but the pipe must still be drained or the adapter blocks the
/// next time it writes to it.
fn spawn_stdout_drain(mut stdout: tokio::process::ChildStdout) {
    tokio::task::spawn_local(async move {
        let mut buf = [0u8; 4096];
        loop {
            match stdout.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    });
}

fn spawn_stderr_logger(stderr: tokio::process::ChildStderr) {
    tokio::task::spawn_local(async move {
        let mut reader = tokio::io::BufReader::new(stderr);
        let mut line = String::new();
        loop {
            line.clear();
            match tokio::io::AsyncBufReadExt::read_line(&mut reader, &mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => tracing::debug!(target: "dap_graph::adapter_stderr", "{}", line.trim_end()),
            }
        }
    });
}
