//! JSON-RPC over a worker byte stream.
//!
//! Handles low-level communication with the worker process:
//! - Writing one JSON-RPC object per line to the worker's stdin
//! - Splitting the worker's stdout into complete lines
//! - Correlating responses to outstanding requests by id
//! - Enforcing a per-request deadline
//!
//! Reading is driven by the supervisor, which feeds each complete line to
//! [`RpcTransport::handle_line`]. Writers block only on the stream itself;
//! any number of requests may be outstanding at once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::errors::BridgeError;
use super::types::{
    JsonRpcNotification, JsonRpcRequest, RpcMessage, RpcPayload,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default per-request deadline.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Lines longer than this are discarded rather than buffered forever.
const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// Read chunk size for the worker's output streams.
const READ_CHUNK_BYTES: usize = 8 * 1024;

// ─── Request ID Generator ────────────────────────────────────────────────────

/// Global monotonic request ID counter.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request ID.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Line Framing ────────────────────────────────────────────────────────────

/// Accumulates raw bytes and yields complete `\n`-terminated lines.
///
/// Bytes after the last newline stay buffered until the next push, so a
/// frame split across reads (even inside a multi-byte character) is only
/// decoded once its terminator arrives.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
    /// Prefix of `buf` already known to hold no newline.
    scanned: usize,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain every complete line it finishes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(offset) = self.buf[self.scanned..].iter().position(|&b| b == b'\n') {
            let pos = self.scanned + offset;
            self.scanned = 0;
            let rest = self.buf.split_off(pos + 1);
            let mut line = std::mem::replace(&mut self.buf, rest);
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        self.scanned = self.buf.len();

        if self.buf.len() > MAX_LINE_BYTES {
            tracing::warn!(
                buffered = self.buf.len(),
                limit = MAX_LINE_BYTES,
                "discarding oversized unterminated worker line"
            );
            self.buf.clear();
            self.scanned = 0;
        }

        lines
    }

    /// Bytes waiting for a line terminator.
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }

    /// Flush the unterminated tail at end of stream.
    pub fn take_remainder(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let tail = std::mem::take(&mut self.buf);
        self.scanned = 0;
        Some(String::from_utf8_lossy(&tail).into_owned())
    }
}

/// Read `reader` to EOF, invoking `on_line` for every complete line.
///
/// An unterminated tail at EOF is delivered as a final line.
pub async fn read_lines<R, F>(mut reader: R, mut on_line: F) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    F: FnMut(String),
{
    let mut framer = LineBuffer::new();
    let mut chunk = vec![0u8; READ_CHUNK_BYTES];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            if let Some(tail) = framer.take_remainder() {
                on_line(tail);
            }
            return Ok(());
        }
        for line in framer.push(&chunk[..n]) {
            on_line(line);
        }
    }
}

// ─── Transport ───────────────────────────────────────────────────────────────

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type SharedWriter = Arc<tokio::sync::Mutex<BoxedWriter>>;
type Responder = oneshot::Sender<Result<serde_json::Value, BridgeError>>;

/// An outstanding request awaiting its response.
struct PendingRequest {
    method: String,
    deadline: Instant,
    responder: Responder,
}

/// What [`RpcTransport::handle_line`] did with a line of worker output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameDisposition {
    /// A pending request was settled by this frame.
    Settled(u64),
    /// A response whose id has no pending request; dropped.
    Unmatched(u64),
    /// A worker-initiated notification.
    Notification(String),
    /// A worker-initiated request; the bridge does not serve these.
    WorkerRequest(String),
    /// Not a JSON-RPC frame (log output, blank line, readiness banner).
    Diagnostic,
}

/// Bi-directional JSON-RPC transport over the worker's stdio.
///
/// The write half is attached when a worker is spawned and detached when it
/// exits. While detached every call fails immediately.
pub struct RpcTransport {
    worker_name: String,
    writer: Mutex<Option<SharedWriter>>,
    pending: Mutex<HashMap<u64, PendingRequest>>,
    request_timeout: Duration,
}

impl RpcTransport {
    /// Create a detached transport.
    pub fn new(worker_name: &str, request_timeout: Duration) -> Self {
        Self {
            worker_name: worker_name.to_string(),
            writer: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            request_timeout,
        }
    }

    pub fn worker_name(&self) -> &str {
        &self.worker_name
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    // ─── Stream Attachment ───────────────────────────────────────────────

    /// Attach the worker's input stream. Replaces any previous stream.
    pub fn attach<W>(&self, writer: W)
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let boxed: BoxedWriter = Box::new(writer);
        *lock(&self.writer) = Some(Arc::new(tokio::sync::Mutex::new(boxed)));
    }

    /// Detach the stream and reject every outstanding request.
    ///
    /// Returns the number of requests that were rejected.
    pub fn detach(&self, reason: &str) -> usize {
        lock(&self.writer).take();

        let drained: Vec<(u64, PendingRequest)> = lock(&self.pending).drain().collect();
        let count = drained.len();
        for (id, req) in drained {
            tracing::debug!(
                worker = %self.worker_name,
                id,
                method = %req.method,
                "rejecting in-flight request on detach"
            );
            let _ = req.responder.send(Err(BridgeError::ProcessExited {
                name: self.worker_name.clone(),
                reason: reason.to_string(),
            }));
        }
        count
    }

    /// Whether a worker stream is currently attached.
    pub fn is_attached(&self) -> bool {
        lock(&self.writer).is_some()
    }

    /// Number of requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    // ─── Outbound ────────────────────────────────────────────────────────

    /// Send a request and wait for the response with the same id.
    ///
    /// Resolves with the `result` value, or rejects with the worker's error
    /// object, a timeout, or a transport failure. Exactly one of those
    /// happens per request.
    pub async fn send(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, BridgeError> {
        let writer = self.current_writer()?;

        let id = next_request_id();
        let line = encode_line(&JsonRpcRequest::new(id, method, params), &self.worker_name)?;
        let deadline = Instant::now() + self.request_timeout;

        let (tx, mut rx) = oneshot::channel();
        lock(&self.pending).insert(
            id,
            PendingRequest {
                method: method.to_string(),
                deadline,
                responder: tx,
            },
        );
        let _guard = PendingGuard { transport: self, id };

        tracing::debug!(worker = %self.worker_name, id, method, "sending request");

        match tokio::time::timeout_at(deadline, write_line(&writer, &line)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(BridgeError::TransportError {
                    worker: self.worker_name.clone(),
                    reason: format!("failed to write request: {e}"),
                })
            }
            Err(_) => return Err(self.timeout_error(method, id)),
        }

        match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(self.channel_closed()),
            Err(_) => {
                if lock(&self.pending).remove(&id).is_some() {
                    tracing::warn!(
                        worker = %self.worker_name,
                        id,
                        method,
                        timeout_ms = self.request_timeout.as_millis() as u64,
                        "request timed out"
                    );
                    Err(self.timeout_error(method, id))
                } else {
                    // The response claimed the entry as the deadline passed;
                    // its outcome is already on the way.
                    rx.await.unwrap_or_else(|_| Err(self.channel_closed()))
                }
            }
        }
    }

    /// Send a notification. No id, no response, no deadline.
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), BridgeError> {
        let writer = self.current_writer()?;
        let line = encode_line(&JsonRpcNotification::new(method, params), &self.worker_name)?;

        write_line(&writer, &line)
            .await
            .map_err(|e| BridgeError::TransportError {
                worker: self.worker_name.clone(),
                reason: format!("failed to write notification: {e}"),
            })
    }

    // ─── Inbound ─────────────────────────────────────────────────────────

    /// Process one complete line of worker output.
    ///
    /// Never fails: lines that are not JSON-RPC frames are treated as
    /// diagnostics, and responses for unknown ids are dropped.
    pub fn handle_line(&self, line: &str) -> FrameDisposition {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return FrameDisposition::Diagnostic;
        }

        let Some(message) = RpcMessage::parse_line(trimmed) else {
            tracing::debug!(worker = %self.worker_name, line = %trimmed, "worker output");
            return FrameDisposition::Diagnostic;
        };

        match message {
            RpcMessage::Response { id, payload } => {
                let Some(req) = lock(&self.pending).remove(&id) else {
                    tracing::debug!(worker = %self.worker_name, id, "dropping unmatched response");
                    return FrameDisposition::Unmatched(id);
                };

                let outcome = if Instant::now() > req.deadline {
                    Err(self.timeout_error(&req.method, id))
                } else {
                    match payload {
                        RpcPayload::Result(value) => Ok(value),
                        RpcPayload::Error(err) => Err(BridgeError::ServerError {
                            code: err.code,
                            message: err.message,
                            data: err.data,
                        }),
                    }
                };
                let _ = req.responder.send(outcome);
                FrameDisposition::Settled(id)
            }
            RpcMessage::Notification { method, .. } => {
                tracing::debug!(worker = %self.worker_name, method = %method, "worker notification");
                FrameDisposition::Notification(method)
            }
            RpcMessage::Request { id, method, .. } => {
                tracing::debug!(
                    worker = %self.worker_name,
                    id,
                    method = %method,
                    "ignoring worker-initiated request"
                );
                FrameDisposition::WorkerRequest(method)
            }
        }
    }

    // ─── Helpers ─────────────────────────────────────────────────────────

    fn current_writer(&self) -> Result<SharedWriter, BridgeError> {
        lock(&self.writer)
            .clone()
            .ok_or_else(|| BridgeError::TransportError {
                worker: self.worker_name.clone(),
                reason: "worker stream unavailable (process not running)".into(),
            })
    }

    fn timeout_error(&self, method: &str, id: u64) -> BridgeError {
        BridgeError::Timeout {
            method: method.to_string(),
            id,
            timeout_ms: self.request_timeout.as_millis() as u64,
        }
    }

    fn channel_closed(&self) -> BridgeError {
        BridgeError::TransportError {
            worker: self.worker_name.clone(),
            reason: "response channel closed".into(),
        }
    }
}

/// Removes a request's pending entry when its `send` future finishes or is
/// dropped, so a cancelled caller cannot leak an entry.
struct PendingGuard<'a> {
    transport: &'a RpcTransport,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(&self.transport.pending).remove(&self.id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn encode_line<T: serde::Serialize>(message: &T, worker: &str) -> Result<String, BridgeError> {
    let mut json = serde_json::to_string(message).map_err(|e| BridgeError::TransportError {
        worker: worker.to_string(),
        reason: format!("failed to serialize message: {e}"),
    })?;
    json.push('\n');
    Ok(json)
}

async fn write_line(writer: &SharedWriter, line: &str) -> std::io::Result<()> {
    let mut w = writer.lock().await;
    w.write_all(line.as_bytes()).await?;
    w.flush().await
}

// ─── Tests ───────────────────────────────────────────────────────────────────
