// Copyright 2026 BadCompany
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Per-stream background tasks for one child process.
//!
//! Every child gets its own stdout reader, stderr drain and stdin writer so a
//! slow or silent server never blocks another.

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedWrite;
use tracing::{debug, error, warn};

use crate::engine_core::constants::{jsonrpc, limits};
use crate::engine_core::errors::CatalogError;
use crate::engine_core::models::{Incoming, JsonRpcResponse, RequestId};
use crate::mcp::codec::{frames, Frame, McpCodec};
use crate::mcp::correlator::{Correlator, RpcResult};

/// One line queued for the child's stdin.
#[derive(Debug)]
pub struct OutboundLine {
    pub message: Value,
    /// Completed once the line is flushed, or with the write error.
    pub ack: Option<oneshot::Sender<Result<(), CatalogError>>>,
}

/// Most recent stderr lines of one child, for failure reports.
#[derive(Debug, Default)]
pub struct StderrTail {
    lines: Mutex<VecDeque<String>>,
}

impl StderrTail {
    fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        if lines.len() == limits::STDERR_TAIL_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// `" | stderr: ..."` suffix for error messages, empty when nothing was captured.
    pub fn suffix(&self) -> String {
        let lines = self.snapshot();
        if lines.is_empty() {
            String::new()
        } else {
            format!(" | stderr: {}", lines.join(" / "))
        }
    }
}

/// Turn a decoded response into the value handed to the waiting caller.
fn response_result(server: &str, resp: JsonRpcResponse) -> RpcResult {
    match resp.error {
        Some(err) => Err(CatalogError::Server {
            server: server.to_string(),
            code: err.code,
            message: err.message,
            data: err.data,
        }),
        None => Ok(resp.result.unwrap_or(Value::Null)),
    }
}

/// Spawns the stdout reader. Responses go to the correlator; server-initiated
/// requests are refused through `writer`. On EOF or a read error every
/// pending request is failed.
pub fn spawn_stdout_reader<R>(
    server: String,
    stream: R,
    correlator: Arc<Correlator>,
    writer: mpsc::Sender<OutboundLine>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut framed = frames(stream);
        let mut reason = "output stream closed".to_string();

        while let Some(result) = framed.next().await {
            let value = match result {
                Ok(Frame::Message(value)) => value,
                Ok(Frame::Malformed { preview, error }) => {
                    warn!(server = %server, "Ignoring non-JSON output line ({}): {}", error, preview);
                    continue;
                }
                Err(e) => {
                    error!(server = %server, "Read error on child stdout: {}", e);
                    reason = format!("read error: {}", e);
                    break;
                }
            };

            match Incoming::classify(value) {
                Ok(Incoming::Response(resp)) => match RequestId::from_wire(&resp.id) {
                    Some(id) => {
                        let result = response_result(&server, resp);
                        correlator.resolve(&id, result);
                    }
                    None => {
                        warn!(server = %server, "Protocol violation: response without usable id");
                    }
                },
                Ok(Incoming::MalformedResponse { id, reason }) => match RequestId::from_wire(&id) {
                    Some(id) => {
                        warn!(server = %server, request_id = %id, "Protocol violation: {}", reason);
                        correlator.resolve(
                            &id,
                            Err(CatalogError::ProtocolViolation {
                                server: server.clone(),
                                reason,
                            }),
                        );
                    }
                    None => {
                        warn!(server = %server, "Protocol violation without usable id: {}", reason);
                    }
                },
                Ok(Incoming::Request { id, method, .. }) => {
                    debug!(server = %server, method = %method, "Refusing server-initiated request");
                    let reply = JsonRpcResponse::error(
                        id,
                        jsonrpc::ERROR_METHOD_NOT_FOUND,
                        &format!("Method not found: {}", method),
                    );
                    match serde_json::to_value(&reply) {
                        Ok(message) => {
                            let _ = writer.try_send(OutboundLine { message, ack: None });
                        }
                        Err(e) => error!("Failed to serialize refusal: {}", e),
                    }
                }
                Ok(Incoming::Notification { method, .. }) => {
                    debug!(server = %server, method = %method, "Notification from server");
                }
                Err(violation) => {
                    warn!(server = %server, "Protocol violation: {}", violation);
                }
            }
        }

        correlator.fail_all(&reason);
    })
}

/// Spawns the stderr drain. Lines are logged and kept in `tail`, never parsed.
/// At most `MAX_STDERR_LINE` bytes of a line are held; the rest of an
/// overlong line is dropped as it arrives.
pub fn spawn_stderr_drain<R>(server: String, stream: R, tail: Arc<StderrTail>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut line = Vec::new();

        loop {
            let chunk = match reader.fill_buf().await {
                Ok(chunk) => chunk,
                Err(_) => break,
            };
            if chunk.is_empty() {
                // Pipe closed
                forward_stderr(&server, &tail, &line);
                break;
            }

            let newline = chunk.iter().position(|b| *b == b'\n');
            let (content, used) = match newline {
                Some(pos) => (&chunk[..pos], pos + 1),
                None => (chunk, chunk.len()),
            };
            let room = limits::MAX_STDERR_LINE.saturating_sub(line.len());
            line.extend_from_slice(&content[..content.len().min(room)]);
            reader.consume(used);

            if newline.is_some() {
                forward_stderr(&server, &tail, &line);
                line.clear();
            }
        }
    })
}

fn forward_stderr(server: &str, tail: &StderrTail, raw: &[u8]) {
    let line = String::from_utf8_lossy(raw).trim().to_string();
    if !line.is_empty() {
        debug!(target: "mcp_catalog::child_stderr", server = %server, "{}", line);
        tail.push(line);
    }
}

/// Spawns the single stdin writer. Lines are written in queue order; the
/// first failed write ends the task and fails all pending requests.
pub fn spawn_stdin_writer<W>(
    server: String,
    stream: W,
    mut rx: mpsc::Receiver<OutboundLine>,
    correlator: Arc<Correlator>,
    write_timeout: Duration,
) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut sink = FramedWrite::new(stream, McpCodec::new());

        while let Some(OutboundLine { message, ack }) = rx.recv().await {
            debug!(server = %server, "Sending: {}", message);
            let outcome = match tokio::time::timeout(write_timeout, sink.send(&message)).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!(
                    "write blocked for more than {}ms",
                    write_timeout.as_millis()
                )),
            };

            match outcome {
                Ok(()) => {
                    if let Some(ack) = ack {
                        let _ = ack.send(Ok(()));
                    }
                }
                Err(reason) => {
                    error!(server = %server, "Write to child stdin failed: {}", reason);
                    if let Some(ack) = ack {
                        let _ = ack.send(Err(CatalogError::Write {
                            server: server.clone(),
                            reason: reason.clone(),
                        }));
                    }
                    correlator.fail_all(&format!("stdin broken: {}", reason));
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_reader_resolves_responses_and_skips_noise() {
        let correlator = Arc::new(Correlator::new("echo"));
        let pending = correlator.register(RequestId::from("r1")).unwrap();
        let (mut child_out, ours) = tokio::io::duplex(1024);
        let (tx, _rx) = mpsc::channel(4);

        let task = spawn_stdout_reader("echo".into(), ours, correlator.clone(), tx);
        child_out
            .write_all(b"booting...\n{\"jsonrpc\":\"2.0\",\"id\":\"r1\",\"result\":{\"ok\":1}}\n")
            .await
            .unwrap();

        let got = correlator
            .await_with_timeout(pending, Duration::from_secs(1), || unreachable!())
            .await
            .unwrap();
        assert_eq!(got, json!({"ok": 1}));

        drop(child_out);
        task.await.unwrap();
        assert!(correlator.is_closed());
    }

    #[tokio::test]
    async fn test_reader_maps_error_object() {
        let correlator = Arc::new(Correlator::new("fs"));
        let pending = correlator.register(RequestId::from("e")).unwrap();
        let (mut child_out, ours) = tokio::io::duplex(1024);
        let (tx, _rx) = mpsc::channel(4);
        let _task = spawn_stdout_reader("fs".into(), ours, correlator.clone(), tx);

        child_out
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":\"e\",\"error\":{\"code\":-32602,\"message\":\"bad\"}}\n")
            .await
            .unwrap();

        let err = correlator
            .await_with_timeout(pending, Duration::from_secs(1), || unreachable!())
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::Server { code: -32602, .. }));
    }

    #[tokio::test]
    async fn test_reply_without_version_resolves() {
        let correlator = Arc::new(Correlator::new("loose"));
        let pending = correlator.register(RequestId::from("r1")).unwrap();
        let (mut child_out, ours) = tokio::io::duplex(1024);
        let (tx, _rx) = mpsc::channel(4);
        let _task = spawn_stdout_reader("loose".into(), ours, correlator.clone(), tx);

        child_out
            .write_all(b"{\"id\":\"r1\",\"result\":{\"x\":1}}\n")
            .await
            .unwrap();

        let got = correlator
            .await_with_timeout(pending, Duration::from_millis(300), || unreachable!())
            .await
            .unwrap();
        assert_eq!(got, json!({"x": 1}));
    }

    #[tokio::test]
    async fn test_malformed_error_fails_waiter_promptly() {
        let correlator = Arc::new(Correlator::new("loose"));
        let first = correlator.register(RequestId::from("r1")).unwrap();
        let second = correlator.register(RequestId::from("r2")).unwrap();
        let (mut child_out, ours) = tokio::io::duplex(1024);
        let (tx, _rx) = mpsc::channel(4);
        let _task = spawn_stdout_reader("loose".into(), ours, correlator.clone(), tx);

        child_out
            .write_all(
                b"{\"jsonrpc\":\"2.0\",\"id\":\"r1\",\"error\":\"boom\"}\n\
                  {\"jsonrpc\":\"2.0\",\"id\":\"r2\",\"error\":{\"code\":-1}}\n",
            )
            .await
            .unwrap();

        for pending in [first, second] {
            let err = correlator
                .await_with_timeout(pending, Duration::from_millis(300), || unreachable!())
                .await
                .unwrap_err();
            assert!(matches!(err, CatalogError::ProtocolViolation { .. }), "{err:?}");
        }
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_server_request_refused_with_method_not_found() {
        let correlator = Arc::new(Correlator::new("s"));
        let (mut child_out, ours) = tokio::io::duplex(1024);
        let (tx, mut rx) = mpsc::channel(4);
        let _task = spawn_stdout_reader("s".into(), ours, correlator, tx);

        child_out
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":9,\"method\":\"roots/list\"}\n")
            .await
            .unwrap();

        let line = rx.recv().await.unwrap();
        assert_eq!(line.message["id"], 9);
        assert_eq!(line.message["error"]["code"], jsonrpc::ERROR_METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_writer_preserves_order() {
        let correlator = Arc::new(Correlator::new("w"));
        let (ours, mut child_in) = tokio::io::duplex(4096);
        let (tx, rx) = mpsc::channel(8);
        let task = spawn_stdin_writer("w".into(), ours, rx, correlator, Duration::from_secs(1));

        for i in 0..3 {
            tx.send(OutboundLine {
                message: json!({"n": i}),
                ack: None,
            })
            .await
            .unwrap();
        }
        drop(tx);
        task.await.unwrap();

        let mut out = String::new();
        child_in.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "{\"n\":0}\n{\"n\":1}\n{\"n\":2}\n");
    }

    #[tokio::test]
    async fn test_stderr_tail_bounded() {
        let tail = Arc::new(StderrTail::default());
        let mut input = String::new();
        for i in 0..(limits::STDERR_TAIL_LINES + 5) {
            input.push_str(&format!("line {}\n", i));
        }
        let task = spawn_stderr_drain("s".into(), std::io::Cursor::new(input.into_bytes()), tail.clone());
        task.await.unwrap();

        let lines = tail.snapshot();
        assert_eq!(lines.len(), limits::STDERR_TAIL_LINES);
        assert_eq!(lines[0], "line 5");
        assert!(tail.suffix().starts_with(" | stderr: line 5"));
    }

    #[tokio::test]
    async fn test_stderr_overlong_line_truncated() {
        let tail = Arc::new(StderrTail::default());
        let mut input = vec![b'x'; limits::MAX_STDERR_LINE * 64];
        input.extend_from_slice(b"\nafter\npartial");
        let task = spawn_stderr_drain("s".into(), std::io::Cursor::new(input), tail.clone());
        task.await.unwrap();

        let lines = tail.snapshot();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].len(), limits::MAX_STDERR_LINE);
        assert_eq!(lines[1], "after");
        assert_eq!(lines[2], "partial");
    }
}
