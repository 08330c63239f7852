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

//! Protocol Session.
//!
//! State machine over one [`ProcessHandle`]:
//! `uninitialized → handshaking → ready → closing → closed`, with `failed`
//! for a handshake that never completed. `closed` is terminal.
//!
//! The session imposes no ordering on calls; concurrent `call_tool`s are
//! multiplexed by request id in the process's correlator.

use serde_json::{json, Value};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::engine_core::constants::{defaults, methods, protocol};
use crate::engine_core::errors::CatalogError;
use crate::engine_core::models::{JsonRpcRequest, RequestId, SessionState, ToolDefinition};
use crate::mcp::process::ProcessHandle;
use crate::protocol::negotiation::{HandshakeManager, ServerInfo};

/// Upper bound on `tools/list` pages followed via `nextCursor`.
const MAX_LIST_PAGES: usize = 64;

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub handshake_timeout: Duration,
    pub list_timeout: Duration,
    pub call_timeout: Duration,
    pub protocol_version: String,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_millis(defaults::HANDSHAKE_TIMEOUT_MS),
            list_timeout: Duration::from_millis(defaults::LIST_TIMEOUT_MS),
            call_timeout: Duration::from_millis(defaults::CALL_TIMEOUT_MS),
            protocol_version: protocol::DEFAULT_PROTOCOL_VERSION.to_string(),
        }
    }
}

pub struct ProtocolSession {
    server: String,
    process: Arc<ProcessHandle>,
    options: SessionOptions,
    state: Mutex<SessionState>,
    server_info: Mutex<Option<ServerInfo>>,
}

impl ProtocolSession {
    pub fn new(process: Arc<ProcessHandle>, options: SessionOptions) -> Self {
        Self {
            server: process.name().to_string(),
            process,
            options,
            state: Mutex::new(SessionState::Uninitialized),
            server_info: Mutex::new(None),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state. A ready session whose process died reads as `closed`.
    pub fn state(&self) -> SessionState {
        let mut state = self.lock_state();
        if *state == SessionState::Ready && !self.process.is_alive() {
            *state = SessionState::Closed;
        }
        *state
    }

    fn set_state(&self, next: SessionState) {
        let mut state = self.lock_state();
        if *state == SessionState::Closed {
            return;
        }
        let previous = std::mem::replace(&mut *state, next);
        debug!(server = %self.server, from = %previous, to = %next, "Session transition");
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn process(&self) -> &Arc<ProcessHandle> {
        &self.process
    }

    pub fn server_info(&self) -> Option<ServerInfo> {
        self.server_info
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Perform `initialize` then `notifications/initialized`.
    ///
    /// The initialize response is the readiness signal; no fixed start-up
    /// delay is used. On failure the session is left `failed` (or `closed`
    /// if the transport broke) and must be discarded.
    pub async fn handshake(&self) -> Result<ServerInfo, CatalogError> {
        {
            let mut state = self.lock_state();
            if *state != SessionState::Uninitialized {
                return Err(CatalogError::InvalidState {
                    server: self.server.clone(),
                    state: state.to_string(),
                    expected: SessionState::Uninitialized.to_string(),
                });
            }
            *state = SessionState::Handshaking;
        }

        match self.exchange_initialize().await {
            Ok(info) => {
                info!(
                    server = %self.server,
                    protocol = %info.protocol_version,
                    "Handshake complete"
                );
                *self
                    .server_info
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(info.clone());
                self.set_state(SessionState::Ready);
                Ok(info)
            }
            Err(e) => {
                self.set_state(SessionState::Failed);
                Err(CatalogError::HandshakeFailed {
                    server: self.server.clone(),
                    reason: format!("{}{}", e, self.process.stderr_suffix()),
                })
            }
        }
    }

    async fn exchange_initialize(&self) -> Result<ServerInfo, CatalogError> {
        let version = self.options.protocol_version.clone();
        let timeout = self.options.handshake_timeout;
        let result = self
            .request(
                methods::INITIALIZE,
                Some(HandshakeManager::initialize_params(&version)),
                timeout,
                || self.timeout_error(methods::INITIALIZE, timeout),
            )
            .await?;

        let info = HandshakeManager::negotiate(&self.server, &version, &result);
        let note = JsonRpcRequest::notification(methods::INITIALIZED, None);
        self.process
            .write_line(self.encode(&note)?)
            .await
            .map_err(|e| self.on_transport_error(e))?;
        Ok(info)
    }

    /// `tools/list`, following `nextCursor` pages.
    pub async fn list_tools(&self) -> Result<Vec<ToolDefinition>, CatalogError> {
        self.ensure_ready()?;
        let timeout = self.options.list_timeout;
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let result = self
                .request(methods::TOOLS_LIST, params, timeout, || {
                    self.timeout_error(methods::TOOLS_LIST, timeout)
                })
                .await?;

            let Some(page) = result.get("tools").and_then(Value::as_array) else {
                return Err(CatalogError::ProtocolViolation {
                    server: self.server.clone(),
                    reason: "tools/list result has no 'tools' array".to_string(),
                });
            };
            for entry in page {
                match serde_json::from_value::<ToolDefinition>(entry.clone()) {
                    Ok(tool) => tools.push(tool),
                    Err(e) => warn!(server = %self.server, "Skipping malformed tool entry: {}", e),
                }
            }

            cursor = result
                .get("nextCursor")
                .and_then(Value::as_str)
                .map(str::to_string);
            if cursor.is_none() {
                return Ok(tools);
            }
        }

        warn!(server = %self.server, "tools/list pagination limit reached");
        Ok(tools)
    }

    /// `tools/call`. A timeout is a [`CatalogError::ToolTimeout`] and leaves
    /// the session usable.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, CatalogError> {
        self.ensure_ready()?;
        let timeout = self.options.call_timeout;
        let params = json!({ "name": name, "arguments": arguments });

        self.request(methods::TOOLS_CALL, Some(params), timeout, || {
            CatalogError::ToolTimeout {
                server: self.server.clone(),
                tool: name.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }
        })
        .await
    }

    /// Mark the session closed. The process itself belongs to the supervisor.
    pub fn close(&self) {
        self.set_state(SessionState::Closing);
        self.set_state(SessionState::Closed);
    }

    fn ensure_ready(&self) -> Result<(), CatalogError> {
        match self.state() {
            SessionState::Ready => Ok(()),
            other => Err(CatalogError::InvalidState {
                server: self.server.clone(),
                state: other.to_string(),
                expected: SessionState::Ready.to_string(),
            }),
        }
    }

    async fn request<F>(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
        on_timeout: F,
    ) -> Result<Value, CatalogError>
    where
        F: FnOnce() -> CatalogError,
    {
        let correlator = self.process.correlator();
        let id = RequestId::generate();
        let message = self.encode(&JsonRpcRequest::request(&id, method, params))?;
        let pending = correlator
            .register(id)
            .map_err(|e| self.on_transport_error(e))?;

        if let Err(e) = self.process.write_line(message).await {
            correlator.cancel(pending);
            return Err(self.on_transport_error(e));
        }

        correlator
            .await_with_timeout(pending, timeout, on_timeout)
            .await
            .map_err(|e| self.on_transport_error(e))
    }

    /// Transport failures are terminal: fail every other pending call and close.
    fn on_transport_error(&self, err: CatalogError) -> CatalogError {
        if err.is_transport() {
            self.process.correlator().fail_all(&err.to_string());
            self.close();
        }
        err
    }

    fn encode(&self, request: &JsonRpcRequest) -> Result<Value, CatalogError> {
        serde_json::to_value(request).map_err(|e| CatalogError::ProtocolViolation {
            server: self.server.clone(),
            reason: format!("failed to encode request: {}", e),
        })
    }

    fn timeout_error(&self, operation: &str, timeout: Duration) -> CatalogError {
        CatalogError::Timeout {
            server: self.server.clone(),
            operation: operation.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }
}
