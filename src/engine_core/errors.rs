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

//! Error taxonomy for process supervision, protocol sessions and proxying.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the catalog.
///
/// Every variant carries owned strings so a single start failure can be
/// cloned out to every caller that was waiting on it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CatalogError {
    /// Missing required environment or launch information. Never retried.
    #[error("configuration error for '{server}': {reason}")]
    Configuration { server: String, reason: String },

    /// The OS refused to spawn the child process.
    #[error("failed to start server '{server}': {reason}")]
    Start { server: String, reason: String },

    /// Malformed or unmatched JSON-RPC traffic.
    #[error("protocol violation from '{server}': {reason}")]
    ProtocolViolation { server: String, reason: String },

    /// A `tools/call` exceeded its deadline. The session stays usable.
    #[error("tool '{tool}' on '{server}' timed out after {timeout_ms}ms")]
    ToolTimeout {
        server: String,
        tool: String,
        timeout_ms: u64,
    },

    /// Any other bounded wait that expired (initialize, tools/list).
    #[error("'{operation}' on '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        operation: String,
        timeout_ms: u64,
    },

    /// The process exited or its pipes broke. Terminal for the session.
    #[error("transport failure for '{server}': {reason}")]
    TransportFailure { server: String, reason: String },

    /// Writing to the child's stdin after it exited.
    #[error("write to '{server}' failed: {reason}")]
    Write { server: String, reason: String },

    /// Unknown display name at invoke time.
    #[error("unknown tool: '{name}'")]
    ToolNotFound { name: String },

    /// The child answered with a JSON-RPC error object.
    #[error("server '{server}' returned error [{code}]: {message}")]
    Server {
        server: String,
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// Arguments rejected by the tool's input schema.
    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    /// Operation attempted in the wrong session state.
    #[error("session for '{server}' is {state}, expected {expected}")]
    InvalidState {
        server: String,
        state: String,
        expected: String,
    },

    /// The initialize exchange failed after all attempts.
    #[error("handshake with '{server}' failed: {reason}")]
    HandshakeFailed { server: String, reason: String },

    /// Descriptor declares a transport this core does not drive.
    #[error("server '{server}' uses unsupported transport '{transport}'")]
    UnsupportedTransport { server: String, transport: String },

    /// Descriptor file could not be read or parsed.
    #[error("failed to load descriptors from {source_name}: {reason}{}", location(.line, .column))]
    DescriptorLoad {
        source_name: String,
        reason: String,
        line: Option<usize>,
        column: Option<usize>,
    },
}

fn location(line: &Option<usize>, column: &Option<usize>) -> String {
    match (line, column) {
        (Some(l), Some(c)) => format!(" (line {}, column {})", l, c),
        (Some(l), None) => format!(" (line {})", l),
        _ => String::new(),
    }
}

/// Stable, serializable error classification used across the proxy boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ErrorKind {
    Configuration,
    Start,
    ProtocolViolation,
    ToolTimeout,
    Timeout,
    TransportFailure,
    ToolNotFound,
    ServerError,
    InvalidArguments,
    InvalidState,
    HandshakeFailed,
    UnsupportedTransport,
    DescriptorLoad,
}

/// Structured error returned to callers instead of an opaque failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl CatalogError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CatalogError::Configuration { .. } => ErrorKind::Configuration,
            CatalogError::Start { .. } => ErrorKind::Start,
            CatalogError::ProtocolViolation { .. } => ErrorKind::ProtocolViolation,
            CatalogError::ToolTimeout { .. } => ErrorKind::ToolTimeout,
            CatalogError::Timeout { .. } => ErrorKind::Timeout,
            // A write to a dead pipe is the same failure seen from the other side.
            CatalogError::TransportFailure { .. } | CatalogError::Write { .. } => {
                ErrorKind::TransportFailure
            }
            CatalogError::ToolNotFound { .. } => ErrorKind::ToolNotFound,
            CatalogError::Server { .. } => ErrorKind::ServerError,
            CatalogError::InvalidArguments { .. } => ErrorKind::InvalidArguments,
            CatalogError::InvalidState { .. } => ErrorKind::InvalidState,
            CatalogError::HandshakeFailed { .. } => ErrorKind::HandshakeFailed,
            CatalogError::UnsupportedTransport { .. } => ErrorKind::UnsupportedTransport,
            CatalogError::DescriptorLoad { .. } => ErrorKind::DescriptorLoad,
        }
    }

    /// Whether bringing a server up may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CatalogError::Start { .. }
                | CatalogError::HandshakeFailed { .. }
                | CatalogError::Timeout { .. }
                | CatalogError::TransportFailure { .. }
                | CatalogError::Write { .. }
        )
    }

    /// Whether the failure means the owning process can no longer be used.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            CatalogError::TransportFailure { .. } | CatalogError::Write { .. }
        )
    }

    pub fn payload(&self) -> ErrorPayload {
        let (code, data) = match self {
            CatalogError::Server { code, data, .. } => (Some(*code), data.clone()),
            _ => (None, None),
        };
        ErrorPayload {
            kind: self.kind(),
            message: self.to_string(),
            code,
            data,
        }
    }

    pub(crate) fn transport(server: &str, reason: impl Into<String>) -> Self {
        CatalogError::TransportFailure {
            server: server.to_string(),
            reason: reason.into(),
        }
    }
}
