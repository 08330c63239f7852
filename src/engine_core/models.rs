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

//! Domain models for the catalog.
//!
//! Pure data: JSON-RPC envelopes, server descriptors, lifecycle states,
//! tool records and discovery outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

use crate::engine_core::constants::jsonrpc;
use crate::engine_core::errors::ErrorKind;

/// Newtype for request identifiers. Random per request, never reused while pending.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new random RequestId
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Recover an id from the wire. Numeric ids are accepted so servers that
    /// echo ids back as numbers still correlate.
    pub fn from_wire(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Self(s.clone())),
            Value::Number(n) => Some(Self(n.to_string())),
            _ => None,
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

impl JsonRpcRequest {
    pub fn request(id: &RequestId, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: jsonrpc::VERSION.to_string(),
            method: method.to_string(),
            params,
            id: Some(Value::String(id.as_str().to_string())),
        }
    }

    /// A request without an id; no response is expected.
    pub fn notification(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: jsonrpc::VERSION.to_string(),
            method: method.to_string(),
            params,
            id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: Value,
}

fn default_version() -> String {
    jsonrpc::VERSION.to_string()
}

impl JsonRpcResponse {
    pub fn error(id: Value, code: i32, message: &str) -> Self {
        Self {
            jsonrpc: jsonrpc::VERSION.to_string(),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.to_string(),
                data: None,
            }),
            id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// One decoded message from a child's stdout, classified by shape.
#[derive(Debug, Clone)]
pub enum Incoming {
    Response(JsonRpcResponse),
    /// Reply-shaped message that does not parse as a response. `id` is
    /// whatever the message carried (`null` if absent) so the waiter can
    /// still be failed.
    MalformedResponse {
        id: Value,
        reason: String,
    },
    /// Server-initiated request; it expects an answer.
    Request {
        id: Value,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
}

impl Incoming {
    pub fn classify(value: Value) -> Result<Self, String> {
        let Value::Object(ref map) = value else {
            return Err("message is not a JSON object".to_string());
        };

        if let Some(method) = map.get("method").and_then(Value::as_str) {
            let method = method.to_string();
            let params = map.get("params").cloned();
            return Ok(match map.get("id") {
                Some(id) if !id.is_null() => Incoming::Request {
                    id: id.clone(),
                    method,
                    params,
                },
                _ => Incoming::Notification { method, params },
            });
        }

        let id = map.get("id").cloned().unwrap_or(Value::Null);
        if !map.contains_key("result") && !map.contains_key("error") {
            if id.is_null() {
                return Err("message has neither method nor result/error".to_string());
            }
            return Ok(Incoming::MalformedResponse {
                id,
                reason: "response has neither result nor error".to_string(),
            });
        }

        Ok(match serde_json::from_value::<JsonRpcResponse>(value) {
            Ok(resp) => Incoming::Response(resp),
            Err(e) => Incoming::MalformedResponse {
                id,
                reason: format!("malformed response: {}", e),
            },
        })
    }
}

/// How a server is reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Stdio,
    Http,
    Sse,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportKind::Stdio => "stdio",
            TransportKind::Http => "http",
            TransportKind::Sse => "sse",
        };
        f.write_str(s)
    }
}

/// Declaration of one environment variable a server consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvRequirement {
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Value used when the variable is absent from the environment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

fn default_required() -> bool {
    true
}

impl EnvRequirement {
    pub fn required() -> Self {
        Self {
            required: true,
            description: None,
            default: None,
        }
    }

    pub fn optional() -> Self {
        Self {
            required: false,
            description: None,
            default: None,
        }
    }
}

/// Launch description of one logical server. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, EnvRequirement>,
    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
}

impl ServerDescriptor {
    pub fn stdio(name: &str, command: &str, args: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            environment: BTreeMap::new(),
            transport: TransportKind::Stdio,
            description: None,
            cwd: None,
        }
    }

    pub fn with_env(mut self, var: &str, requirement: EnvRequirement) -> Self {
        self.environment.insert(var.to_string(), requirement);
        self
    }

    pub fn required_env(&self) -> impl Iterator<Item = &str> {
        self.environment
            .iter()
            .filter(|(_, req)| req.required)
            .map(|(name, _)| name.as_str())
    }
}

/// Lifecycle of one child process. Only the supervisor drives transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Stopping => "stopping",
            ProcessState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Protocol session state machine. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Uninitialized,
    Handshaking,
    Ready,
    /// Handshake failed; the session cannot be used but was never ready.
    Failed,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Handshaking => "handshaking",
            SessionState::Ready => "ready",
            SessionState::Failed => "failed",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Tool as advertised by a server in `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", alias = "input_schema", default)]
    pub input_schema: Value,
}

/// A discovered tool, keyed in the routing table by its display name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRecord {
    pub display_name: String,
    pub name: String,
    pub server: String,
    pub description: String,
    pub input_schema: Value,
}

/// Whether a server's declared environment is satisfied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Readiness {
    pub server: String,
    pub ready: bool,
    pub missing_env: Vec<String>,
    pub present_env: Vec<String>,
}

/// Last discovery outcome for one server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DiscoveryOutcome {
    Discovered {
        tools: Vec<String>,
    },
    Skipped {
        reason: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        missing_env: Vec<String>,
    },
    Failed {
        kind: ErrorKind,
        reason: String,
    },
}

impl DiscoveryOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DiscoveryOutcome::Discovered { .. })
    }
}

/// Aggregate result of one discovery pass. Rebuilt wholesale on every pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryReport {
    pub servers: BTreeMap<String, DiscoveryOutcome>,
    /// Display names dropped because another server already claimed them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub collisions: Vec<String>,
    pub total_tools: usize,
    pub completed_at: DateTime<Utc>,
}

impl DiscoveryReport {
    pub fn empty() -> Self {
        Self {
            servers: BTreeMap::new(),
            collisions: Vec::new(),
            total_tools: 0,
            completed_at: Utc::now(),
        }
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &str> {
        self.servers
            .iter()
            .filter(|(_, o)| o.is_success())
            .map(|(n, _)| n.as_str())
    }

    pub fn outcome(&self, server: &str) -> Option<&DiscoveryOutcome> {
        self.servers.get(server)
    }
}
