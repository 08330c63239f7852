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

//! Handshake Manager (Protocol Negotiation).
//!
//! Builds the `initialize` parameters we declare and interprets what the
//! server answers. A version mismatch is logged, never fatal: most servers
//! speak a compatible subset for `tools/list` and `tools/call`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::engine_core::constants::protocol;

/// What a server told us about itself in its `initialize` result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub protocol_version: String,
    pub name: Option<String>,
    pub version: Option<String>,
    pub capabilities: Value,
}

impl ServerInfo {
    pub fn supports_tools(&self) -> bool {
        self.capabilities.get("tools").is_some()
    }
}

pub struct HandshakeManager;

impl HandshakeManager {
    /// Parameters for our `initialize` request.
    pub fn initialize_params(protocol_version: &str) -> Value {
        json!({
            "protocolVersion": protocol_version,
            "capabilities": {
                "roots": { "listChanged": true },
                "sampling": {}
            },
            "clientInfo": {
                "name": protocol::CLIENT_NAME,
                "version": env!("CARGO_PKG_VERSION")
            }
        })
    }

    /// Interpret the `initialize` result from `server`.
    pub fn negotiate(server: &str, requested: &str, result: &Value) -> ServerInfo {
        let protocol_version = match result.get("protocolVersion").and_then(Value::as_str) {
            Some(v) => v.to_string(),
            None => {
                warn!(server = %server, "initialize result has no protocolVersion; assuming {}", requested);
                requested.to_string()
            }
        };

        if !protocol::SUPPORTED_VERSIONS.contains(&protocol_version.as_str()) {
            warn!(
                server = %server,
                "Server speaks unknown protocol version '{}', continuing",
                protocol_version
            );
        } else if protocol_version != requested {
            info!(
                server = %server,
                "Server downgraded protocol from {} to {}", requested, protocol_version
            );
        }

        let server_info = result.get("serverInfo");
        let field = |key: &str| {
            server_info
                .and_then(|i| i.get(key))
                .and_then(Value::as_str)
                .map(str::to_string)
        };

        ServerInfo {
            protocol_version,
            name: field("name"),
            version: field("version"),
            capabilities: result.get("capabilities").cloned().unwrap_or(json!({})),
        }
    }
}
