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

//! mcp-catalog constants - single source of truth for wire names, limits and defaults.

/// JSON-RPC 2.0 error codes
pub mod jsonrpc {
    /// Protocol version string carried by every message
    pub const VERSION: &str = "2.0";
    /// Method not found (standard JSON-RPC)
    pub const ERROR_METHOD_NOT_FOUND: i32 = -32601;
}

/// MCP protocol methods
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
}

/// Handshake identity and protocol versions
pub mod protocol {
    pub const CLIENT_NAME: &str = "mcp-catalog";
    pub const DEFAULT_PROTOCOL_VERSION: &str = "2024-11-05";
    /// Versions this client knows how to talk to, newest last
    pub const SUPPORTED_VERSIONS: &[&str] = &["2024-11-05", "2025-03-26", "2025-06-18"];
}

/// Configuration environment variables
pub mod config {
    pub const ENV_LOG_LEVEL: &str = "MCP_CATALOG_LOG_LEVEL";
    pub const ENV_LOG_FORMAT: &str = "MCP_CATALOG_LOG_FORMAT";
    pub const ENV_SERVERS_PATH: &str = "MCP_CATALOG_SERVERS";
    pub const ENV_LIFECYCLE: &str = "MCP_CATALOG_LIFECYCLE";
    pub const ENV_HANDSHAKE_TIMEOUT_MS: &str = "MCP_CATALOG_HANDSHAKE_TIMEOUT_MS";
    pub const ENV_CALL_TIMEOUT_MS: &str = "MCP_CATALOG_CALL_TIMEOUT_MS";
    pub const ENV_LIST_TIMEOUT_MS: &str = "MCP_CATALOG_LIST_TIMEOUT_MS";
    pub const ENV_STOP_GRACE_MS: &str = "MCP_CATALOG_STOP_GRACE_MS";
    pub const ENV_START_ATTEMPTS: &str = "MCP_CATALOG_START_ATTEMPTS";
    pub const ENV_HANDSHAKE_ATTEMPTS: &str = "MCP_CATALOG_HANDSHAKE_ATTEMPTS";
    pub const ENV_BACKOFF_MS: &str = "MCP_CATALOG_BACKOFF_MS";
    pub const ENV_PROTOCOL_VERSION: &str = "MCP_CATALOG_PROTOCOL_VERSION";
}

/// Default timings and retry bounds
pub mod defaults {
    /// Cold start of `npx`/`uvx` servers routinely takes several seconds
    pub const HANDSHAKE_TIMEOUT_MS: u64 = 30_000;
    pub const CALL_TIMEOUT_MS: u64 = 30_000;
    pub const LIST_TIMEOUT_MS: u64 = 15_000;
    pub const STOP_GRACE_MS: u64 = 2_000;
    pub const START_ATTEMPTS: u32 = 3;
    pub const HANDSHAKE_ATTEMPTS: u32 = 3;
    pub const BACKOFF_MS: u64 = 500;
    /// Bound on a single stdin write; a child that stops reading is treated as broken
    pub const WRITE_TIMEOUT_MS: u64 = 10_000;
    /// Upper bound on a single backoff sleep
    pub const MAX_BACKOFF_MS: u64 = 10_000;
}

/// Routing table naming
pub mod routing {
    /// Separator between server name and tool name in a display name
    pub const DISPLAY_SEPARATOR: &str = "__";
}

/// Transport limits (DoS protection)
pub mod limits {
    /// Maximum allowed JSON-RPC line size (10 MB)
    pub const MAX_MESSAGE_SIZE_BYTES: usize = 10 * 1024 * 1024;
    /// Queue depth for outbound lines per process
    pub const WRITE_QUEUE_DEPTH: usize = 64;
    /// Longest stderr line forwarded to the log sink
    pub const MAX_STDERR_LINE: usize = 4096;
    /// Recent stderr lines kept per process for failure reports
    pub const STDERR_TAIL_LINES: usize = 20;
}
