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

//! mcp-catalog: one interface over many MCP servers.
//!
//! This library starts independent MCP server processes, performs the
//! protocol handshake with each, discovers their tools and proxies
//! `tools/call` requests to the process that owns a tool.

pub mod catalog;
pub mod config;
pub mod engine_core;
pub mod mcp;
pub mod protocol;

pub use catalog::orchestrator::Orchestrator;
pub use engine_core::errors::{CatalogError, ErrorKind};
