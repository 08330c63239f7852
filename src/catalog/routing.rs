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

//! Routing table: display name → owning server, plus per-server tool records.
//!
//! Tables are built off to the side during discovery and never mutated once
//! published; readers hold an `Arc` snapshot.

use std::collections::BTreeMap;
use tracing::warn;

use crate::engine_core::constants::routing::DISPLAY_SEPARATOR;
use crate::engine_core::errors::CatalogError;
use crate::engine_core::models::{ToolDefinition, ToolRecord};

/// `server__tool`.
pub fn display_name(server: &str, tool: &str) -> String {
    format!("{}{}{}", server, DISPLAY_SEPARATOR, tool)
}

/// Server names must be non-empty, free of the separator and must not end in
/// `_`, so the first separator in a display name always ends the server part.
pub fn validate_server_name(name: &str) -> Result<(), CatalogError> {
    let reason = if name.is_empty() {
        "server name is empty".to_string()
    } else if name.contains(DISPLAY_SEPARATOR) {
        format!("server name must not contain '{}'", DISPLAY_SEPARATOR)
    } else if name.ends_with('_') {
        "server name must not end with '_'".to_string()
    } else {
        return Ok(());
    };
    Err(CatalogError::Configuration {
        server: name.to_string(),
        reason,
    })
}

#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    routes: BTreeMap<String, String>,
    records: BTreeMap<String, Vec<ToolRecord>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add every tool of `server`. The first claimant of a display name keeps
    /// it; returns the display names that were rejected as collisions.
    pub fn insert_server(&mut self, server: &str, tools: Vec<ToolDefinition>) -> Vec<String> {
        let mut collisions = Vec::new();
        let records = self.records.entry(server.to_string()).or_default();

        for tool in tools {
            let shown = display_name(server, &tool.name);
            if self.routes.contains_key(&shown) {
                warn!(server = %server, tool = %tool.name, "Display name '{}' already taken, skipping", shown);
                collisions.push(shown);
                continue;
            }
            self.routes.insert(shown.clone(), server.to_string());
            records.push(ToolRecord {
                display_name: shown,
                name: tool.name,
                server: server.to_string(),
                description: tool.description.unwrap_or_default(),
                input_schema: tool.input_schema,
            });
        }
        collisions
    }

    pub fn server_for(&self, display: &str) -> Option<&str> {
        self.routes.get(display).map(String::as_str)
    }

    pub fn resolve(&self, display: &str) -> Option<&ToolRecord> {
        let server = self.routes.get(display)?;
        self.records
            .get(server)?
            .iter()
            .find(|r| r.display_name == display)
    }

    /// All records, ordered by server then advertisement order.
    pub fn tools(&self) -> impl Iterator<Item = &ToolRecord> {
        self.records.values().flatten()
    }

    pub fn tools_for_server(&self, server: &str) -> &[ToolRecord] {
        self.records.get(server).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Case-insensitive substring match over display name, tool name and
    /// description.
    pub fn search(&self, query: &str) -> Vec<&ToolRecord> {
        let needle = query.to_lowercase();
        self.tools()
            .filter(|r| {
                r.display_name.to_lowercase().contains(&needle)
                    || r.name.to_lowercase().contains(&needle)
                    || r.description.to_lowercase().contains(&needle)
            })
            .collect()
    }

    pub fn servers(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(name: &str, description: &str) -> ToolDefinition {
        ToolDefinition {
            name: name.to_string(),
            description: Some(description.to_string()),
            input_schema: json!({"type": "object"}),
        }
    }

    #[test]
    fn test_resolve_by_display_name() {
        let mut table = RoutingTable::new();
        table.insert_server("github", vec![tool("create_issue", "Open an issue")]);
        table.insert_server("fs", vec![tool("read_file", "Read a file")]);

        let record = table.resolve("github__create_issue").unwrap();
        assert_eq!(record.server, "github");
        assert_eq!(record.name, "create_issue");
        assert_eq!(table.server_for("fs__read_file"), Some("fs"));
        assert!(table.resolve("fs__create_issue").is_none());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_same_tool_name_on_two_servers() {
        let mut table = RoutingTable::new();
        table.insert_server("a", vec![tool("search", "")]);
        table.insert_server("b", vec![tool("search", "")]);
        assert_eq!(table.server_for("a__search"), Some("a"));
        assert_eq!(table.server_for("b__search"), Some("b"));
    }

    #[test]
    fn test_collision_first_wins() {
        let mut table = RoutingTable::new();
        let collisions = table.insert_server("a", vec![tool("c", "first"), tool("c", "second")]);

        assert_eq!(collisions, vec!["a__c".to_string()]);
        assert_eq!(table.resolve("a__c").unwrap().description, "first");
        assert_eq!(table.tools_for_server("a").len(), 1);
    }

    #[test]
    fn test_separator_in_server_name_rejected() {
        assert!(validate_server_name("github").is_ok());
        assert!(validate_server_name("my_server").is_ok());
        for bad in ["a__b", "__x", "x__", "x_", ""] {
            let err = validate_server_name(bad).unwrap_err();
            assert!(matches!(err, CatalogError::Configuration { .. }), "{bad}");
        }
    }

    #[test]
    fn test_tool_names_may_contain_separator() {
        let mut table = RoutingTable::new();
        assert!(table.insert_server("a", vec![tool("b__c", "")]).is_empty());
        assert!(table.insert_server("a_b", vec![tool("c", "")]).is_empty());
        assert_eq!(table.server_for("a__b__c"), Some("a"));
        assert_eq!(table.server_for("a_b__c"), Some("a_b"));
        assert!(table.insert_server("_a", vec![tool("_c", "")]).is_empty());
        assert_eq!(table.server_for("_a___c"), Some("_a"));
    }

    #[test]
    fn test_search_is_case_insensitive() {
        let mut table = RoutingTable::new();
        table.insert_server("web", vec![tool("fetch", "Download a URL"), tool("ping", "Check host")]);
        let hits: Vec<_> = table.search("url").iter().map(|r| r.name.clone()).collect();
        assert_eq!(hits, vec!["fetch".to_string()]);
        assert_eq!(table.search("WEB__").len(), 2);
    }
}
