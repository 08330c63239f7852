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

//! Server descriptor sources and file loading.
//!
//! Two layouts are accepted, as JSON or YAML:
//!
//! - catalog: `{"servers": {name: {command, args, environment, transport, ...}}}`
//!   (or `servers` as a list of objects carrying `name`);
//! - desktop client: `{"mcpServers": {name: {command, args, env}}}`, where an
//!   `env` value of the form `${VAR}` declares a required variable and any
//!   other value becomes that variable's default.
//!
//! JSON input goes through [`repair`](crate::catalog::repair) first.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::catalog::repair::repair;
use crate::catalog::routing::validate_server_name;
use crate::engine_core::errors::CatalogError;
use crate::engine_core::models::{EnvRequirement, ServerDescriptor, TransportKind};
use crate::engine_core::traits::DescriptorSource;

/// Name given to a lone server object pasted without a surrounding map.
const UNNAMED_SERVER: &str = "unnamed_server";

/// Fixed, in-memory set of descriptors.
#[derive(Debug, Clone, Default)]
pub struct StaticDescriptors {
    descriptors: Vec<ServerDescriptor>,
}

impl StaticDescriptors {
    /// Later duplicates of a name are dropped.
    pub fn new(descriptors: Vec<ServerDescriptor>) -> Self {
        let mut seen = std::collections::HashSet::new();
        let descriptors = descriptors
            .into_iter()
            .filter(|d| {
                let fresh = seen.insert(d.name.clone());
                if !fresh {
                    warn!(server = %d.name, "Duplicate server descriptor ignored");
                }
                fresh
            })
            .collect();
        Self { descriptors }
    }

    pub fn from_file(path: &Path) -> Result<Self, CatalogError> {
        let source_name = path.display().to_string();
        let text = std::fs::read_to_string(path).map_err(|e| CatalogError::DescriptorLoad {
            source_name: source_name.clone(),
            reason: e.to_string(),
            line: None,
            column: None,
        })?;

        let yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        let loaded = if yaml {
            Self::parse_yaml(&source_name, &text)?
        } else {
            Self::parse_json(&source_name, &text)?
        };
        info!(
            "Loaded {} server descriptors from {}",
            loaded.descriptors.len(),
            source_name
        );
        Ok(loaded)
    }

    /// Parse JSON text after the bounded repair pass.
    pub fn parse_json(source_name: &str, text: &str) -> Result<Self, CatalogError> {
        let repaired = repair(text);
        if repaired.fixes > 0 {
            debug!("Applied {} JSON repairs to {}", repaired.fixes, source_name);
        }
        let value: Value = serde_json::from_str(&repaired.text).map_err(|e| {
            let (line, column) = repaired.original_position(e.line(), e.column());
            let message = e.to_string();
            let reason = message
                .split(" at line ")
                .next()
                .unwrap_or(&message)
                .to_string();
            CatalogError::DescriptorLoad {
                source_name: source_name.to_string(),
                reason,
                line: Some(line),
                column: Some(column),
            }
        })?;
        Self::from_value(source_name, value)
    }

    pub fn parse_yaml(source_name: &str, text: &str) -> Result<Self, CatalogError> {
        let value: Value = serde_yaml_ng::from_str(text).map_err(|e| {
            let location = e.location();
            CatalogError::DescriptorLoad {
                source_name: source_name.to_string(),
                reason: e.to_string(),
                line: location.as_ref().map(|l| l.line()),
                column: location.as_ref().map(|l| l.column()),
            }
        })?;
        Self::from_value(source_name, value)
    }

    pub fn from_value(source_name: &str, value: Value) -> Result<Self, CatalogError> {
        let entries = extract_entries(source_name, value)?;
        let descriptors = entries
            .into_iter()
            .map(|(name, entry)| build_descriptor(source_name, name, entry))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(descriptors))
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

impl DescriptorSource for StaticDescriptors {
    fn descriptors(&self) -> Vec<ServerDescriptor> {
        self.descriptors.clone()
    }

    fn descriptor(&self, name: &str) -> Option<ServerDescriptor> {
        self.descriptors.iter().find(|d| d.name == name).cloned()
    }
}

fn load_error(source_name: &str, reason: impl Into<String>) -> CatalogError {
    CatalogError::DescriptorLoad {
        source_name: source_name.to_string(),
        reason: reason.into(),
        line: None,
        column: None,
    }
}

/// Flatten any accepted top-level shape into `(name, entry)` pairs.
fn extract_entries(source_name: &str, value: Value) -> Result<Vec<(String, Value)>, CatalogError> {
    match value {
        Value::Object(mut root) => {
            let servers = root
                .remove("mcpServers")
                .or_else(|| root.remove("servers"));
            match servers {
                Some(Value::Object(map)) => Ok(map.into_iter().collect()),
                Some(Value::Array(list)) => named_list(source_name, list),
                Some(_) => Err(load_error(source_name, "server list must be an object or array")),
                None if root.contains_key("command") => {
                    Ok(vec![(UNNAMED_SERVER.to_string(), Value::Object(root))])
                }
                None => Ok(root.into_iter().collect()),
            }
        }
        Value::Array(list) => named_list(source_name, list),
        Value::Null => Ok(Vec::new()),
        _ => Err(load_error(
            source_name,
            "expected an object with 'mcpServers' or 'servers'",
        )),
    }
}

fn named_list(source_name: &str, list: Vec<Value>) -> Result<Vec<(String, Value)>, CatalogError> {
    list.into_iter()
        .enumerate()
        .map(|(i, entry)| {
            let name = entry
                .get("name")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("server_{}", i));
            if !entry.is_object() {
                return Err(load_error(source_name, format!("entry {} is not an object", i)));
            }
            Ok((name, entry))
        })
        .collect()
}

fn build_descriptor(
    source_name: &str,
    name: String,
    entry: Value,
) -> Result<ServerDescriptor, CatalogError> {
    let Value::Object(entry) = entry else {
        return Err(load_error(source_name, format!("server '{}' is not an object", name)));
    };
    let name = entry
        .get("name")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or(name);
    validate_server_name(&name).map_err(|e| load_error(source_name, e.to_string()))?;
    let invalid = |what: &str| load_error(source_name, format!("server '{}': {}", name, what));

    let transport = match entry.get("transport").or_else(|| entry.get("type")) {
        None => TransportKind::Stdio,
        Some(v) => serde_json::from_value(v.clone())
            .map_err(|_| invalid(&format!("unknown transport {}", v)))?,
    };

    let command = match entry.get("command") {
        Some(Value::String(c)) if !c.trim().is_empty() => c.clone(),
        Some(_) => return Err(invalid("'command' must be a non-empty string")),
        None if transport == TransportKind::Stdio => return Err(invalid("missing 'command'")),
        None => String::new(),
    };

    let args = match entry.get("args") {
        None => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|a| match a {
                Value::String(s) => Ok(s.clone()),
                Value::Number(n) => Ok(n.to_string()),
                _ => Err(invalid("'args' must contain strings")),
            })
            .collect::<Result<Vec<_>, _>>()?,
        Some(_) => return Err(invalid("'args' must be an array")),
    };

    let mut environment = match entry.get("environment") {
        None => BTreeMap::new(),
        Some(env) => parse_environment(env).map_err(|e| invalid(&e))?,
    };
    if let Some(Value::Object(env)) = entry.get("env") {
        for (var, requirement) in desktop_env(env) {
            environment.entry(var).or_insert(requirement);
        }
    }

    Ok(ServerDescriptor {
        name,
        command,
        args,
        environment,
        transport,
        description: entry
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string),
        cwd: entry.get("cwd").and_then(Value::as_str).map(PathBuf::from),
    })
}

/// Catalog `environment`: a map of declarations, or a list of names (all required).
fn parse_environment(value: &Value) -> Result<BTreeMap<String, EnvRequirement>, String> {
    match value {
        Value::Object(_) => serde_json::from_value(value.clone()).map_err(|e| e.to_string()),
        Value::Array(names) => names
            .iter()
            .map(|n| {
                n.as_str()
                    .map(|s| (s.to_string(), EnvRequirement::required()))
                    .ok_or_else(|| "environment names must be strings".to_string())
            })
            .collect(),
        _ => Err("'environment' must be an object or array".to_string()),
    }
}

/// Desktop `env`: `${VAR}` is a required reference, anything else a default.
fn desktop_env(env: &Map<String, Value>) -> Vec<(String, EnvRequirement)> {
    env.iter()
        .map(|(var, value)| {
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let is_reference = text.starts_with("${") && text.ends_with('}');
            let requirement = if is_reference {
                EnvRequirement::required()
            } else {
                EnvRequirement {
                    required: false,
                    description: None,
                    default: Some(text),
                }
            };
            (var.clone(), requirement)
        })
        .collect()
}
