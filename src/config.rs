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

use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::catalog::orchestrator::OrchestratorOptions;
use crate::engine_core::constants::{config as keys, defaults, protocol};
use crate::mcp::session::SessionOptions;
use crate::mcp::supervisor::SupervisorOptions;

/// What happens to processes a discovery pass started once the pass is over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePolicy {
    /// Keep children running so later invocations reuse them (proxy mode).
    #[default]
    KeepRunning,
    /// Stop children after listing; `invoke` starts them again on demand.
    StopAfterDiscovery,
}

impl FromStr for LifecyclePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "keep_running" | "proxy" => Ok(LifecyclePolicy::KeepRunning),
            "stop_after_discovery" | "discover_only" => Ok(LifecyclePolicy::StopAfterDiscovery),
            other => Err(format!("unknown lifecycle policy '{}'", other)),
        }
    }
}

impl fmt::Display for LifecyclePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecyclePolicy::KeepRunning => f.write_str("keep_running"),
            LifecyclePolicy::StopAfterDiscovery => f.write_str("stop_after_discovery"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub log_level: String,
    pub log_format: String, // "json" or "text"
    pub servers_path: Option<PathBuf>,
    pub lifecycle: LifecyclePolicy,
    pub handshake_timeout_ms: u64,
    pub call_timeout_ms: u64,
    pub list_timeout_ms: u64,
    pub stop_grace_ms: u64,
    pub start_attempts: u32,
    pub handshake_attempts: u32,
    pub backoff_ms: u64,
    pub protocol_version: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unparseable values fall back to
    /// their defaults with a warning.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let base = Self::default();
        Self {
            log_level: lookup(keys::ENV_LOG_LEVEL).unwrap_or(base.log_level),
            log_format: lookup(keys::ENV_LOG_FORMAT).unwrap_or(base.log_format),
            servers_path: lookup(keys::ENV_SERVERS_PATH)
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from),
            lifecycle: parsed(&lookup, keys::ENV_LIFECYCLE, base.lifecycle),
            handshake_timeout_ms: parsed(
                &lookup,
                keys::ENV_HANDSHAKE_TIMEOUT_MS,
                base.handshake_timeout_ms,
            ),
            call_timeout_ms: parsed(&lookup, keys::ENV_CALL_TIMEOUT_MS, base.call_timeout_ms),
            list_timeout_ms: parsed(&lookup, keys::ENV_LIST_TIMEOUT_MS, base.list_timeout_ms),
            stop_grace_ms: parsed(&lookup, keys::ENV_STOP_GRACE_MS, base.stop_grace_ms),
            start_attempts: parsed(&lookup, keys::ENV_START_ATTEMPTS, base.start_attempts),
            handshake_attempts: parsed(
                &lookup,
                keys::ENV_HANDSHAKE_ATTEMPTS,
                base.handshake_attempts,
            ),
            backoff_ms: parsed(&lookup, keys::ENV_BACKOFF_MS, base.backoff_ms),
            protocol_version: lookup(keys::ENV_PROTOCOL_VERSION).unwrap_or(base.protocol_version),
        }
    }

    pub fn supervisor_options(&self) -> SupervisorOptions {
        SupervisorOptions {
            start_attempts: self.start_attempts.max(1),
            backoff: Duration::from_millis(self.backoff_ms),
            stop_grace: Duration::from_millis(self.stop_grace_ms),
            ..Default::default()
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            list_timeout: Duration::from_millis(self.list_timeout_ms),
            call_timeout: Duration::from_millis(self.call_timeout_ms),
            protocol_version: self.protocol_version.clone(),
        }
    }

    pub fn orchestrator_options(&self) -> OrchestratorOptions {
        OrchestratorOptions {
            lifecycle: self.lifecycle,
            handshake_attempts: self.handshake_attempts.max(1),
            backoff: Duration::from_millis(self.backoff_ms),
            session: self.session_options(),
        }
    }
}

fn parsed<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Ignoring invalid value '{}' for {}", raw, key);
            default
        }),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "text".to_string(),
            servers_path: None,
            lifecycle: LifecyclePolicy::KeepRunning,
            handshake_timeout_ms: defaults::HANDSHAKE_TIMEOUT_MS,
            call_timeout_ms: defaults::CALL_TIMEOUT_MS,
            list_timeout_ms: defaults::LIST_TIMEOUT_MS,
            stop_grace_ms: defaults::STOP_GRACE_MS,
            start_attempts: defaults::START_ATTEMPTS,
            handshake_attempts: defaults::HANDSHAKE_ATTEMPTS,
            backoff_ms: defaults::BACKOFF_MS,
            protocol_version: protocol::DEFAULT_PROTOCOL_VERSION.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = Config::from_lookup(lookup(&[]));
        assert_eq!(config.lifecycle, LifecyclePolicy::KeepRunning);
        assert_eq!(config.call_timeout_ms, defaults::CALL_TIMEOUT_MS);
        assert!(config.servers_path.is_none());
    }

    #[test]
    fn test_values_are_read() {
        let config = Config::from_lookup(lookup(&[
            (keys::ENV_LIFECYCLE, "stop-after-discovery"),
            (keys::ENV_CALL_TIMEOUT_MS, "250"),
            (keys::ENV_SERVERS_PATH, "/etc/mcp/servers.yaml"),
        ]));
        assert_eq!(config.lifecycle, LifecyclePolicy::StopAfterDiscovery);
        assert_eq!(config.session_options().call_timeout, Duration::from_millis(250));
        assert_eq!(
            config.servers_path,
            Some(PathBuf::from("/etc/mcp/servers.yaml"))
        );
    }

    #[test]
    fn test_invalid_numbers_fall_back() {
        let config = Config::from_lookup(lookup(&[
            (keys::ENV_START_ATTEMPTS, "many"),
            (keys::ENV_LIFECYCLE, "sometimes"),
        ]));
        assert_eq!(config.start_attempts, defaults::START_ATTEMPTS);
        assert_eq!(config.lifecycle, LifecyclePolicy::KeepRunning);
    }

    #[test]
    fn test_zero_attempts_clamped() {
        let config = Config::from_lookup(lookup(&[(keys::ENV_HANDSHAKE_ATTEMPTS, "0")]));
        assert_eq!(config.orchestrator_options().handshake_attempts, 1);
    }
}
