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

//! Discovery and proxy orchestration.
//!
//! The orchestrator owns one protocol session per server and the published
//! routing table. Discovery fans out over every descriptor concurrently and
//! collects per-server outcomes; invocation resolves a display name against
//! a snapshot of the table, so a concurrent refresh never changes the route
//! of a call already in flight.

use chrono::Utc;
use futures::future::join_all;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::catalog::routing::{validate_server_name, RoutingTable};
use crate::catalog::validation::prepare_arguments;
use crate::config::{Config, LifecyclePolicy};
use crate::engine_core::constants::defaults;
use crate::engine_core::env::{check_readiness, ProcessEnv};
use crate::engine_core::errors::{CatalogError, ErrorPayload};
use crate::engine_core::models::{
    DiscoveryOutcome, DiscoveryReport, Readiness, ServerDescriptor, ToolDefinition, ToolRecord,
    TransportKind,
};
use crate::engine_core::traits::{DescriptorSource, EnvResolver};
use crate::mcp::process::CommandLauncher;
use crate::mcp::session::{ProtocolSession, SessionOptions};
use crate::mcp::supervisor::{backoff_delay, ProcessSupervisor};

/// Readiness predicate handed to [`Orchestrator::discover_all`].
pub type ReadinessCheck<'a> = &'a (dyn Fn(&ServerDescriptor) -> Readiness + Send + Sync);

type SessionSlot = Arc<tokio::sync::Mutex<Option<Arc<ProtocolSession>>>>;

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub lifecycle: LifecyclePolicy,
    pub handshake_attempts: u32,
    pub backoff: Duration,
    pub session: SessionOptions,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            lifecycle: LifecyclePolicy::default(),
            handshake_attempts: defaults::HANDSHAKE_ATTEMPTS,
            backoff: Duration::from_millis(defaults::BACKOFF_MS),
            session: SessionOptions::default(),
        }
    }
}

pub struct Orchestrator {
    supervisor: Arc<ProcessSupervisor>,
    descriptors: Arc<dyn DescriptorSource>,
    env: Arc<dyn EnvResolver>,
    options: OrchestratorOptions,
    routing: RwLock<Arc<RoutingTable>>,
    report: RwLock<Arc<DiscoveryReport>>,
    /// Descriptors seen by the last discovery pass, for on-demand starts.
    known: RwLock<HashMap<String, ServerDescriptor>>,
    sessions: Mutex<HashMap<String, SessionSlot>>,
    closing: AtomicBool,
}

impl Orchestrator {
    pub fn new(
        supervisor: Arc<ProcessSupervisor>,
        descriptors: Arc<dyn DescriptorSource>,
        env: Arc<dyn EnvResolver>,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            supervisor,
            descriptors,
            env,
            options,
            routing: RwLock::new(Arc::new(RoutingTable::new())),
            report: RwLock::new(Arc::new(DiscoveryReport::empty())),
            known: RwLock::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            closing: AtomicBool::new(false),
        }
    }

    /// Real processes, process environment, knobs from `config`.
    pub fn from_config(config: &Config, descriptors: Arc<dyn DescriptorSource>) -> Self {
        let env: Arc<dyn EnvResolver> = Arc::new(ProcessEnv);
        let supervisor = Arc::new(ProcessSupervisor::new(
            Arc::new(CommandLauncher),
            env.clone(),
            config.supervisor_options(),
        ));
        Self::new(supervisor, descriptors, env, config.orchestrator_options())
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    pub fn options(&self) -> &OrchestratorOptions {
        &self.options
    }

    // ---------------------------------------------------------------------
    // Discovery
    // ---------------------------------------------------------------------

    /// Discover every descriptor from the configured source.
    pub async fn discover(&self) -> DiscoveryReport {
        let descriptors = self.descriptors.descriptors();
        let env = self.env.clone();
        let readiness = move |d: &ServerDescriptor| check_readiness(d, env.as_ref());
        self.discover_all(&descriptors, &readiness).await
    }

    /// Rebuild the routing table. Readers keep the old table until the new
    /// one is complete.
    pub async fn refresh(&self) -> DiscoveryReport {
        info!("Refreshing tool catalog");
        self.discover().await
    }

    /// Run one discovery pass over `descriptors` and publish the result.
    ///
    /// Servers whose readiness check fails are skipped without spawning.
    /// Per-server failures are recorded in the report, never returned.
    pub async fn discover_all(
        &self,
        descriptors: &[ServerDescriptor],
        readiness: ReadinessCheck<'_>,
    ) -> DiscoveryReport {
        let mut seen = HashSet::new();
        let descriptors: Vec<&ServerDescriptor> = descriptors
            .iter()
            .filter(|d| seen.insert(d.name.as_str()))
            .collect();
        info!(servers = descriptors.len(), "Starting discovery pass");

        {
            let mut known = self.known.write().unwrap_or_else(PoisonError::into_inner);
            for descriptor in &descriptors {
                known.insert(descriptor.name.clone(), (*descriptor).clone());
            }
        }

        let results = join_all(descriptors.iter().map(|d| self.discover_one(d, readiness))).await;

        let mut table = RoutingTable::new();
        let mut servers = BTreeMap::new();
        let mut collisions = Vec::new();
        for (descriptor, result) in descriptors.iter().zip(results) {
            let outcome = match result {
                Ok(tools) => {
                    collisions.extend(table.insert_server(&descriptor.name, tools));
                    DiscoveryOutcome::Discovered {
                        tools: table
                            .tools_for_server(&descriptor.name)
                            .iter()
                            .map(|r| r.display_name.clone())
                            .collect(),
                    }
                }
                Err(outcome) => outcome,
            };
            servers.insert(descriptor.name.clone(), outcome);
        }

        let report = DiscoveryReport {
            servers,
            collisions,
            total_tools: table.len(),
            completed_at: Utc::now(),
        };
        info!(
            tools = report.total_tools,
            succeeded = report.succeeded().count(),
            servers = report.servers.len(),
            "Discovery pass complete"
        );

        *self.routing.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(table);
        *self.report.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(report.clone());
        report
    }

    async fn discover_one(
        &self,
        descriptor: &ServerDescriptor,
        readiness: ReadinessCheck<'_>,
    ) -> Result<Vec<ToolDefinition>, DiscoveryOutcome> {
        let name = descriptor.name.as_str();

        if let Err(e) = validate_server_name(name) {
            error!(server = %name, "Rejecting server: {}", e);
            return Err(DiscoveryOutcome::Failed {
                kind: e.kind(),
                reason: e.to_string(),
            });
        }

        if descriptor.transport != TransportKind::Stdio {
            let reason = CatalogError::UnsupportedTransport {
                server: name.to_string(),
                transport: descriptor.transport.to_string(),
            }
            .to_string();
            warn!(server = %name, "Skipping server: {}", reason);
            return Err(DiscoveryOutcome::Skipped {
                reason,
                missing_env: Vec::new(),
            });
        }

        let readiness = readiness(descriptor);
        if !readiness.ready {
            warn!(server = %name, missing = ?readiness.missing_env, "Skipping server with missing configuration");
            return Err(DiscoveryOutcome::Skipped {
                reason: format!(
                    "missing required environment variables: {}",
                    readiness.missing_env.join(", ")
                ),
                missing_env: readiness.missing_env,
            });
        }

        let was_running = self.supervisor.is_running(name);
        let listed = match self.ensure_session(descriptor).await {
            Ok(session) => session.list_tools().await,
            Err(e) => Err(e),
        };

        if self.options.lifecycle == LifecyclePolicy::StopAfterDiscovery && !was_running {
            self.release(name).await;
        }

        match listed {
            Ok(tools) => {
                info!(server = %name, tools = tools.len(), "Discovered tools");
                Ok(tools)
            }
            Err(e) => {
                error!(server = %name, "Discovery failed: {}", e);
                Err(DiscoveryOutcome::Failed {
                    kind: e.kind(),
                    reason: e.to_string(),
                })
            }
        }
    }

    // ---------------------------------------------------------------------
    // Invocation
    // ---------------------------------------------------------------------

    /// Call a tool by display name, starting its server on demand.
    pub async fn invoke(&self, display_name: &str, arguments: Value) -> Result<Value, CatalogError> {
        // The route is fixed here; a refresh that lands later does not move it.
        let routing = self.routing_snapshot();
        let record = routing
            .resolve(display_name)
            .cloned()
            .ok_or_else(|| CatalogError::ToolNotFound {
                name: display_name.to_string(),
            })?;
        drop(routing);

        let arguments = prepare_arguments(&record, arguments)?;
        let descriptor = self.descriptor(&record.server)?;
        let session = self.ensure_session(&descriptor).await?;

        debug!(server = %record.server, tool = %record.name, "Invoking tool");
        session.call_tool(&record.name, arguments).await
    }

    /// [`invoke`](Self::invoke) with the error flattened to its payload.
    pub async fn invoke_payload(
        &self,
        display_name: &str,
        arguments: Value,
    ) -> Result<Value, ErrorPayload> {
        self.invoke(display_name, arguments)
            .await
            .map_err(|e| e.payload())
    }

    // ---------------------------------------------------------------------
    // Collaborator interface
    // ---------------------------------------------------------------------

    pub fn check_readiness(&self, name: &str) -> Result<Readiness, CatalogError> {
        let descriptor = self.descriptor(name)?;
        Ok(check_readiness(&descriptor, self.env.as_ref()))
    }

    /// Start `name` if it is not already running. False if it cannot be.
    pub async fn ensure_running(&self, name: &str) -> bool {
        match self.descriptor(name) {
            Ok(descriptor) => self.supervisor.ensure_running(name, &descriptor).await,
            Err(e) => {
                warn!(server = %name, "Cannot start server: {}", e);
                false
            }
        }
    }

    /// Close every session and stop every process. Terminal.
    pub async fn shutdown(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down orchestrator");
        self.supervisor.stop_all().await;

        let slots: Vec<SessionSlot> = self.lock_sessions().drain().map(|(_, s)| s).collect();
        for slot in slots {
            if let Some(session) = slot.lock().await.take() {
                session.close();
            }
        }
        // Starts that raced the first sweep.
        self.supervisor.stop_all().await;
    }

    // ---------------------------------------------------------------------
    // Introspection
    // ---------------------------------------------------------------------

    pub fn list_tools(&self) -> Vec<ToolRecord> {
        self.routing_snapshot().tools().cloned().collect()
    }

    pub fn tools_for_server(&self, server: &str) -> Vec<ToolRecord> {
        self.routing_snapshot().tools_for_server(server).to_vec()
    }

    pub fn search_tools(&self, query: &str) -> Vec<ToolRecord> {
        self.routing_snapshot()
            .search(query)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn tool_details(&self, display_name: &str) -> Option<ToolRecord> {
        self.routing_snapshot().resolve(display_name).cloned()
    }

    pub fn discovery_report(&self) -> Arc<DiscoveryReport> {
        self.report
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Names from the descriptor source, in source order.
    pub fn descriptor_names(&self) -> Vec<String> {
        self.descriptors
            .descriptors()
            .into_iter()
            .map(|d| d.name)
            .collect()
    }

    pub fn running_servers(&self) -> Vec<String> {
        self.supervisor.running()
    }

    // ---------------------------------------------------------------------
    // Sessions
    // ---------------------------------------------------------------------

    fn routing_snapshot(&self) -> Arc<RoutingTable> {
        self.routing
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn descriptor(&self, name: &str) -> Result<ServerDescriptor, CatalogError> {
        let known = self
            .known
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned();
        known
            .or_else(|| self.descriptors.descriptor(name))
            .ok_or_else(|| CatalogError::Configuration {
                server: name.to_string(),
                reason: "no descriptor for server".to_string(),
            })
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<String, SessionSlot>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session_slot(&self, name: &str) -> SessionSlot {
        self.lock_sessions()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    fn shut_down_error(name: &str) -> CatalogError {
        CatalogError::transport(name, "orchestrator is shut down")
    }

    /// A ready session for `descriptor`. Callers for the same server queue on
    /// its slot, so at most one handshake per server is in flight.
    async fn ensure_session(
        &self,
        descriptor: &ServerDescriptor,
    ) -> Result<Arc<ProtocolSession>, CatalogError> {
        let name = descriptor.name.as_str();
        if self.closing.load(Ordering::SeqCst) {
            return Err(Self::shut_down_error(name));
        }

        let slot = self.session_slot(name);
        let mut current = slot.lock().await;
        if let Some(session) = current.as_ref() {
            if session.is_ready() {
                return Ok(session.clone());
            }
            debug!(server = %name, state = %session.state(), "Discarding unusable session");
            session.close();
            *current = None;
            self.supervisor.stop(name).await;
        }

        let session = self.open_session(descriptor).await?;
        *current = Some(session.clone());
        Ok(session)
    }

    async fn open_session(
        &self,
        descriptor: &ServerDescriptor,
    ) -> Result<Arc<ProtocolSession>, CatalogError> {
        let name = descriptor.name.as_str();
        let attempts = self.options.handshake_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            if self.closing.load(Ordering::SeqCst) {
                return Err(Self::shut_down_error(name));
            }
            // Spawn retries live in the supervisor.
            let process = self.supervisor.start(name, descriptor).await?;
            let session = Arc::new(ProtocolSession::new(process, self.options.session.clone()));

            match session.handshake().await {
                Ok(info) => {
                    info!(
                        server = %name,
                        protocol = %info.protocol_version,
                        server_name = ?info.name,
                        "Session ready"
                    );
                    return Ok(session);
                }
                Err(e) => {
                    warn!(server = %name, attempt, "Handshake failed: {}", e);
                    self.supervisor.stop(name).await;
                    let retryable = e.is_retryable();
                    last_error = Some(e);
                    if !retryable {
                        break;
                    }
                    if attempt < attempts {
                        tokio::time::sleep(backoff_delay(self.options.backoff, attempt)).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| CatalogError::HandshakeFailed {
            server: name.to_string(),
            reason: "no handshake attempts made".to_string(),
        }))
    }

    /// Drop the session and stop the process of `name`.
    async fn release(&self, name: &str) {
        let slot = self.session_slot(name);
        let mut current = slot.lock().await;
        if let Some(session) = current.take() {
            session.close();
        }
        self.supervisor.stop(name).await;
        debug!(server = %name, "Released server after discovery");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::descriptors::StaticDescriptors;
    use crate::engine_core::env::MapEnv;
    use crate::engine_core::errors::ErrorKind;
    use crate::engine_core::models::EnvRequirement;
    use crate::mcp::process::{Launcher, ProcessHandle};
    use crate::mcp::supervisor::SupervisorOptions;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    /// In-memory MCP servers advertising `tools` and echoing call arguments.
    #[derive(Default)]
    struct FakeLauncher {
        spawned: AtomicUsize,
        tools: HashMap<String, Vec<&'static str>>,
    }

    #[async_trait]
    impl Launcher for FakeLauncher {
        async fn launch(
            &self,
            descriptor: &ServerDescriptor,
            _env: &dyn EnvResolver,
            _overrides: &BTreeMap<String, String>,
        ) -> Result<ProcessHandle, CatalogError> {
            self.spawned.fetch_add(1, Ordering::SeqCst);
            let tools: Vec<Value> = self
                .tools
                .get(&descriptor.name)
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .map(|t| json!({"name": t, "inputSchema": {"type": "object"}}))
                .collect();

            let (ours_in, theirs_in) = tokio::io::duplex(8192);
            let (mut theirs_out, ours_out) = tokio::io::duplex(8192);
            tokio::spawn(async move {
                let mut lines = BufReader::new(theirs_in).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let req: Value = serde_json::from_str(&line).unwrap();
                    let Some(id) = req.get("id").cloned() else { continue };
                    let result = match req["method"].as_str() {
                        Some("initialize") => {
                            json!({"protocolVersion": "2024-11-05", "capabilities": {"tools": {}}})
                        }
                        Some("tools/list") => json!({ "tools": tools }),
                        Some("tools/call") => req["params"]["arguments"].clone(),
                        _ => Value::Null,
                    };
                    let mut out =
                        serde_json::to_vec(&json!({"jsonrpc": "2.0", "id": id, "result": result}))
                            .unwrap();
                    out.push(b'\n');
                    if theirs_out.write_all(&out).await.is_err() {
                        break;
                    }
                }
            });
            Ok(ProcessHandle::from_streams(
                &descriptor.name,
                ours_in,
                ours_out,
                None::<DuplexStream>,
            ))
        }
    }

    fn orchestrator(
        descriptors: Vec<ServerDescriptor>,
        tools: &[(&str, Vec<&'static str>)],
        lifecycle: LifecyclePolicy,
    ) -> (Orchestrator, Arc<FakeLauncher>) {
        let launcher = Arc::new(FakeLauncher {
            spawned: AtomicUsize::new(0),
            tools: tools
                .iter()
                .map(|(n, t)| (n.to_string(), t.clone()))
                .collect(),
        });
        let env: Arc<dyn EnvResolver> = Arc::new(MapEnv::new());
        let supervisor = Arc::new(ProcessSupervisor::new(
            launcher.clone(),
            env.clone(),
            SupervisorOptions {
                backoff: Duration::from_millis(1),
                stop_grace: Duration::from_millis(10),
                ..Default::default()
            },
        ));
        let options = OrchestratorOptions {
            lifecycle,
            backoff: Duration::from_millis(1),
            ..Default::default()
        };
        let source = Arc::new(StaticDescriptors::new(descriptors));
        (Orchestrator::new(supervisor, source, env, options), launcher)
    }

    #[tokio::test]
    async fn test_discover_and_invoke() {
        let (orch, _) = orchestrator(
            vec![
                ServerDescriptor::stdio("fs", "fs", &[]),
                ServerDescriptor::stdio("git", "git", &[]),
            ],
            &[("fs", vec!["read_file"]), ("git", vec!["log", "diff"])],
            LifecyclePolicy::KeepRunning,
        );

        let report = orch.discover().await;
        assert_eq!(report.total_tools, 3);
        assert_eq!(report.succeeded().count(), 2);
        assert_eq!(orch.tools_for_server("git").len(), 2);

        let out = orch.invoke("fs__read_file", json!({"x": 1})).await.unwrap();
        assert_eq!(out, json!({"x": 1}));
        assert_eq!(orch.running_servers(), vec!["fs".to_string(), "git".to_string()]);
        orch.shutdown().await;
        assert!(orch.running_servers().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_tool_is_not_found() {
        let (orch, _) = orchestrator(vec![], &[], LifecyclePolicy::KeepRunning);
        let err = orch.invoke("nope__tool", json!({})).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ToolNotFound);
        let payload = orch.invoke_payload("nope__tool", json!({})).await.unwrap_err();
        assert_eq!(payload.kind, ErrorKind::ToolNotFound);
    }

    #[tokio::test]
    async fn test_missing_env_skips_without_spawning() {
        let desc = ServerDescriptor::stdio("search", "search", &[])
            .with_env("API_KEY", EnvRequirement::required());
        let (orch, launcher) =
            orchestrator(vec![desc], &[("search", vec!["q"])], LifecyclePolicy::KeepRunning);

        let readiness = orch.check_readiness("search").unwrap();
        assert!(!readiness.ready);
        assert_eq!(readiness.missing_env, vec!["API_KEY".to_string()]);

        let report = orch.discover().await;
        match report.outcome("search") {
            Some(DiscoveryOutcome::Skipped { missing_env, .. }) => {
                assert_eq!(missing_env, &vec!["API_KEY".to_string()])
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(launcher.spawned.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stop_after_discovery_restarts_on_demand() {
        let (orch, launcher) = orchestrator(
            vec![ServerDescriptor::stdio("fs", "fs", &[])],
            &[("fs", vec!["stat"])],
            LifecyclePolicy::StopAfterDiscovery,
        );

        orch.discover().await;
        assert!(orch.running_servers().is_empty());
        assert_eq!(orch.list_tools().len(), 1);

        let out = orch.invoke("fs__stat", json!({"path": "/"})).await.unwrap();
        assert_eq!(out["path"], "/");
        assert_eq!(launcher.spawned.load(Ordering::SeqCst), 2);
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_remote_transport_skipped() {
        let mut remote = ServerDescriptor::stdio("remote", "", &[]);
        remote.transport = TransportKind::Http;
        let (orch, launcher) = orchestrator(vec![remote], &[], LifecyclePolicy::KeepRunning);

        let report = orch.discover().await;
        assert!(matches!(
            report.outcome("remote"),
            Some(DiscoveryOutcome::Skipped { .. })
        ));
        assert_eq!(launcher.spawned.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_invalid_arguments_rejected_before_dispatch() {
        let (orch, _) = orchestrator(
            vec![ServerDescriptor::stdio("fs", "fs", &[])],
            &[("fs", vec!["stat"])],
            LifecyclePolicy::KeepRunning,
        );
        orch.discover().await;
        let err = orch.invoke("fs__stat", json!([1])).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArguments);
        orch.shutdown().await;
    }
}
