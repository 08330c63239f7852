#![allow(dead_code)]

use async_trait::async_trait;
use mcp_catalog::catalog::descriptors::StaticDescriptors;
use mcp_catalog::catalog::orchestrator::OrchestratorOptions;
use mcp_catalog::config::LifecyclePolicy;
use mcp_catalog::engine_core::env::MapEnv;
use mcp_catalog::engine_core::models::ServerDescriptor;
use mcp_catalog::engine_core::traits::EnvResolver;
use mcp_catalog::mcp::process::{Launcher, ProcessHandle};
use mcp_catalog::mcp::session::SessionOptions;
use mcp_catalog::mcp::supervisor::{ProcessSupervisor, SupervisorOptions};
use mcp_catalog::{CatalogError, Orchestrator};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::mpsc;

/// Behaviour of one in-memory MCP server.
#[derive(Debug, Clone, Default)]
pub struct FakeServer {
    pub tools: Vec<String>,
    /// Calls to this tool are never answered; once `.1` of them are pending
    /// the server exits, closing its stdout.
    pub crash_on: Option<(String, usize)>,
    pub call_delay: Duration,
    pub reject_initialize: bool,
}

impl FakeServer {
    pub fn with_tools(tools: &[&str]) -> Self {
        Self {
            tools: tools.iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        }
    }
}

/// Launcher serving [`FakeServer`]s over duplex pipes. Configuration is read
/// per request, so changing it affects children that are already running.
#[derive(Default)]
pub struct FakeLauncher {
    servers: Mutex<HashMap<String, Arc<Mutex<FakeServer>>>>,
    spawned: Mutex<HashMap<String, usize>>,
}

impl FakeLauncher {
    pub fn new(servers: &[(&str, FakeServer)]) -> Arc<Self> {
        let launcher = Self::default();
        for (name, server) in servers {
            launcher.set(name, server.clone());
        }
        Arc::new(launcher)
    }

    pub fn set(&self, name: &str, server: FakeServer) {
        let mut servers = self.servers.lock().unwrap();
        match servers.get(name) {
            Some(existing) => *existing.lock().unwrap() = server,
            None => {
                servers.insert(name.to_string(), Arc::new(Mutex::new(server)));
            }
        }
    }

    pub fn spawned(&self, name: &str) -> usize {
        self.spawned.lock().unwrap().get(name).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn launch(
        &self,
        descriptor: &ServerDescriptor,
        _env: &dyn EnvResolver,
        _overrides: &BTreeMap<String, String>,
    ) -> Result<ProcessHandle, CatalogError> {
        let config = self
            .servers
            .lock()
            .unwrap()
            .get(&descriptor.name)
            .cloned()
            .ok_or_else(|| CatalogError::Start {
                server: descriptor.name.clone(),
                reason: "no such program".to_string(),
            })?;
        *self
            .spawned
            .lock()
            .unwrap()
            .entry(descriptor.name.clone())
            .or_default() += 1;

        let (ours_in, theirs_in) = tokio::io::duplex(64 * 1024);
        let (theirs_out, ours_out) = tokio::io::duplex(64 * 1024);
        tokio::spawn(serve(config, theirs_in, theirs_out));
        Ok(ProcessHandle::from_streams(
            &descriptor.name,
            ours_in,
            ours_out,
            None::<DuplexStream>,
        ))
    }
}

async fn serve(config: Arc<Mutex<FakeServer>>, input: DuplexStream, mut output: DuplexStream) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let mut line = serde_json::to_vec(&message).unwrap();
            line.push(b'\n');
            if output.write_all(&line).await.is_err() {
                break;
            }
        }
    });

    let mut lines = BufReader::new(input).lines();
    let mut stuck = 0;
    while let Ok(Some(line)) = lines.next_line().await {
        let Ok(request) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        let Some(id) = request.get("id").cloned() else {
            continue;
        };
        let server = config.lock().unwrap().clone();
        let reply = |result: Value| json!({"jsonrpc": "2.0", "id": id, "result": result});

        match request["method"].as_str() {
            Some("initialize") if server.reject_initialize => {
                let _ = tx.send(json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": -32603, "message": "not today"}
                }));
            }
            Some("initialize") => {
                let _ = tx.send(reply(json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "fake", "version": "1.0"}
                })));
            }
            Some("tools/list") => {
                let tools: Vec<Value> = server
                    .tools
                    .iter()
                    .map(|t| json!({"name": t, "description": format!("{} tool", t), "inputSchema": {"type": "object"}}))
                    .collect();
                let _ = tx.send(reply(json!({ "tools": tools })));
            }
            Some("tools/call") => {
                let tool = request["params"]["name"].as_str().unwrap_or_default();
                if let Some((crash_tool, after)) = &server.crash_on {
                    if tool == crash_tool {
                        stuck += 1;
                        if stuck >= *after {
                            break;
                        }
                        continue;
                    }
                }
                let response = reply(request["params"]["arguments"].clone());
                let tx = tx.clone();
                let delay = server.call_delay;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(response);
                });
            }
            _ => {
                let _ = tx.send(reply(Value::Null));
            }
        }
    }
    // Exit: stdout closes immediately, answered or not.
    writer.abort();
}

pub fn supervisor(launcher: Arc<dyn Launcher>, env: Arc<dyn EnvResolver>) -> Arc<ProcessSupervisor> {
    Arc::new(ProcessSupervisor::new(
        launcher,
        env,
        SupervisorOptions {
            start_attempts: 2,
            backoff: Duration::from_millis(5),
            stop_grace: Duration::from_millis(200),
            ..Default::default()
        },
    ))
}

pub fn options(lifecycle: LifecyclePolicy) -> OrchestratorOptions {
    OrchestratorOptions {
        lifecycle,
        handshake_attempts: 2,
        backoff: Duration::from_millis(5),
        session: SessionOptions {
            handshake_timeout: Duration::from_secs(5),
            list_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(5),
            ..Default::default()
        },
    }
}

pub fn orchestrator(
    launcher: Arc<dyn Launcher>,
    descriptors: Vec<ServerDescriptor>,
    env: MapEnv,
    lifecycle: LifecyclePolicy,
) -> Orchestrator {
    let env: Arc<dyn EnvResolver> = Arc::new(env);
    Orchestrator::new(
        supervisor(launcher, env.clone()),
        Arc::new(StaticDescriptors::new(descriptors)),
        env,
        options(lifecycle),
    )
}

/// A line-oriented MCP server in POSIX sh. Advertises `echo` (answers
/// `{"x":1}`) and `crash` (exits without answering).
pub const STUB_SERVER: &str = r#"#!/bin/sh
echo "stub server up" >&2
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id":"\([^"]*\)".*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":"%s","result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"stub","version":"0.1"}}}\n' "$id" ;;
    *'"method":"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":"%s","result":{"tools":[{"name":"echo","description":"Echo","inputSchema":{"type":"object"}},{"name":"crash","description":"Exit","inputSchema":{"type":"object"}}]}}\n' "$id" ;;
    *'"name":"crash"'*)
      echo "crashing" >&2
      exit 3 ;;
    *'"method":"tools/call"'*)
      printf '{"jsonrpc":"2.0","id":"%s","result":{"x":1}}\n' "$id" ;;
  esac
done
"#;

pub fn write_stub_server(dir: &Path) -> PathBuf {
    let path = dir.join("stub_server.sh");
    std::fs::write(&path, STUB_SERVER).unwrap();
    path
}

pub fn stub_descriptor(name: &str, script: &Path) -> ServerDescriptor {
    ServerDescriptor::stdio(name, "sh", &[script.to_str().unwrap()])
}
