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

//! Child process handles with Zombie Process Protection.
//!
//! A [`ProcessHandle`] owns one child's three pipes through background tasks
//! (see [`crate::mcp::pipeline`]) and a monitor task that owns the OS
//! process itself. Children are bound to our lifetime: `kill_on_drop`
//! everywhere, plus `PR_SET_PDEATHSIG` on Linux so they die with us even
//! if we are killed without unwinding.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine_core::constants::{defaults, limits};
use crate::engine_core::env::resolve_launch_env;
use crate::engine_core::errors::CatalogError;
use crate::engine_core::models::{ProcessState, ServerDescriptor, TransportKind};
use crate::engine_core::traits::EnvResolver;
use crate::mcp::correlator::Correlator;
use crate::mcp::pipeline::{
    spawn_stderr_drain, spawn_stdin_writer, spawn_stdout_reader, OutboundLine, StderrTail,
};

/// Extra time allowed after the grace period for a SIGKILL to land.
const KILL_SETTLE: Duration = Duration::from_secs(2);

pub struct ProcessHandle {
    name: String,
    pid: Option<u32>,
    correlator: Arc<Correlator>,
    writer: mpsc::Sender<OutboundLine>,
    state: Arc<watch::Sender<ProcessState>>,
    // Taken by the first stop; dropping it unstopped kills the child.
    control: Mutex<Option<oneshot::Sender<Duration>>>,
    stderr: Arc<StderrTail>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    write_timeout: Duration,
}

struct Wiring {
    handle: ProcessHandle,
    control_rx: oneshot::Receiver<Duration>,
    reader: JoinHandle<()>,
}

impl ProcessHandle {
    /// Spawn `descriptor` as a child process.
    ///
    /// The child inherits our environment plus the declared variables
    /// resolved through `env` and `overrides`. A missing required variable
    /// is a [`CatalogError::Configuration`] and nothing is spawned.
    pub fn spawn(
        descriptor: &ServerDescriptor,
        env: &dyn EnvResolver,
        overrides: &BTreeMap<String, String>,
    ) -> Result<Self, CatalogError> {
        if descriptor.transport != TransportKind::Stdio {
            return Err(CatalogError::UnsupportedTransport {
                server: descriptor.name.clone(),
                transport: descriptor.transport.to_string(),
            });
        }
        let launch_env = resolve_launch_env(descriptor, env, overrides)?;
        let name = descriptor.name.clone();

        debug!(
            server = %name,
            "Spawning '{}' with args {:?}", descriptor.command, descriptor.args
        );

        let mut command = Command::new(&descriptor.command);
        command
            .args(&descriptor.args)
            .envs(&launch_env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &descriptor.cwd {
            command.current_dir(cwd);
        }

        // ------------------------------------------------------------------
        // LINUX: PR_SET_PDEATHSIG
        // ------------------------------------------------------------------
        #[cfg(target_os = "linux")]
        // SAFETY: prctl is async-signal-safe and only touches the forked
        // child's own attributes between fork and exec.
        unsafe {
            command.pre_exec(|| {
                // Send SIGKILL to the child if we die
                let ret = libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL);
                if ret != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = command.spawn().map_err(|e| CatalogError::Start {
            server: name.clone(),
            reason: format!("failed to spawn '{}': {}", descriptor.command, e),
        })?;

        let missing = |stream: &str| CatalogError::Start {
            server: name.clone(),
            reason: format!("{} was not captured", stream),
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;
        let pid = child.id();

        let Wiring {
            handle,
            control_rx,
            reader,
        } = Self::wire(name.clone(), pid, stdin, stdout, Some(stderr));

        let monitor = spawn_child_monitor(
            name.clone(),
            child,
            control_rx,
            handle.state.clone(),
            handle.correlator.clone(),
        );
        handle.track(reader);
        handle.track(monitor);

        info!(server = %name, pid = ?pid, "Server process started");
        Ok(handle)
    }

    /// Build a handle over arbitrary streams instead of an OS process.
    ///
    /// The "process" ends when `stdout` reaches EOF or the handle is stopped.
    pub fn from_streams<W, R, E>(name: &str, stdin: W, stdout: R, stderr: Option<E>) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
        R: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let Wiring {
            handle,
            control_rx,
            mut reader,
        } = Self::wire(name.to_string(), None, stdin, stdout, stderr);

        let state = handle.state.clone();
        let correlator = handle.correlator.clone();
        let monitor = tokio::spawn(async move {
            let reason = tokio::select! {
                _ = control_rx => {
                    reader.abort();
                    "process stopped"
                }
                _ = &mut reader => "output stream closed",
            };
            correlator.fail_all(reason);
            state.send_replace(ProcessState::Stopped);
        });
        handle.track(monitor);
        handle
    }

    fn wire<W, R, E>(
        name: String,
        pid: Option<u32>,
        stdin: W,
        stdout: R,
        stderr: Option<E>,
    ) -> Wiring
    where
        W: AsyncWrite + Unpin + Send + 'static,
        R: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let correlator = Arc::new(Correlator::new(name.clone()));
        let (write_tx, write_rx) = mpsc::channel(limits::WRITE_QUEUE_DEPTH);
        let (control_tx, control_rx) = oneshot::channel();
        let (state, _) = watch::channel(ProcessState::Starting);
        let stderr_tail = Arc::new(StderrTail::default());
        let write_timeout = Duration::from_millis(defaults::WRITE_TIMEOUT_MS);

        let mut tasks = vec![spawn_stdin_writer(
            name.clone(),
            stdin,
            write_rx,
            correlator.clone(),
            write_timeout,
        )];
        if let Some(stderr) = stderr {
            tasks.push(spawn_stderr_drain(name.clone(), stderr, stderr_tail.clone()));
        }
        let reader = spawn_stdout_reader(name.clone(), stdout, correlator.clone(), write_tx.clone());

        state.send_replace(ProcessState::Running);

        Wiring {
            handle: Self {
                name,
                pid,
                correlator,
                writer: write_tx,
                state: Arc::new(state),
                control: Mutex::new(Some(control_tx)),
                stderr: stderr_tail,
                tasks: Mutex::new(tasks),
                write_timeout,
            },
            control_rx,
            reader,
        }
    }

    fn track(&self, task: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
    }

    /// Queue one JSON record for stdin and wait until it is flushed.
    ///
    /// Records from concurrent callers are written in submission order.
    pub async fn write_line(&self, message: Value) -> Result<(), CatalogError> {
        let write_error = |reason: &str| CatalogError::Write {
            server: self.name.clone(),
            reason: reason.to_string(),
        };
        if !self.is_alive() {
            return Err(write_error("process has exited"));
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        let line = OutboundLine {
            message,
            ack: Some(ack_tx),
        };
        let submit = async {
            self.writer
                .send(line)
                .await
                .map_err(|_| write_error("stdin is closed"))?;
            ack_rx
                .await
                .map_err(|_| write_error("stdin writer stopped"))?
        };

        // Queue wait plus the write itself.
        match tokio::time::timeout(self.write_timeout * 2, submit).await {
            Ok(result) => result,
            Err(_) => Err(write_error("timed out waiting for stdin")),
        }
    }

    /// Stop the process: fail pending requests, ask it to terminate, and
    /// force-kill after `grace`. Always ends in [`ProcessState::Stopped`]
    /// with every stream released.
    pub async fn stop(&self, grace: Duration) {
        self.correlator.fail_all("process stopping");

        let control = self
            .control
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(control) = control {
            info!(server = %self.name, "Stopping server process");
            if control.send(grace).is_ok() {
                let mut state = self.state.subscribe();
                let stopped = tokio::time::timeout(
                    grace + KILL_SETTLE,
                    state.wait_for(|s| *s == ProcessState::Stopped),
                )
                .await;
                if stopped.is_err() {
                    warn!(server = %self.name, "Process did not confirm exit; releasing anyway");
                }
            }
        }

        self.state.send_replace(ProcessState::Stopped);
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    /// Running with an intact transport.
    pub fn is_alive(&self) -> bool {
        self.state() == ProcessState::Running && !self.correlator.is_closed()
    }

    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    /// Recent stderr output, oldest first.
    pub fn stderr_tail(&self) -> Vec<String> {
        self.stderr.snapshot()
    }

    pub(crate) fn stderr_suffix(&self) -> String {
        self.stderr.suffix()
    }

    /// Resolves once the process has stopped, whatever the cause.
    pub async fn exited(&self) {
        let mut state = self.state.subscribe();
        let _ = state.wait_for(|s| *s == ProcessState::Stopped).await;
    }
}

fn spawn_child_monitor(
    name: String,
    mut child: Child,
    control_rx: oneshot::Receiver<Duration>,
    state: Arc<watch::Sender<ProcessState>>,
    correlator: Arc<Correlator>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let reason = tokio::select! {
            request = control_rx => {
                // A dropped handle means kill now.
                let grace = request.unwrap_or(Duration::ZERO);
                state.send_replace(ProcessState::Stopping);
                terminate(&name, &mut child, grace).await;
                "process stopped".to_string()
            }
            status = child.wait() => match status {
                Ok(status) => {
                    warn!(server = %name, "Server process exited: {}", status);
                    format!("process exited: {}", status)
                }
                Err(e) => format!("failed to wait on process: {}", e),
            }
        };
        correlator.fail_all(&reason);
        state.send_replace(ProcessState::Stopped);
    })
}

/// SIGTERM, wait up to `grace`, then SIGKILL.
async fn terminate(name: &str, child: &mut Child, grace: Duration) {
    #[cfg(any(target_os = "linux", target_os = "macos"))]
    if !grace.is_zero() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        if let Some(pid) = child.id() {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!(server = %name, pid, "SIGTERM failed: {}", e);
            }
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            info!(server = %name, "Server process exited after terminate: {}", status);
            return;
        }
        Ok(Err(e)) => warn!(server = %name, "Wait after terminate failed: {}", e),
        Err(_) => info!(server = %name, "Grace period elapsed, killing"),
    }

    if let Err(e) = child.kill().await {
        warn!(server = %name, "Kill failed: {}", e);
    }
}

/// Creates process handles. The supervisor only ever starts processes
/// through this seam, so tests can substitute in-memory children.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(
        &self,
        descriptor: &ServerDescriptor,
        env: &dyn EnvResolver,
        overrides: &BTreeMap<String, String>,
    ) -> Result<ProcessHandle, CatalogError>;
}

/// Launches real OS processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandLauncher;

#[async_trait]
impl Launcher for CommandLauncher {
    async fn launch(
        &self,
        descriptor: &ServerDescriptor,
        env: &dyn EnvResolver,
        overrides: &BTreeMap<String, String>,
    ) -> Result<ProcessHandle, CatalogError> {
        ProcessHandle::spawn(descriptor, env, overrides)
    }
}
