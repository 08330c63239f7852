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

//! Process Supervisor.
//!
//! The registry of running children, keyed by logical server name. It is the
//! only place that starts or stops processes, so "is server X running" has a
//! single answer. A start in progress is stored as a shared future: every
//! concurrent caller for the same name awaits the same attempt and exactly
//! one process is spawned.

use futures::future::{BoxFuture, FutureExt, Shared};
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::engine_core::constants::defaults;
use crate::engine_core::errors::CatalogError;
use crate::engine_core::models::ServerDescriptor;
use crate::engine_core::traits::EnvResolver;
use crate::mcp::process::{Launcher, ProcessHandle};

type StartFuture = Shared<BoxFuture<'static, Result<Arc<ProcessHandle>, CatalogError>>>;

enum Slot {
    Starting { generation: u64, future: StartFuture },
    Running(Arc<ProcessHandle>),
}

enum Plan {
    Ready(Arc<ProcessHandle>),
    Join(u64, StartFuture),
    Launch(u64, StartFuture, Option<Arc<ProcessHandle>>),
}

#[derive(Default)]
struct Registry {
    slots: HashMap<String, Slot>,
    next_generation: u64,
}

/// Retry and shutdown knobs for the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub start_attempts: u32,
    pub backoff: Duration,
    pub stop_grace: Duration,
    /// Extra variables injected into every child on top of its declared env.
    pub overrides: BTreeMap<String, String>,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            start_attempts: defaults::START_ATTEMPTS,
            backoff: Duration::from_millis(defaults::BACKOFF_MS),
            stop_grace: Duration::from_millis(defaults::STOP_GRACE_MS),
            overrides: BTreeMap::new(),
        }
    }
}

pub struct ProcessSupervisor {
    launcher: Arc<dyn Launcher>,
    env: Arc<dyn EnvResolver>,
    options: SupervisorOptions,
    registry: Mutex<Registry>,
}

impl ProcessSupervisor {
    pub fn new(
        launcher: Arc<dyn Launcher>,
        env: Arc<dyn EnvResolver>,
        options: SupervisorOptions,
    ) -> Self {
        Self {
            launcher,
            env,
            options,
            registry: Mutex::new(Registry::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Idempotent start. True if `name` is running afterwards.
    pub async fn ensure_running(&self, name: &str, descriptor: &ServerDescriptor) -> bool {
        match self.start(name, descriptor).await {
            Ok(_) => true,
            Err(e) => {
                error!(server = %name, "Failed to start server: {}", e);
                false
            }
        }
    }

    /// Return the running handle for `name`, starting it if needed.
    ///
    /// A dead handle found in the map is discarded and replaced.
    pub async fn start(
        &self,
        name: &str,
        descriptor: &ServerDescriptor,
    ) -> Result<Arc<ProcessHandle>, CatalogError> {
        let plan = {
            let mut registry = self.lock();
            let existing = match registry.slots.get(name) {
                Some(Slot::Running(handle)) if handle.is_alive() => {
                    Some(Plan::Ready(handle.clone()))
                }
                Some(Slot::Starting { generation, future }) => {
                    Some(Plan::Join(*generation, future.clone()))
                }
                _ => None,
            };
            match existing {
                Some(plan) => plan,
                None => {
                    let stale = match registry.slots.remove(name) {
                        Some(Slot::Running(dead)) => Some(dead),
                        _ => None,
                    };
                    registry.next_generation += 1;
                    let generation = registry.next_generation;
                    let future = self.start_future(descriptor.clone());
                    registry.slots.insert(
                        name.to_string(),
                        Slot::Starting {
                            generation,
                            future: future.clone(),
                        },
                    );
                    Plan::Launch(generation, future, stale)
                }
            }
        };

        match plan {
            Plan::Ready(handle) => Ok(handle),
            Plan::Join(generation, future) => {
                debug!(server = %name, "Joining in-flight start");
                self.finish(name, generation, future).await
            }
            Plan::Launch(generation, future, stale) => {
                if let Some(dead) = stale {
                    info!(server = %name, "Replacing dead process");
                    dead.stop(Duration::ZERO).await;
                }
                self.finish(name, generation, future).await
            }
        }
    }

    /// Await a start attempt and record its outcome if it is still current.
    async fn finish(
        &self,
        name: &str,
        generation: u64,
        future: StartFuture,
    ) -> Result<Arc<ProcessHandle>, CatalogError> {
        let result = future.await;

        let orphaned = {
            let mut registry = self.lock();
            let current = matches!(
                registry.slots.get(name),
                Some(Slot::Starting { generation: g, .. }) if *g == generation
            );
            match &result {
                Ok(handle) if current => {
                    registry
                        .slots
                        .insert(name.to_string(), Slot::Running(handle.clone()));
                    None
                }
                Err(_) if current => {
                    registry.slots.remove(name);
                    None
                }
                // Superseded by stop/stop_all. Stop the child unless a later
                // caller already recorded this very handle.
                Ok(handle) => match registry.slots.get(name) {
                    Some(Slot::Running(h)) if Arc::ptr_eq(h, handle) => None,
                    _ => Some(handle.clone()),
                },
                Err(_) => None,
            }
        };

        if let Some(handle) = orphaned {
            handle.stop(Duration::ZERO).await;
            return Err(CatalogError::transport(name, "stopped while starting"));
        }
        result
    }

    fn start_future(&self, descriptor: ServerDescriptor) -> StartFuture {
        let launcher = self.launcher.clone();
        let env = self.env.clone();
        let options = self.options.clone();

        async move {
            let attempts = options.start_attempts.max(1);
            let mut last_error = None;

            for attempt in 1..=attempts {
                match launcher
                    .launch(&descriptor, env.as_ref(), &options.overrides)
                    .await
                {
                    Ok(handle) => return Ok(Arc::new(handle)),
                    Err(e) if !e.is_retryable() => return Err(e),
                    Err(e) => {
                        warn!(
                            server = %descriptor.name,
                            attempt,
                            attempts,
                            "Start attempt failed: {}", e
                        );
                        last_error = Some(e);
                        if attempt < attempts {
                            tokio::time::sleep(backoff_delay(options.backoff, attempt)).await;
                        }
                    }
                }
            }

            Err(last_error.unwrap_or_else(|| CatalogError::Start {
                server: descriptor.name.clone(),
                reason: "no start attempts made".to_string(),
            }))
        }
        .boxed()
        .shared()
    }

    /// Stop one server. No-op if it is not known.
    pub async fn stop(&self, name: &str) {
        let slot = self.lock().slots.remove(name);
        match slot {
            Some(Slot::Running(handle)) => handle.stop(self.options.stop_grace).await,
            // finish() sees the slot gone and stops whatever the start yields.
            Some(Slot::Starting { .. }) => debug!(server = %name, "Cancelled in-flight start"),
            None => {}
        }
    }

    /// Stop every server.
    ///
    /// Pending requests on every handle are failed before any stream is torn
    /// down. Starts still in flight are awaited and their children stopped,
    /// so on return the map is empty and no child outlives the call.
    pub async fn stop_all(&self) {
        let slots: Vec<(String, Slot)> = self.lock().slots.drain().collect();
        let mut handles = Vec::new();
        let mut in_flight = Vec::new();
        for (_, slot) in slots {
            match slot {
                Slot::Running(handle) => handles.push(handle),
                Slot::Starting { future, .. } => in_flight.push(future),
            }
        }

        if handles.is_empty() && in_flight.is_empty() {
            return;
        }
        info!(
            running = handles.len(),
            starting = in_flight.len(),
            "Stopping all server processes"
        );

        for handle in &handles {
            handle.correlator().fail_all("supervisor shutting down");
        }
        for started in futures::future::join_all(in_flight).await.into_iter().flatten() {
            started.correlator().fail_all("supervisor shutting down");
            handles.push(started);
        }

        let grace = self.options.stop_grace;
        futures::future::join_all(handles.iter().map(|h| h.stop(grace))).await;
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<ProcessHandle>> {
        match self.lock().slots.get(name) {
            Some(Slot::Running(handle)) => Some(handle.clone()),
            _ => None,
        }
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.lookup(name).is_some_and(|h| h.is_alive())
    }

    /// Names with a live process, sorted.
    pub fn running(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .lock()
            .slots
            .iter()
            .filter_map(|(name, slot)| match slot {
                Slot::Running(handle) if handle.is_alive() => Some(name.clone()),
                _ => None,
            })
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn options(&self) -> &SupervisorOptions {
        &self.options
    }
}

/// Exponential backoff with up to 25% jitter, capped.
pub(crate) fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
    let capped = exp.min(Duration::from_millis(defaults::MAX_BACKOFF_MS));
    let jitter_ms = (capped.as_millis() as u64) / 4;
    let jitter = if jitter_ms > 0 {
        Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    } else {
        Duration::ZERO
    };
    capped + jitter
}
