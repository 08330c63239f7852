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

//! Request correlation.
//!
//! Each process owns one [`Correlator`]. Outgoing requests register their id
//! and suspend on a oneshot; the stdout reader resolves them as responses
//! arrive, in whatever order the child answers.
//!
//! The pending map is guarded by a plain mutex that is never held across an
//! await point. Removal is the single point of truth: whoever removes an
//! entry (resolve, timeout, fail_all) is the only party that completes it.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::engine_core::errors::CatalogError;
use crate::engine_core::models::RequestId;

pub type RpcResult = Result<Value, CatalogError>;

struct PendingRequest {
    tx: oneshot::Sender<RpcResult>,
    created_at: Instant,
}

#[derive(Default)]
struct Inner {
    pending: HashMap<RequestId, PendingRequest>,
    /// Set once the transport is gone. Later registrations fail immediately.
    closed: Option<String>,
}

/// Handle a caller suspends on until its response arrives.
#[derive(Debug)]
pub struct PendingResponse {
    id: RequestId,
    rx: oneshot::Receiver<RpcResult>,
}

impl PendingResponse {
    pub fn id(&self) -> &RequestId {
        &self.id
    }
}

pub struct Correlator {
    server: String,
    inner: Mutex<Inner>,
}

impl Correlator {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `id` as pending.
    ///
    /// Fails if the id is already pending or the transport has been failed.
    pub fn register(&self, id: RequestId) -> Result<PendingResponse, CatalogError> {
        let mut inner = self.lock();
        if let Some(reason) = &inner.closed {
            return Err(CatalogError::transport(&self.server, reason.clone()));
        }
        if inner.pending.contains_key(&id) {
            return Err(CatalogError::ProtocolViolation {
                server: self.server.clone(),
                reason: format!("request id '{}' is already pending", id),
            });
        }
        let (tx, rx) = oneshot::channel();
        inner.pending.insert(
            id.clone(),
            PendingRequest {
                tx,
                created_at: Instant::now(),
            },
        );
        Ok(PendingResponse { id, rx })
    }

    /// Complete the request registered under `id`.
    ///
    /// Returns false when nothing was pending under that id (already
    /// resolved, timed out, or never sent). Such responses are dropped.
    pub fn resolve(&self, id: &RequestId, result: RpcResult) -> bool {
        let entry = self.lock().pending.remove(id);
        match entry {
            Some(pending) => {
                debug!(
                    server = %self.server,
                    request_id = %id,
                    elapsed_ms = pending.created_at.elapsed().as_millis() as u64,
                    "Resolved pending request"
                );
                // The waiter may have been cancelled; nothing to do then.
                let _ = pending.tx.send(result);
                true
            }
            None => {
                warn!(
                    server = %self.server,
                    request_id = %id,
                    "Dropping response for unknown or expired request id"
                );
                false
            }
        }
    }

    /// Fail every pending request with a transport error and refuse new ones.
    ///
    /// Returns how many waiters were failed.
    pub fn fail_all(&self, reason: &str) -> usize {
        let drained: Vec<(RequestId, PendingRequest)> = {
            let mut inner = self.lock();
            if inner.closed.is_none() {
                inner.closed = Some(reason.to_string());
            }
            inner.pending.drain().collect()
        };

        let count = drained.len();
        for (_, pending) in drained {
            let _ = pending
                .tx
                .send(Err(CatalogError::transport(&self.server, reason)));
        }
        if count > 0 {
            warn!(server = %self.server, count, "Failed pending requests: {}", reason);
        }
        count
    }

    /// Wait for `pending` to resolve, at most `duration`.
    ///
    /// On expiry the entry is removed under the lock, so a response arriving
    /// afterwards is dropped by `resolve`. If the response won the race and
    /// removed the entry first, its value is returned instead of the timeout.
    pub async fn await_with_timeout<F>(
        &self,
        pending: PendingResponse,
        duration: Duration,
        on_timeout: F,
    ) -> RpcResult
    where
        F: FnOnce() -> CatalogError,
    {
        let PendingResponse { id, mut rx } = pending;
        let mut guard = CancelGuard {
            correlator: self,
            id: Some(id),
        };

        match tokio::time::timeout(duration, &mut rx).await {
            Ok(Ok(result)) => {
                guard.disarm();
                result
            }
            Ok(Err(_)) => {
                guard.disarm();
                Err(CatalogError::transport(
                    &self.server,
                    "response channel closed",
                ))
            }
            Err(_) => {
                let removed = guard.take().map(|id| self.lock().pending.remove(&id));
                if let Some(None) = removed {
                    if let Ok(result) = rx.try_recv() {
                        return result;
                    }
                }
                Err(on_timeout())
            }
        }
    }

    /// Forget `pending` without completing it, e.g. when its request could
    /// not be written.
    pub fn cancel(&self, pending: PendingResponse) -> bool {
        self.lock().pending.remove(&pending.id).is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }

    pub fn server(&self) -> &str {
        &self.server
    }
}

/// Removes the pending entry if the waiting future is dropped mid-await.
struct CancelGuard<'a> {
    correlator: &'a Correlator,
    id: Option<RequestId>,
}

impl CancelGuard<'_> {
    fn disarm(&mut self) {
        self.id = None;
    }

    fn take(&mut self) -> Option<RequestId> {
        self.id.take()
    }
}

impl Drop for CancelGuard<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.correlator.lock().pending.remove(&id);
        }
    }
}
