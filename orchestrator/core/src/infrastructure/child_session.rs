// Copyright (c) 2026 Fleetmux Contributors
// SPDX-License-Identifier: AGPL-3.0

//! The pooled JSON-RPC session to a long-running child — deliberately a
//! different process/id-space than the Discovery Engine's short-lived
//! sessions (see `infrastructure::discovery` and DESIGN.md design note on
//! id-collision). One child subprocess exposes exactly one stdin/stdout
//! pair; `ChildSession` owns that pair and multiplexes concurrent calls
//! over it by JSON-RPC id, so several pooled [`Connection`](crate::domain::connection::Connection)
//! handles can share the one dispatcher the way several logical sessions
//! share one physical pipe.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, Mutex};

use crate::domain::connection::Connection;
use crate::domain::errors::PoolError;
use crate::domain::jsonrpc::{JsonRpcRequest, JsonRpcResponse};
use crate::infrastructure::pool::ConnectionFactory;
use crate::infrastructure::process_supervisor::ProcessSupervisor;

/// Pooled-session ids start well above the Discovery Engine's fixed `1`/`2`
/// so a stray frame from one origin can never be mistaken for the other's.
const ID_RANGE_START: i64 = 1000;

struct PendingCalls {
    next_id: AtomicI64,
    waiters: DashMap<i64, oneshot::Sender<JsonRpcResponse>>,
}

/// The live dispatcher for one child's pooled stdin/stdout. Reads
/// newline-delimited JSON-RPC responses from stdout and completes whichever
/// caller is waiting on that id; writes go straight to stdin under a mutex
/// since concurrent writers must not interleave lines.
struct ChildSession {
    stdin: Mutex<tokio::process::ChildStdin>,
    pending: Arc<PendingCalls>,
    alive: std::sync::atomic::AtomicBool,
}

impl ChildSession {
    async fn call(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value, PoolError> {
        let id = self.pending.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.waiters.insert(id, tx);

        let request = JsonRpcRequest::call(serde_json::json!(id), method, params);
        let mut line = serde_json::to_string(&request)
            .map_err(|e| PoolError::FactoryFailed(e.to_string()))?;
        line.push('\n');

        {
            let mut stdin = self.stdin.lock().await;
            if stdin.write_all(line.as_bytes()).await.is_err() {
                self.pending.waiters.remove(&id);
                return Err(PoolError::FactoryFailed(format!("write failed for {method}")));
            }
        }

        match rx.await {
            Ok(response) => {
                if let Some(error) = response.error {
                    Err(PoolError::FactoryFailed(error.message))
                } else {
                    Ok(response.result.unwrap_or(serde_json::Value::Null))
                }
            }
            Err(_) => Err(PoolError::FactoryFailed(format!("{method} dropped before a response arrived"))),
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

/// Creates and reuses one [`ChildSession`] per child id, handing out
/// lightweight [`Connection`] handles backed by it. This is the
/// `ConnectionFactory` the Resilience Layer's pool (C2) acquires/releases
/// against for `tools/call` dispatch.
pub struct ChildSessionFactory {
    supervisor: Arc<ProcessSupervisor>,
    sessions: DashMap<String, Arc<ChildSession>>,
}

impl ChildSessionFactory {
    pub fn new(supervisor: Arc<ProcessSupervisor>) -> Arc<Self> {
        Arc::new(Self {
            supervisor,
            sessions: DashMap::new(),
        })
    }

    /// Forwards a `tools/call` (or any Tool Protocol method) to `child_id`'s
    /// pooled session. The router never injects fields beyond what
    /// `JsonRpcRequest` defines.
    pub async fn call(
        &self,
        child_id: &str,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, PoolError> {
        let session = self
            .sessions
            .get(child_id)
            .map(|s| s.clone())
            .ok_or_else(|| PoolError::FactoryFailed(format!("no pooled session for {child_id}")))?;
        session.call(method, params).await
    }

    fn session_for(&self, child_id: &str) -> Option<Arc<ChildSession>> {
        self.sessions.get(child_id).map(|s| s.clone())
    }

    async fn open_session(&self, child_id: &str) -> Result<Arc<ChildSession>, PoolError> {
        if let Some(existing) = self.session_for(child_id) {
            if existing.is_alive() {
                return Ok(existing);
            }
            self.sessions.remove(child_id);
        }

        let io = self
            .supervisor
            .take_io(child_id)
            .await
            .ok_or_else(|| PoolError::FactoryFailed(format!("{child_id} is not running or IO already taken")))?;

        let pending = Arc::new(PendingCalls {
            next_id: AtomicI64::new(ID_RANGE_START),
            waiters: DashMap::new(),
        });
        let session = Arc::new(ChildSession {
            stdin: Mutex::new(io.stdin),
            pending: pending.clone(),
            alive: std::sync::atomic::AtomicBool::new(true),
        });

        spawn_reader(io.stdout, pending, session.clone());
        self.sessions.insert(child_id.to_string(), session.clone());
        Ok(session)
    }
}

fn spawn_reader(
    stdout: tokio::process::ChildStdout,
    pending: Arc<PendingCalls>,
    session: Arc<ChildSession>,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let Ok(response) = serde_json::from_str::<JsonRpcResponse>(&line) else {
                        continue;
                    };
                    if let Some(id) = response.id.as_i64() {
                        if let Some((_, waiter)) = pending.waiters.remove(&id) {
                            let _ = waiter.send(response);
                        }
                    }
                }
                _ => break,
            }
        }
        session.alive.store(false, Ordering::SeqCst);
        let stale: Vec<i64> = pending.waiters.iter().map(|e| *e.key()).collect();
        for id in stale {
            pending.waiters.remove(&id);
        }
    });
}

impl ChildSessionFactory {
    /// Opens (or reuses) the pooled session for `child_id` and returns a
    /// fresh logical [`Connection`] handle backed by it. The pool is
    /// per-child, so each child's [`PerChildFactory`] only ever calls this
    /// with its own id.
    async fn open_for(&self, child_id: &str) -> Result<Connection, PoolError> {
        self.open_session(child_id).await?;
        Ok(Connection::new(child_id))
    }

    async fn health_check(&self, conn: &Connection) -> bool {
        self.session_for(&conn.child_id).map(|s| s.is_alive()).unwrap_or(false)
    }
}

/// Adapts [`ChildSessionFactory`] to [`ConnectionFactory`] for one specific
/// child, since the pool (C2) is constructed per-child but the dispatcher
/// map behind the factory is shared across all of them.
pub struct PerChildFactory {
    pub child_id: String,
    pub shared: Arc<ChildSessionFactory>,
}

#[async_trait]
impl ConnectionFactory for PerChildFactory {
    async fn create(&self) -> Result<Connection, PoolError> {
        self.shared.open_for(&self.child_id).await
    }

    async fn health_check(&self, conn: &Connection) -> bool {
        self.shared.health_check(conn).await
    }

    async fn close(&self, _conn: &Connection) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::child::{ChildDescriptor, RuntimeKind};

    fn echo_descriptor(id: &str) -> ChildDescriptor {
        ChildDescriptor {
            id: id.to_string(),
            display_name: id.to_string(),
            runtime_kind: RuntimeKind::Native,
            working_dir: std::env::temp_dir(),
            executable: "cat".to_string(),
            args: vec![],
            env_overlay: Default::default(),
            category: "test".to_string(),
            required_creds: vec![],
            tool_limit: None,
        }
    }

    /// `cat` echoes each request line straight back; since a bare request
    /// (no `result`/`error`) still deserializes as a valid, empty
    /// [`JsonRpcResponse`], this exercises real id-multiplexing over a real
    /// subprocess pipe without needing a scripted protocol responder.
    #[tokio::test]
    async fn call_round_trips_through_a_real_subprocess_pipe() {
        let supervisor = ProcessSupervisor::new();
        supervisor.register(echo_descriptor("echo")).await;
        supervisor.start("echo").await.unwrap();

        let factory = ChildSessionFactory::new(supervisor.clone());
        factory.open_for("echo").await.unwrap();

        let result = factory.call("echo", "tools/list", serde_json::json!({})).await;
        assert!(result.is_ok());

        supervisor.stop("echo").await.unwrap();
    }

    #[tokio::test]
    async fn open_for_fails_when_io_already_taken() {
        let supervisor = ProcessSupervisor::new();
        supervisor.register(echo_descriptor("echo2")).await;
        supervisor.start("echo2").await.unwrap();

        let factory = ChildSessionFactory::new(supervisor.clone());
        factory.open_for("echo2").await.unwrap();

        // IO was already claimed by the factory above; a second supervisor
        // consumer has nothing left to take.
        assert!(supervisor.take_io("echo2").await.is_none());
        supervisor.stop("echo2").await.unwrap();
    }
}
