// Copyright (c) 2026 Fleetmux Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Process Supervisor (C4): spawn/monitor/stop children, capture logs,
//! classify errors. Owns the living set of children; one per-child mutex
//! guards state transitions, one global mutex only around the children map.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::Mutex;

use crate::domain::child::{ChildDescriptor, ChildState, RuntimeKind};
use crate::domain::errors::{ClassifiedError, ErrorKind, Severity, SupervisorError};

const STOP_GRACE: Duration = Duration::from_secs(10);

struct SupervisedChild {
    descriptor: ChildDescriptor,
    state: ChildState,
    handle: Option<Child>,
}

/// The stdin/stdout half of a running child, handed off once to whichever
/// infrastructure owns the pooled JSON-RPC session (see
/// `infrastructure::child_session`). Logs are read from stderr only — the
/// protocol channel on stdout is reserved for request/response traffic.
pub struct ChildIo {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}

pub struct ProcessSupervisor {
    children: Mutex<HashMap<String, SupervisedChild>>,
    io: Mutex<HashMap<String, ChildIo>>,
}

impl ProcessSupervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            children: Mutex::new(HashMap::new()),
            io: Mutex::new(HashMap::new()),
        })
    }

    /// Takes ownership of a running child's stdin/stdout, once. Returns
    /// `None` if the child is not running or its IO was already taken.
    pub async fn take_io(&self, id: &str) -> Option<ChildIo> {
        self.io.lock().await.remove(id)
    }

    pub async fn register(&self, descriptor: ChildDescriptor) {
        let mut state = ChildState::new();
        state.mark_stopped();
        let mut children = self.children.lock().await;
        children.insert(
            descriptor.id.clone(),
            SupervisedChild {
                descriptor,
                state,
                handle: None,
            },
        );
    }

    pub async fn unregister(&self, id: &str) {
        self.children.lock().await.remove(id);
    }

    pub async fn status_of(&self, id: &str) -> Result<ChildState, SupervisorError> {
        self.children
            .lock()
            .await
            .get(id)
            .map(|c| c.state.clone())
            .ok_or_else(|| SupervisorError::UnknownChild(id.to_string()))
    }

    pub async fn logs_of(&self, id: &str, n: usize) -> Result<Vec<String>, SupervisorError> {
        self.children
            .lock()
            .await
            .get(id)
            .map(|c| c.state.tail_logs(n))
            .ok_or_else(|| SupervisorError::UnknownChild(id.to_string()))
    }

    /// Refuses if status is not in {stopped, failed}. Runs preflight, spawns
    /// with the merged environment, and attaches the log-capture pump.
    pub async fn start(self: &Arc<Self>, id: &str) -> Result<(), SupervisorError> {
        let descriptor = {
            let mut children = self.children.lock().await;
            let entry = children
                .get_mut(id)
                .ok_or_else(|| SupervisorError::UnknownChild(id.to_string()))?;
            if !entry.state.can_start() {
                return Err(SupervisorError::InvalidStartState(
                    id.to_string(),
                    entry.state.status,
                ));
            }
            entry.state.mark_starting();
            entry.descriptor.clone()
        };

        if let Err(detail) = preflight(&descriptor).await {
            let mut children = self.children.lock().await;
            if let Some(entry) = children.get_mut(id) {
                entry.state.mark_failed(
                    ClassifiedError::new(ErrorKind::MissingDependency, detail.clone(), Severity::Error)
                        .with_child(id)
                        .with_remedy("install the declared runtime dependency and retry"),
                );
            }
            return Err(SupervisorError::PreflightFailed { child_id: id.to_string(), detail });
        }

        let env = compose_environment(&descriptor).await;

        let mut command = tokio::process::Command::new(&descriptor.executable);
        command
            .args(&descriptor.args)
            .current_dir(&descriptor.working_dir)
            .envs(env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| SupervisorError::SpawnFailed {
            child_id: id.to_string(),
            source,
        })?;

        let pid = child.id().unwrap_or(0);
        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take();

        {
            let mut children = self.children.lock().await;
            if let Some(entry) = children.get_mut(id) {
                entry.state.mark_running(pid);
                entry.handle = Some(child);
            }
        }
        self.io.lock().await.insert(id.to_string(), ChildIo { stdin, stdout });

        self.spawn_log_pump(id.to_string(), stderr);
        Ok(())
    }

    /// stderr only: the protocol channel on stdout is reserved for the
    /// pooled JSON-RPC session and is never read here.
    fn spawn_log_pump(self: &Arc<Self>, id: String, stderr: Option<tokio::process::ChildStderr>) {
        let Some(stderr) = stderr else { return };
        let this = self.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => this.record_log_line(&id, line).await,
                    _ => break,
                }
            }
        });
    }

    async fn record_log_line(&self, id: &str, line: String) {
        let mut children = self.children.lock().await;
        if let Some(entry) = children.get_mut(id) {
            if is_fatal_pattern(&line) {
                entry.state.push_error(
                    ClassifiedError::new(ErrorKind::ChildCrashed, line.clone(), Severity::Error)
                        .with_child(id),
                );
            }
            entry.state.push_log(line);
        }
    }

    /// Sends SIGTERM, waits up to the grace timeout, then SIGKILL.
    pub async fn stop(&self, id: &str) -> Result<(), SupervisorError> {
        let pid_and_handle = {
            let mut children = self.children.lock().await;
            let entry = children
                .get_mut(id)
                .ok_or_else(|| SupervisorError::UnknownChild(id.to_string()))?;
            entry.handle.take().map(|h| (entry.state.pid, h))
        };

        if let Some((pid, mut handle)) = pid_and_handle {
            send_sigterm(pid);
            let waited = tokio::time::timeout(STOP_GRACE, handle.wait()).await;
            if waited.is_err() {
                let _ = handle.kill().await;
            }
        }

        let mut children = self.children.lock().await;
        if let Some(entry) = children.get_mut(id) {
            entry.state.mark_stopped();
        }
        Ok(())
    }

    /// Sends SIGTERM to every running child concurrently, then SIGKILL after
    /// the grace timeout. Used on orchestrator shutdown.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.children.lock().await.keys().cloned().collect();
        let stops = ids.iter().map(|id| self.stop(id));
        futures::future::join_all(stops).await;
    }
}

#[cfg(unix)]
fn send_sigterm(pid: Option<u32>) {
    if let Some(pid) = pid {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: Option<u32>) {}

fn is_fatal_pattern(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    lower.contains("panic") || lower.contains("fatal") || lower.contains("unhandled rejection")
}

/// Process env ⊎ `.env`-file entries from `workingDir/.env` ⊎ `envOverlay`.
async fn compose_environment(descriptor: &ChildDescriptor) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = std::env::vars().collect();

    let dotenv_path = descriptor.working_dir.join(".env");
    if let Ok(contents) = tokio::fs::read_to_string(&dotenv_path).await {
        for item in dotenvy::from_read_iter(contents.as_bytes()) {
            if let Ok((key, value)) = item {
                env.insert(key, value);
            }
        }
    }

    for (key, value) in &descriptor.env_overlay {
        env.insert(key.clone(), value.clone());
    }

    env
}

/// Preflight checks by `runtimeKind`, run before spawn.
async fn preflight(descriptor: &ChildDescriptor) -> Result<(), String> {
    match descriptor.runtime_kind {
        RuntimeKind::Node => {
            let entry = descriptor.working_dir.join("dist/server.js");
            if !tokio::fs::try_exists(&entry).await.unwrap_or(false) {
                return Err(format!("missing build artifact: {}", entry.display()));
            }
            let modules = descriptor.working_dir.join("node_modules");
            if !tokio::fs::try_exists(&modules).await.unwrap_or(false) {
                return Err(format!("missing dependency directory: {}", modules.display()));
            }
            Ok(())
        }
        RuntimeKind::Python => {
            let unix_python = descriptor.working_dir.join("venv/bin/python");
            let windows_python = descriptor.working_dir.join("venv/Scripts/python.exe");
            if tokio::fs::try_exists(&unix_python).await.unwrap_or(false)
                || tokio::fs::try_exists(&windows_python).await.unwrap_or(false)
            {
                Ok(())
            } else {
                Err(format!("missing virtualenv interpreter under {}", descriptor.working_dir.display()))
            }
        }
        RuntimeKind::Generic => which::which("npx")
            .map(|_| ())
            .map_err(|_| "npx is not resolvable on PATH".to_string()),
        RuntimeKind::Native => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: &str, kind: RuntimeKind, working_dir: std::path::PathBuf) -> ChildDescriptor {
        ChildDescriptor {
            id: id.to_string(),
            display_name: id.to_string(),
            runtime_kind: kind,
            working_dir,
            executable: "true".to_string(),
            args: vec![],
            env_overlay: HashMap::new(),
            category: "test".to_string(),
            required_creds: vec![],
            tool_limit: None,
        }
    }

    #[tokio::test]
    async fn start_refuses_when_not_stopped_or_failed() {
        let supervisor = ProcessSupervisor::new();
        let dir = tempfile::tempdir().unwrap();
        supervisor.register(descriptor("a", RuntimeKind::Native, dir.path().to_path_buf())).await;
        supervisor.start("a").await.unwrap();
        let result = supervisor.start("a").await;
        assert!(matches!(result, Err(SupervisorError::InvalidStartState(_, _))));
        supervisor.stop("a").await.unwrap();
    }

    #[tokio::test]
    async fn node_preflight_fails_without_build_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = descriptor("node-app", RuntimeKind::Node, dir.path().to_path_buf());
        let result = preflight(&descriptor).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn unknown_child_status_errors() {
        let supervisor = ProcessSupervisor::new();
        let result = supervisor.status_of("ghost").await;
        assert!(matches!(result, Err(SupervisorError::UnknownChild(_))));
    }
}
