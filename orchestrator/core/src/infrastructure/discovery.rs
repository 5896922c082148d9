// Copyright (c) 2026 Fleetmux Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Discovery Engine (C5): per-child tool enumeration via a short-lived
//! JSON-RPC handshake, with preflight (delegated to the supervisor), retry,
//! and caching. Deliberately a distinct subprocess invocation from the
//! supervisor's long-lived pooled session, to avoid id-collision in the
//! pooled stream and to work even before a child is registered with a pool.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use crate::domain::child::ChildDescriptor;
use crate::domain::errors::{DiscoveryError, Severity};
use crate::domain::jsonrpc::JsonRpcRequest;
use crate::domain::tool::{CachedToolSet, DiagnosticIssue, ToolDescriptor};
use crate::infrastructure::cache::{TtlLruCache, TOOLS_CACHE_TTL};
use crate::infrastructure::config_store::ConfigStore;
use crate::infrastructure::process_supervisor::ProcessSupervisor;

const SESSION_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_ATTEMPTS: u32 = 3;
const FAILURE_CACHE_TTL: Duration = Duration::from_secs(30);

pub struct DiscoveryOutcome {
    pub tools: Vec<ToolDescriptor>,
    pub diagnostics: Vec<DiagnosticIssue>,
    /// Whether this child's enumeration itself succeeded, independent of how
    /// many tools it returned — a child can legitimately expose zero tools.
    pub succeeded: bool,
}

pub struct DiscoveryEngine {
    config_store: Arc<ConfigStore>,
    supervisor: Arc<ProcessSupervisor>,
    tools_cache: Arc<TtlLruCache<CachedToolSet>>,
}

impl DiscoveryEngine {
    pub fn new(
        config_store: Arc<ConfigStore>,
        supervisor: Arc<ProcessSupervisor>,
        tools_cache: Arc<TtlLruCache<CachedToolSet>>,
    ) -> Self {
        Self {
            config_store,
            supervisor,
            tools_cache,
        }
    }

    /// Surfaced through `GET /api/performance/cache`.
    pub fn tools_cache_stats(&self) -> crate::infrastructure::cache::CacheStats {
        self.tools_cache.stats()
    }

    /// Discover tools for one child, consulting the cache first, then
    /// retrying up to 3 attempts with `attempt * 2s` backoff.
    pub async fn discover(&self, descriptor: &ChildDescriptor) -> DiscoveryOutcome {
        if let Some(cached) = self.tools_cache.get(&descriptor.id) {
            if matches!(cached.status, crate::domain::tool::DiscoveryStatus::Success) {
                return DiscoveryOutcome {
                    tools: cached.tools,
                    diagnostics: Vec::new(),
                    succeeded: true,
                };
            }
        }

        let mut diagnostics = Vec::new();
        for attempt in 1..=MAX_ATTEMPTS {
            match run_discovery_session(descriptor).await {
                Ok(tools) => {
                    if attempt > 1 {
                        diagnostics.push(DiagnosticIssue::new(
                            &descriptor.id,
                            "retry_success",
                            format!("discovery succeeded on attempt {attempt}"),
                            Severity::Info,
                        ));
                    }
                    self.tools_cache.set(
                        descriptor.id.clone(),
                        CachedToolSet::success(&descriptor.id, tools.clone()),
                        TOOLS_CACHE_TTL,
                    );
                    return DiscoveryOutcome { tools, diagnostics, succeeded: true };
                }
                Err(err) => {
                    diagnostics.push(DiagnosticIssue::new(
                        &descriptor.id,
                        "retry_attempt",
                        err.to_string(),
                        Severity::Warning,
                    ));
                    if attempt < MAX_ATTEMPTS {
                        tokio::time::sleep(Duration::from_secs((attempt * 2) as u64)).await;
                    }
                }
            }
        }

        diagnostics.push(DiagnosticIssue::new(
            &descriptor.id,
            "tool_discovery_failed",
            format!("all {MAX_ATTEMPTS} discovery attempts failed"),
            Severity::Error,
        ));
        self.tools_cache.set(
            descriptor.id.clone(),
            CachedToolSet::failure(&descriptor.id, "discovery exhausted"),
            FAILURE_CACHE_TTL,
        );
        DiscoveryOutcome {
            tools: Vec::new(),
            diagnostics,
            succeeded: false,
        }
    }

    /// Enumerates children from the Config Store, launches one discovery
    /// session per running child concurrently, and merges the catalog.
    /// Fails overall only if every child fails; per-child failures surface
    /// as diagnostics.
    pub async fn discover_all(&self) -> DiscoveryOutcome {
        let descriptors = self.config_store.list_children().await;
        let mut diagnostics = Vec::new();
        let mut runnable = Vec::new();

        for descriptor in &descriptors {
            match self.supervisor.status_of(&descriptor.id).await {
                Ok(state) if state.status == crate::domain::child::ChildStatus::Running => {
                    runnable.push(descriptor.clone());
                }
                _ => diagnostics.push(DiagnosticIssue::new(
                    &descriptor.id,
                    "server_not_running",
                    "child is not running, skipped".to_string(),
                    Severity::Info,
                )),
            }
        }

        let outcomes = futures::future::join_all(runnable.iter().map(|d| self.discover(d))).await;

        let mut all_tools = Vec::new();
        let mut success_count = 0;
        for (descriptor, outcome) in runnable.iter().zip(outcomes.into_iter()) {
            diagnostics.extend(outcome.diagnostics);
            if outcome.succeeded {
                success_count += 1;
            }
            all_tools.extend(outcome.tools.into_iter().map(|mut t| {
                if t.category.is_empty() {
                    t.category = descriptor.category.clone();
                }
                t
            }));
        }

        if !runnable.is_empty() && success_count == 0 {
            diagnostics.push(DiagnosticIssue::new(
                "*",
                "tool_discovery_failed",
                "all children failed discovery".to_string(),
                Severity::Critical,
            ));
        }

        DiscoveryOutcome {
            tools: all_tools,
            diagnostics,
            succeeded: success_count > 0,
        }
    }
}

/// Composes `initialize`/`notifications/initialized`/`tools/list` and feeds
/// them to a single short-lived invocation of the child's executable,
/// reading combined stdout+stderr until EOF or the session timeout.
async fn run_discovery_session(descriptor: &ChildDescriptor) -> Result<Vec<ToolDescriptor>, DiscoveryError> {
    let mut env: HashMap<String, String> = std::env::vars().collect();
    for (k, v) in &descriptor.env_overlay {
        env.insert(k.clone(), v.clone());
    }

    let mut child = Command::new(&descriptor.executable)
        .args(&descriptor.args)
        .current_dir(&descriptor.working_dir)
        .envs(env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let mut stdin = child.stdin.take().expect("piped stdin");
    let frames = vec![
        JsonRpcRequest::call(serde_json::json!(1), "initialize", serde_json::json!({})),
        JsonRpcRequest::notification("notifications/initialized", None),
        JsonRpcRequest::call(serde_json::json!(2), "tools/list", serde_json::json!({})),
    ];
    for frame in &frames {
        let mut line = serde_json::to_string(frame)?;
        line.push('\n');
        stdin.write_all(line.as_bytes()).await?;
    }
    stdin.flush().await?;
    drop(stdin);

    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");

    let read_result = tokio::time::timeout(SESSION_TIMEOUT, async {
        let mut tools = None;
        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();
        loop {
            tokio::select! {
                line = stdout_lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            if let Ok(value) = serde_json::from_str::<serde_json::Value>(&line) {
                                if value.get("id") == Some(&serde_json::json!(2)) {
                                    if let Some(result) = value.get("result") {
                                        tools = result.get("tools").cloned();
                                        break;
                                    }
                                }
                            }
                        }
                        _ => break,
                    }
                }
                line = stderr_lines.next_line() => {
                    if matches!(line, Ok(None) | Err(_)) {
                        break;
                    }
                }
            }
        }
        tools
    })
    .await;

    let _ = child.kill().await;

    match read_result {
        Ok(Some(tools_value)) => {
            let raw: Vec<serde_json::Value> = serde_json::from_value(tools_value)?;
            Ok(raw
                .into_iter()
                .map(|v| ToolDescriptor {
                    name: v.get("name").and_then(|n| n.as_str()).unwrap_or_default().to_string(),
                    description: v
                        .get("description")
                        .and_then(|d| d.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    input_schema: v.get("inputSchema").cloned().unwrap_or(serde_json::json!({})),
                    category: String::new(),
                    child_id: descriptor.id.clone(),
                    discovered_at: chrono::Utc::now(),
                })
                .collect())
        }
        Ok(None) => Err(DiscoveryError::Exhausted(descriptor.id.clone())),
        Err(_) => Err(DiscoveryError::Timeout(descriptor.id.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::child::RuntimeKind;

    fn failing_descriptor() -> ChildDescriptor {
        ChildDescriptor {
            id: "broken".into(),
            display_name: "Broken".into(),
            runtime_kind: RuntimeKind::Native,
            working_dir: "/nonexistent-path-xyz".into(),
            executable: "/nonexistent-path-xyz/bin".into(),
            args: vec![],
            env_overlay: HashMap::new(),
            category: "test".into(),
            required_creds: vec![],
            tool_limit: None,
        }
    }

    #[tokio::test]
    async fn discovery_session_errors_on_spawn_failure() {
        let result = run_discovery_session(&failing_descriptor()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn discover_retries_three_times_and_caches_failure() {
        let dir = tempfile::tempdir().unwrap();
        let config_store = ConfigStore::open(dir.path()).await.unwrap();
        let supervisor = ProcessSupervisor::new();
        let cache: Arc<TtlLruCache<CachedToolSet>> = Arc::new(TtlLruCache::new(16).unwrap());
        let engine = DiscoveryEngine::new(config_store, supervisor, cache.clone());

        let outcome = engine.discover(&failing_descriptor()).await;
        assert!(outcome.tools.is_empty());
        let retry_attempts = outcome
            .diagnostics
            .iter()
            .filter(|d| d.kind == "retry_attempt")
            .count();
        assert_eq!(retry_attempts, 3);
        assert!(outcome.diagnostics.iter().any(|d| d.kind == "tool_discovery_failed"));

        let cached = cache.get("broken").unwrap();
        assert!(matches!(cached.status, crate::domain::tool::DiscoveryStatus::Error));
    }

    fn empty_tool_set_descriptor() -> ChildDescriptor {
        ChildDescriptor {
            id: "quiet".into(),
            display_name: "Quiet".into(),
            runtime_kind: RuntimeKind::Native,
            working_dir: std::env::temp_dir(),
            executable: "sh".into(),
            args: vec![
                "-c".into(),
                "read _l1; read _l2; read _l3; echo '{\"jsonrpc\":\"2.0\",\"id\":2,\"result\":{\"tools\":[]}}'"
                    .into(),
            ],
            env_overlay: HashMap::new(),
            category: "test".into(),
            required_creds: vec![],
            tool_limit: None,
        }
    }

    #[tokio::test]
    async fn a_child_with_zero_tools_counts_as_a_discovery_success() {
        let dir = tempfile::tempdir().unwrap();
        let config_store = ConfigStore::open(dir.path()).await.unwrap();
        let supervisor = ProcessSupervisor::new();
        let cache: Arc<TtlLruCache<CachedToolSet>> = Arc::new(TtlLruCache::new(16).unwrap());
        let engine = DiscoveryEngine::new(config_store, supervisor, cache);

        let outcome = engine.discover(&empty_tool_set_descriptor()).await;
        assert!(outcome.tools.is_empty());
        assert!(outcome.succeeded);
        assert!(!outcome.diagnostics.iter().any(|d| d.kind == "tool_discovery_failed"));
    }
}
