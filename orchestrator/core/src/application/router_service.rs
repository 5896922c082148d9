// Copyright (c) 2026 Fleetmux Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Proxy Router (C6): one upstream JSON-RPC endpoint that aggregates tools
//! across every child and dispatches `tools/call`. Composes the Discovery
//! Engine (C5), the per-child connection pools (C2), the response cache
//! (C1), and the Usage Tracker (C7) behind the active Profile's policy.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use governor::{Quota, RateLimiter};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::domain::child::ChildStatus;
use crate::domain::connection::PoolConfig;
use crate::domain::errors::RouterError;
use crate::domain::jsonrpc::InitializeResult;
use crate::domain::profile::Profile;
use crate::domain::tool::ToolDescriptor;
use crate::infrastructure::cache::{self, TtlLruCache, RESPONSE_CACHE_CAPACITY, RESPONSE_CACHE_TTL};
use crate::infrastructure::child_session::{ChildSessionFactory, PerChildFactory};
use crate::infrastructure::config_store::ConfigStore;
use crate::infrastructure::discovery::DiscoveryEngine;
use crate::infrastructure::pool::ConnectionPool;
use crate::infrastructure::process_supervisor::ProcessSupervisor;
use crate::infrastructure::usage_tracker::UsageTracker;

const SERVER_NAME: &str = "fleetmux";
const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default breaker tuning for every per-child pool; not currently
/// per-child-configurable (no field for it in `ChildDescriptor`).
const POOL_MAX_FAILURES: u32 = 5;
const POOL_OPEN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
struct CachedResponse {
    body: Value,
    bytes: u64,
}

/// One tool as it appears in a merged `tools/list` response: the name the
/// upstream client sees (possibly `{childId}__{name}` after a collision)
/// alongside the underlying descriptor needed to route a subsequent call.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RoutedTool {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
    pub category: String,
    #[serde(rename = "childId")]
    pub child_id: String,
}

pub struct RouterService {
    config_store: Arc<ConfigStore>,
    supervisor: Arc<ProcessSupervisor>,
    discovery: Arc<DiscoveryEngine>,
    tracker: Arc<UsageTracker>,
    session_factory: Arc<ChildSessionFactory>,
    pools: DashMap<String, Arc<ConnectionPool>>,
    response_cache: Arc<TtlLruCache<CachedResponse>>,
    /// One direct `governor` limiter per profile, held in a `dashmap` so
    /// concurrent `tools/call`s for different profiles never contend on a
    /// single map lock; each profile's `limits.ratePerMinute` becomes that
    /// limiter's quota the first time the profile is used.
    rate_limiters: DashMap<String, Arc<governor::DefaultDirectRateLimiter>>,
}

impl RouterService {
    pub fn new(
        config_store: Arc<ConfigStore>,
        supervisor: Arc<ProcessSupervisor>,
        discovery: Arc<DiscoveryEngine>,
        tracker: Arc<UsageTracker>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config_store,
            session_factory: ChildSessionFactory::new(supervisor.clone()),
            supervisor,
            discovery,
            tracker,
            pools: DashMap::new(),
            response_cache: Arc::new(
                TtlLruCache::new(RESPONSE_CACHE_CAPACITY).expect("nonzero capacity"),
            ),
            rate_limiters: DashMap::new(),
        })
    }

    pub fn initialize(&self) -> InitializeResult {
        InitializeResult::current(SERVER_NAME, SERVER_VERSION)
    }

    /// Merges the discovered catalog, filters it by the active profile, and
    /// resolves name collisions deterministically (priority ascending, then
    /// child id lexicographic); truncates to `limits.maxToolsTotal` last.
    pub async fn tools_list(&self) -> Result<Vec<RoutedTool>, RouterError> {
        let profile = self.config_store.get_active_profile().await.map_err(|_| {
            RouterError::ChildNotReady("<no active profile>".to_string())
        })?;
        let outcome = self.discovery.discover_all().await;
        Ok(merge_catalog(&profile, outcome.tools))
    }

    /// Routes a `tools/call` for the upstream-visible `display_name`: starts
    /// the child if needed, serves from the response cache when possible,
    /// otherwise acquires a pooled connection, forwards the call, records it,
    /// and caches the response.
    pub async fn call_tool(
        &self,
        display_name: &str,
        arguments: Value,
    ) -> Result<(Value, u64), RouterError> {
        let profile = self.config_store.get_active_profile().await.map_err(|_| {
            RouterError::ChildNotReady("<no active profile>".to_string())
        })?;

        if !self.check_rate_limit(&profile) {
            return Err(RouterError::RateLimitExceeded(profile.id.clone()));
        }

        let catalog = self.tools_list().await?;
        let routed = catalog
            .into_iter()
            .find(|t| t.name == display_name)
            .ok_or_else(|| RouterError::ToolNotFound(display_name.to_string()))?;

        self.ensure_running(&routed.child_id).await?;

        let cache_key = cache::response_cache_key(&routed.name, &routed.child_id, &arguments);
        if let Some(cached) = self.response_cache.get(&cache_key) {
            return Ok((cached.body, cached.bytes));
        }

        let handle = self.tracker.start(
            routed.name.clone(),
            routed.child_id.clone(),
            profile.id.clone(),
            arguments.clone(),
        );

        let pool = self.pool_for(&routed.child_id);
        let cancel = CancellationToken::new();
        let conn = pool.acquire(&cancel).await?;

        // Underlying tool name is `routed.name`'s un-prefixed suffix when a
        // collision occurred; the descriptor's own `name` field (pre-merge)
        // is what the child actually registered, so strip any prefix we
        // added rather than forward the upstream-visible alias downstream.
        let downstream_name = routed
            .name
            .strip_prefix(&format!("{}__", routed.child_id))
            .unwrap_or(&routed.name);

        let call_result = self
            .session_factory
            .call(
                &routed.child_id,
                "tools/call",
                serde_json::json!({ "name": downstream_name, "arguments": arguments }),
            )
            .await;

        match call_result {
            Ok(result) => {
                let bytes = serde_json::to_vec(&result).map(|v| v.len() as u64).unwrap_or(0);
                pool.release(conn.id, true);
                self.tracker.complete(handle, true, None, bytes).await;
                self.response_cache.set(
                    cache_key,
                    CachedResponse { body: result.clone(), bytes },
                    RESPONSE_CACHE_TTL,
                );
                Ok((result, bytes))
            }
            Err(err) => {
                pool.release(conn.id, false);
                self.tracker.complete(handle, false, Some(err.to_string()), 0).await;
                Err(RouterError::Pool(err))
            }
        }
    }

    async fn ensure_running(&self, child_id: &str) -> Result<(), RouterError> {
        let state = self
            .supervisor
            .status_of(child_id)
            .await
            .map_err(|_| RouterError::ChildNotReady(child_id.to_string()))?;
        if state.status == ChildStatus::Running {
            return Ok(());
        }
        if state.can_start() {
            self.supervisor
                .start(child_id)
                .await
                .map_err(|_| RouterError::ChildNotReady(child_id.to_string()))?;
            return Ok(());
        }
        Err(RouterError::ChildNotReady(child_id.to_string()))
    }

    fn pool_for(&self, child_id: &str) -> Arc<ConnectionPool> {
        if let Some(pool) = self.pools.get(child_id) {
            return pool.clone();
        }
        let factory = Arc::new(PerChildFactory {
            child_id: child_id.to_string(),
            shared: self.session_factory.clone(),
        });
        let pool = Arc::new(ConnectionPool::new(
            child_id.to_string(),
            PoolConfig::default(),
            factory,
            POOL_MAX_FAILURES,
            POOL_OPEN_TIMEOUT,
        ));
        self.pools.insert(child_id.to_string(), pool.clone());
        let bg_pool = pool.clone();
        let cancel = CancellationToken::new();
        tokio::spawn(bg_pool.clone().run_health_check_loop(cancel.clone()));
        tokio::spawn(bg_pool.run_idle_eviction_loop(cancel));
        pool
    }

    fn check_rate_limit(&self, profile: &Profile) -> bool {
        let limiter = self
            .rate_limiters
            .entry(profile.id.clone())
            .or_insert_with(|| {
                let per_minute = NonZeroU32::new(profile.limits.rate_per_minute.max(1)).unwrap();
                Arc::new(RateLimiter::direct(Quota::per_minute(per_minute)))
            })
            .clone();
        limiter.check().is_ok()
    }

    pub fn pool_stats(&self) -> Vec<crate::domain::connection::PoolStats> {
        self.pools.iter().map(|p| p.stats()).collect()
    }

    pub fn response_cache_stats(&self) -> cache::CacheStats {
        self.response_cache.stats()
    }
}

/// Applies the active profile's child/category/name filters and per-child
/// caps, then sorts by `(priority asc, childId asc, name asc)` and resolves
/// name collisions by prefixing every loser with `{childId}__`. Truncation
/// to `limits.maxToolsTotal` happens last, in that same sorted order.
fn merge_catalog(profile: &Profile, tools: Vec<ToolDescriptor>) -> Vec<RoutedTool> {
    let mut by_child: std::collections::HashMap<String, Vec<ToolDescriptor>> =
        std::collections::HashMap::new();
    for tool in tools {
        if !profile.allows_child(&tool.child_id) {
            continue;
        }
        if !profile.tool_filter.allows(&tool.name, &tool.category) {
            continue;
        }
        by_child.entry(tool.child_id.clone()).or_default().push(tool);
    }

    let mut filtered = Vec::new();
    for (child_id, mut child_tools) in by_child {
        child_tools.sort_by(|a, b| a.name.cmp(&b.name));
        let cap = profile
            .per_child_overrides
            .get(&child_id)
            .and_then(|o| o.max_tools)
            .unwrap_or(profile.limits.max_tools_per_child) as usize;
        child_tools.truncate(cap);
        filtered.extend(child_tools);
    }

    filtered.sort_by(|a, b| {
        profile
            .priority_for(&a.child_id)
            .cmp(&profile.priority_for(&b.child_id))
            .then_with(|| a.child_id.cmp(&b.child_id))
            .then_with(|| a.name.cmp(&b.name))
    });

    let mut seen_names = std::collections::HashSet::new();
    let mut routed: Vec<RoutedTool> = filtered
        .into_iter()
        .map(|tool| {
            let name = if seen_names.insert(tool.name.clone()) {
                tool.name.clone()
            } else {
                format!("{}__{}", tool.child_id, tool.name)
            };
            RoutedTool {
                name,
                description: tool.description,
                input_schema: tool.input_schema,
                category: tool.category,
                child_id: tool.child_id,
            }
        })
        .collect();

    routed.truncate(profile.limits.max_tools_total as usize);
    routed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::profile::{PerChildOverride, Profile};
    use chrono::Utc;

    fn tool(child_id: &str, name: &str) -> ToolDescriptor {
        ToolDescriptor {
            name: name.to_string(),
            description: String::new(),
            input_schema: serde_json::json!({}),
            category: "test".to_string(),
            child_id: child_id.to_string(),
            discovered_at: Utc::now(),
        }
    }

    #[test]
    fn name_collision_prefixes_the_lower_priority_child() {
        let mut profile = Profile::new("p");
        profile.per_child_overrides.insert(
            "a".to_string(),
            PerChildOverride { priority: 1, max_tools: None, allowed_categories: vec![] },
        );
        profile.per_child_overrides.insert(
            "b".to_string(),
            PerChildOverride { priority: 2, max_tools: None, allowed_categories: vec![] },
        );

        let tools = vec![tool("b", "search"), tool("a", "search")];
        let routed = merge_catalog(&profile, tools);

        let a_search = routed.iter().find(|t| t.child_id == "a").unwrap();
        let b_search = routed.iter().find(|t| t.child_id == "b").unwrap();
        assert_eq!(a_search.name, "search");
        assert_eq!(b_search.name, "b__search");
    }

    #[test]
    fn tool_filter_excludes_disallowed_categories() {
        let mut profile = Profile::new("p");
        profile.tool_filter.exclude_categories.push("danger".to_string());
        let mut t = tool("a", "delete_everything");
        t.category = "danger".to_string();
        let routed = merge_catalog(&profile, vec![t]);
        assert!(routed.is_empty());
    }

    #[test]
    fn max_tools_total_truncates_after_sorting() {
        let mut profile = Profile::new("p");
        profile.limits.max_tools_total = 1;
        let tools = vec![tool("a", "zeta"), tool("a", "alpha")];
        let routed = merge_catalog(&profile, tools);
        assert_eq!(routed.len(), 1);
        assert_eq!(routed[0].name, "alpha");
    }
}
