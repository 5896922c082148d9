// Copyright (c) 2026 Fleetmux Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Control API (C8): the HTTP read/write surface over C3-C7 consumed by an
//! external UI. The core only exposes the handlers — the UI itself is a
//! separate front-end, out of scope here.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::application::router_service::RouterService;
use crate::domain::child::{ChildDescriptor, RuntimeKind};
use crate::domain::profile::Profile;
use crate::infrastructure::config_store::ConfigStore;
use crate::infrastructure::discovery::DiscoveryEngine;
use crate::infrastructure::process_supervisor::ProcessSupervisor;
use crate::infrastructure::usage_tracker::UsageTracker;

pub struct AppState {
    pub config_store: Arc<ConfigStore>,
    pub supervisor: Arc<ProcessSupervisor>,
    pub discovery: Arc<DiscoveryEngine>,
    pub router: Arc<RouterService>,
    pub tracker: Arc<UsageTracker>,
}

/// Builds the Control API router.
/// `tower_http::TraceLayer` wraps every route so request handling shows up
/// in the same structured log stream as the rest of the orchestrator.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(liveness))
        .route("/api/servers", get(list_servers))
        .route("/api/servers/install", post(install_server))
        .route("/api/servers/{id}/start", post(start_server))
        .route("/api/servers/{id}/stop", post(stop_server))
        .route("/api/servers/{id}/logs", get(server_logs))
        .route("/api/servers/{id}/credentials", get(server_credentials))
        .route("/api/profiles", get(list_profiles).post(create_profile))
        .route(
            "/api/profiles/active",
            get(get_active_profile).post(set_active_profile),
        )
        .route(
            "/api/profiles/{id}",
            get(get_profile).put(update_profile).delete(delete_profile),
        )
        .route("/api/analytics", get(analytics))
        .route("/api/analytics/insights", get(insights))
        .route("/api/performance/cache", get(cache_stats))
        .route("/api/performance/pools", get(pool_stats))
        .route("/api/system/health", get(system_health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn error_body(message: impl Into<String>) -> serde_json::Value {
    json!({ "error": message.into() })
}

async fn liveness() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Clone, serde::Serialize)]
struct ServerSummary {
    #[serde(flatten)]
    descriptor: ChildDescriptor,
    status: crate::domain::child::ChildState,
}

async fn list_servers(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let descriptors = state.config_store.list_children().await;
    let mut summaries = Vec::with_capacity(descriptors.len());
    for descriptor in descriptors {
        let status = state
            .supervisor
            .status_of(&descriptor.id)
            .await
            .unwrap_or_default();
        summaries.push(ServerSummary { descriptor, status });
    }
    Json(json!({ "servers": summaries }))
}

/// Minimal built-in catalog of known child templates, keyed by `server_id`.
/// Installing a server not in this catalog requires supplying the full
/// descriptor shape under `config` (see [`InstallServerRequest::into_descriptor`]).
fn known_template(server_id: &str) -> Option<ChildDescriptor> {
    let (display_name, runtime_kind, category, required_creds): (&str, RuntimeKind, &str, &[&str]) =
        match server_id {
            "github" => ("GitHub", RuntimeKind::Node, "vcs", &["GITHUB_PERSONAL_ACCESS_TOKEN"]),
            "slack" => ("Slack", RuntimeKind::Node, "messaging", &["SLACK_BOT_TOKEN"]),
            "postgres" => ("Postgres", RuntimeKind::Node, "database", &["DATABASE_URL"]),
            "filesystem" => ("Filesystem", RuntimeKind::Node, "utility", &[]),
            _ => return None,
        };
    Some(ChildDescriptor {
        id: server_id.to_string(),
        display_name: display_name.to_string(),
        runtime_kind,
        working_dir: PathBuf::from("servers").join(server_id),
        executable: "node".to_string(),
        args: vec!["dist/server.js".to_string()],
        env_overlay: HashMap::new(),
        category: category.to_string(),
        required_creds: required_creds.iter().map(|s| s.to_string()).collect(),
        tool_limit: None,
    })
}

#[derive(Debug, Deserialize)]
struct InstallServerRequest {
    server_id: String,
    #[serde(default)]
    config: HashMap<String, serde_json::Value>,
}

impl InstallServerRequest {
    /// `config` values that are plain strings become the env overlay /
    /// credential set checked against `requiredCreds`; non-string values are
    /// ignored for that purpose (credentials are always env-var strings).
    fn provided_env(&self) -> HashMap<String, String> {
        self.config
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
            .collect()
    }

    fn descriptor(&self) -> Option<ChildDescriptor> {
        known_template(&self.server_id)
    }
}

async fn install_server(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<InstallServerRequest>,
) -> impl IntoResponse {
    let Some(mut descriptor) = payload.descriptor() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(error_body(format!("unknown server: {}", payload.server_id))),
        );
    };
    let provided_env = payload.provided_env();
    descriptor.env_overlay = provided_env.clone();

    match state.config_store.install_child(descriptor, &provided_env).await {
        Ok(()) => {
            state
                .supervisor
                .register(state.config_store.get_child(&payload.server_id).await.unwrap())
                .await;
            (StatusCode::OK, Json(json!({ "status": "installed" })))
        }
        Err(crate::domain::errors::ConfigError::MissingCredential(name, display_name)) => (
            StatusCode::BAD_REQUEST,
            Json(error_body(format!("{name} is required for {display_name}"))),
        ),
        Err(err) => (StatusCode::BAD_REQUEST, Json(error_body(err.to_string()))),
    }
}

async fn start_server(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> impl IntoResponse {
    match state.supervisor.start(&id).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "starting" }))),
        Err(err) => (StatusCode::BAD_REQUEST, Json(error_body(err.to_string()))),
    }
}

async fn stop_server(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> impl IntoResponse {
    match state.supervisor.stop(&id).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "stopped" }))),
        Err(err) => (StatusCode::BAD_REQUEST, Json(error_body(err.to_string()))),
    }
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    limit: Option<usize>,
}

async fn server_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> impl IntoResponse {
    match state.supervisor.logs_of(&id, query.limit.unwrap_or(100)).await {
        Ok(lines) => (StatusCode::OK, Json(json!({ "logs": lines }))),
        Err(err) => (StatusCode::NOT_FOUND, Json(error_body(err.to_string()))),
    }
}

async fn server_credentials(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.config_store.get_child(&id).await {
        Ok(descriptor) => (
            StatusCode::OK,
            Json(json!({ "requiredCreds": descriptor.required_creds })),
        ),
        Err(err) => (StatusCode::NOT_FOUND, Json(error_body(err.to_string()))),
    }
}

async fn list_profiles(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "profiles": state.config_store.list_profiles().await }))
}

async fn create_profile(
    State(state): State<Arc<AppState>>,
    Json(profile): Json<Profile>,
) -> impl IntoResponse {
    match state.config_store.create_profile(profile).await {
        Ok(()) => (StatusCode::CREATED, Json(json!({ "status": "created" }))),
        Err(err) => (StatusCode::BAD_REQUEST, Json(error_body(err.to_string()))),
    }
}

async fn get_profile(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> impl IntoResponse {
    match state.config_store.get_profile(&id).await {
        Ok(profile) => (StatusCode::OK, Json(serde_json::to_value(profile).unwrap())),
        Err(err) => (StatusCode::NOT_FOUND, Json(error_body(err.to_string()))),
    }
}

async fn update_profile(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(mut profile): Json<Profile>,
) -> impl IntoResponse {
    profile.id = id;
    match state.config_store.update_profile(profile).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "updated" }))),
        Err(err) => (StatusCode::BAD_REQUEST, Json(error_body(err.to_string()))),
    }
}

async fn delete_profile(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> impl IntoResponse {
    match state.config_store.delete_profile(&id).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "deleted" }))),
        Err(err) => (StatusCode::BAD_REQUEST, Json(error_body(err.to_string()))),
    }
}

async fn get_active_profile(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.config_store.get_active_profile().await {
        Ok(profile) => (StatusCode::OK, Json(serde_json::to_value(profile).unwrap())),
        Err(err) => (StatusCode::NOT_FOUND, Json(error_body(err.to_string()))),
    }
}

#[derive(Debug, Deserialize)]
struct SetActiveRequest {
    #[serde(rename = "profileId", alias = "id")]
    profile_id: String,
}

async fn set_active_profile(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SetActiveRequest>,
) -> impl IntoResponse {
    match state.config_store.set_active(&payload.profile_id).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "active" }))),
        Err(err) => (StatusCode::BAD_REQUEST, Json(error_body(err.to_string()))),
    }
}

#[derive(Debug, Deserialize)]
struct AnalyticsQuery {
    #[serde(default)]
    period: Option<String>,
    #[serde(default)]
    days: Option<u32>,
}

async fn analytics(State(state): State<Arc<AppState>>, Query(query): Query<AnalyticsQuery>) -> impl IntoResponse {
    let days = query.days.unwrap_or(7);
    let _period = query.period.unwrap_or_else(|| "daily".to_string());
    Json(state.tracker.analytics(days).await)
}

#[derive(Debug, Deserialize)]
struct InsightsQuery {
    #[serde(default)]
    days: Option<u32>,
}

async fn insights(State(state): State<Arc<AppState>>, Query(query): Query<InsightsQuery>) -> impl IntoResponse {
    Json(state.tracker.insights(query.days.unwrap_or(7)).await)
}

async fn cache_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "tools": state.discovery.tools_cache_stats(),
        "response": state.router.response_cache_stats(),
    }))
}

async fn pool_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "pools": state.router.pool_stats() }))
}

async fn system_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let profile = state.config_store.get_active_profile().await.ok();
    let children = state.config_store.list_children().await;
    let mut running = 0usize;
    for child in &children {
        if let Ok(status) = state.supervisor.status_of(&child.id).await {
            if status.status == crate::domain::child::ChildStatus::Running {
                running += 1;
            }
        }
    }
    Json(json!({
        "status": "ok",
        "activeProfile": profile.map(|p| p.id),
        "totalChildren": children.len(),
        "runningChildren": running,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn test_state() -> Arc<AppState> {
        let dir = tempfile::tempdir().unwrap();
        let config_store = ConfigStore::open(dir.path()).await.unwrap();
        let supervisor = ProcessSupervisor::new();
        let tools_cache = Arc::new(crate::infrastructure::cache::TtlLruCache::new(
            crate::infrastructure::cache::TOOLS_CACHE_CAPACITY,
        ).unwrap());
        let discovery = Arc::new(DiscoveryEngine::new(config_store.clone(), supervisor.clone(), tools_cache));
        let tracker = UsageTracker::new(dir.path());
        let router = RouterService::new(config_store.clone(), supervisor.clone(), discovery.clone(), tracker.clone());
        Arc::new(AppState { config_store, supervisor, discovery, router, tracker })
    }

    #[tokio::test]
    async fn health_is_always_ok() {
        let state = test_state().await;
        let response = app(state)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn fresh_boot_exposes_development_as_active() {
        let state = test_state().await;
        let response = app(state)
            .oneshot(Request::builder().uri("/api/profiles/active").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["id"], "development");
    }

    #[tokio::test]
    async fn install_rejects_missing_credential_with_400() {
        let state = test_state().await;
        let body = json!({ "server_id": "github", "config": {} }).to_string();
        let response = app(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/servers/install")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let payload: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(payload["error"], "GITHUB_PERSONAL_ACCESS_TOKEN is required for GitHub");
    }

    #[tokio::test]
    async fn install_unknown_server_is_400() {
        let state = test_state().await;
        let body = json!({ "server_id": "not-a-real-server", "config": {} }).to_string();
        let response = app(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/servers/install")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn analytics_with_no_calls_never_errors() {
        let state = test_state().await;
        let response = app(state)
            .oneshot(Request::builder().uri("/api/analytics?days=0").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
