// Copyright (c) 2026 Fleetmux Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Wires C1-C8 together and runs the orchestrator process until shutdown.
//! One OS process embeds everything — there is no separate daemon to
//! delegate to (see DESIGN.md for why that split isn't needed here).

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

use fleetmux_core::application::router_service::RouterService;
use fleetmux_core::infrastructure::cache::{TtlLruCache, TOOLS_CACHE_CAPACITY};
use fleetmux_core::infrastructure::config_store::{self, ConfigStore};
use fleetmux_core::infrastructure::discovery::DiscoveryEngine;
use fleetmux_core::infrastructure::process_supervisor::ProcessSupervisor;
use fleetmux_core::infrastructure::usage_tracker::UsageTracker;
use fleetmux_core::presentation::control_api::{self, AppState};
use fleetmux_core::presentation::{stdio, ws};

use crate::cli::{Cli, Transport};

/// Installs one global `tracing` subscriber, level driven by `--log-level`
/// (itself falling back to `RUST_LOG`), compact formatter, no per-component
/// loggers.
pub fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_new(level)
        .context("invalid log level / RUST_LOG filter")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init()
        .ok();
    Ok(())
}

fn resolve_config_dir(cli: &Cli) -> std::path::PathBuf {
    cli.config_dir.clone().unwrap_or_else(config_store::default_data_dir)
}

fn resolve_data_dir(cli: &Cli, config_dir: &std::path::Path) -> std::path::PathBuf {
    cli.data_dir.clone().unwrap_or_else(|| config_dir.to_path_buf())
}

/// Runs the one-shot `--health-check` path: confirms the Config Store opens
/// cleanly against `--config-dir` without serving anything. This is a local
/// self-test, not a network probe of a separately running instance — the
/// orchestrator makes no outbound HTTP calls (DESIGN.md), so a liveness
/// check against a peer process is out of scope here.
async fn health_check(cli: &Cli) -> bool {
    let config_dir = resolve_config_dir(cli);
    ConfigStore::open(&config_dir).await.is_ok()
}

/// Returns the process exit code: 0 success, 1 fatal init, 2 health-check
/// failure.
pub async fn run(cli: Cli) -> Result<i32> {
    init_logging(&cli.log_level)?;

    if cli.health_check {
        return Ok(if health_check(&cli).await { 0 } else { 2 });
    }

    let config_dir = resolve_config_dir(&cli);
    let data_dir = resolve_data_dir(&cli, &config_dir);

    let config_store = match ConfigStore::open(&config_dir).await {
        Ok(store) => store,
        Err(err) => {
            tracing::error!(error = %err, "failed to open config store");
            return Ok(1);
        }
    };

    let supervisor = ProcessSupervisor::new();
    for descriptor in config_store.list_children().await {
        supervisor.register(descriptor).await;
    }

    let tools_cache = Arc::new(
        TtlLruCache::new(TOOLS_CACHE_CAPACITY).expect("nonzero tools cache capacity"),
    );
    let discovery = Arc::new(DiscoveryEngine::new(
        config_store.clone(),
        supervisor.clone(),
        tools_cache,
    ));
    let tracker = UsageTracker::new(&data_dir);
    let router = RouterService::new(config_store.clone(), supervisor.clone(), discovery.clone(), tracker.clone());

    let control_state = Arc::new(AppState {
        config_store: config_store.clone(),
        supervisor: supervisor.clone(),
        discovery: discovery.clone(),
        router: router.clone(),
        tracker: tracker.clone(),
    });

    let cancel = CancellationToken::new();

    let control_listener = TcpListener::bind(("127.0.0.1", cli.ui_port))
        .await
        .with_context(|| format!("failed to bind control API on port {}", cli.ui_port))?;
    info!(port = cli.ui_port, "control API listening");
    let control_cancel = cancel.clone();
    let control_task = tokio::spawn(async move {
        let _ = axum::serve(control_listener, control_api::app(control_state))
            .with_graceful_shutdown(control_cancel.cancelled_owned())
            .await;
    });

    let upstream_task = match cli.transport {
        Transport::Stdio => {
            let router = router.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                stdio::run(router, cancel).await;
            })
        }
        Transport::Websocket => {
            let listener = TcpListener::bind(("127.0.0.1", cli.port))
                .await
                .with_context(|| format!("failed to bind upstream websocket on port {}", cli.port))?;
            info!(port = cli.port, "upstream websocket listening");
            let app = axum::Router::new()
                .route("/ws", axum::routing::get(ws::upgrade))
                .with_state(router.clone());
            let ws_cancel = cancel.clone();
            tokio::spawn(async move {
                let _ = axum::serve(listener, app)
                    .with_graceful_shutdown(ws_cancel.cancelled_owned())
                    .await;
            })
        }
    };

    tokio::select! {
        _ = shutdown_signal() => info!("shutdown signal received"),
        _ = upstream_task => info!("upstream transport exited"),
    }

    cancel.cancel();
    let _ = control_task.await;
    supervisor.stop_all().await;
    let _ = tracker.flush().await;

    Ok(0)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
