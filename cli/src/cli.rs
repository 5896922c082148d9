// Copyright (c) 2026 Fleetmux Contributors
// SPDX-License-Identifier: AGPL-3.0

//! CLI surface: `orchestrator [--config-dir=PATH] [--health-check]` plus
//! the full flag set, every flag falling back to an environment variable
//! via `#[arg(env = "...")]`.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Which upstream Tool Protocol transport this invocation serves; both must
/// be supported, but one process picks one per invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lowercase")]
pub enum Transport {
    Stdio,
    Websocket,
}

#[derive(Parser, Debug)]
#[command(name = "orchestrator")]
#[command(version, about = "Tool Protocol orchestrator: fleet proxy, discovery, supervisor", long_about = None)]
pub struct Cli {
    /// Directory holding profiles/ and servers/ (Config Store root).
    #[arg(long = "config-dir", env = "MCP_ORCHESTRATOR_CONFIG_DIR", value_name = "PATH")]
    pub config_dir: Option<PathBuf>,

    /// Directory holding analytics/ journals (Usage Tracker root). Defaults
    /// to the config directory when not given.
    #[arg(long = "data-dir", env = "MCP_ORCHESTRATOR_DATA_DIR", value_name = "PATH")]
    pub data_dir: Option<PathBuf>,

    /// Upstream Tool Protocol transport port (only used when
    /// `--transport websocket`).
    #[arg(long, env = "PORT", default_value_t = 3333)]
    pub port: u16,

    /// HTTP Control API port (C8).
    #[arg(long = "ui-port", env = "UI_PORT", default_value_t = 8080)]
    pub ui_port: u16,

    /// Log level (trace/debug/info/warn/error). `RUST_LOG` overrides this
    /// when set, since it is read as this flag's own env fallback.
    #[arg(long = "log-level", env = "RUST_LOG", default_value = "info")]
    pub log_level: String,

    /// Which upstream transport to serve on `--port`.
    #[arg(long, value_enum, default_value_t = Transport::Stdio)]
    pub transport: Transport,

    /// Run a one-shot readiness check (Config Store opens cleanly) and exit
    /// instead of serving. Exit code 2 on failure.
    #[arg(long = "health-check")]
    pub health_check: bool,
}
